//! Recharge history store
//!
//! Implements:
//! - In-memory store (default, tests)
//! - JSON file store, one document rewritten through a temp file + rename

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use recarga_core::PointId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::HistoryError;

/// Timestamp layout used in the history file
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One completed charge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RechargeRecord {
    pub plate: String,
    pub point_id: PointId,
    pub timestamp: DateTime<Utc>,
    pub consumed_kwh: f64,
    pub amount_due: f64,
}

impl RechargeRecord {
    pub fn new(plate: impl Into<String>, point_id: PointId, consumed_kwh: f64, amount_due: f64) -> Self {
        Self {
            plate: plate.into(),
            point_id,
            timestamp: Utc::now(),
            consumed_kwh,
            amount_due,
        }
    }

    fn validate(&self) -> Result<(), HistoryError> {
        if self.plate.is_empty() {
            return Err(HistoryError::InvalidRecord("plate must not be empty"));
        }
        if self.point_id < 1 {
            return Err(HistoryError::InvalidRecord("point id must be positive"));
        }
        if !(self.amount_due > 0.0) {
            return Err(HistoryError::InvalidRecord("amount must be positive"));
        }
        Ok(())
    }
}

/// Per-vehicle charge history
pub trait HistoryStore: Send + Sync {
    /// Make a plate known, with no charges yet
    fn register_plate(&self, plate: &str) -> Result<(), HistoryError>;

    fn append(&self, record: RechargeRecord) -> Result<(), HistoryError>;

    /// Charges of `plate` in the order they were appended
    fn query(&self, plate: &str) -> Result<Vec<RechargeRecord>, HistoryError>;

    fn plate_exists(&self, plate: &str) -> bool;
}

/// Volatile history store
#[derive(Default)]
pub struct MemoryHistory {
    vehicles: Mutex<HashMap<String, Vec<RechargeRecord>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistory {
    fn register_plate(&self, plate: &str) -> Result<(), HistoryError> {
        self.vehicles.lock().entry(plate.to_string()).or_default();
        Ok(())
    }

    fn append(&self, record: RechargeRecord) -> Result<(), HistoryError> {
        record.validate()?;
        self.vehicles
            .lock()
            .entry(record.plate.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    fn query(&self, plate: &str) -> Result<Vec<RechargeRecord>, HistoryError> {
        Ok(self.vehicles.lock().get(plate).cloned().unwrap_or_default())
    }

    fn plate_exists(&self, plate: &str) -> bool {
        self.vehicles.lock().contains_key(plate)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(rename = "veiculos", default)]
    vehicles: Vec<StoredVehicle>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredVehicle {
    #[serde(rename = "placa")]
    plate: String,
    #[serde(rename = "recargas", default)]
    charges: Vec<StoredCharge>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCharge {
    #[serde(rename = "data")]
    date: String,
    #[serde(rename = "ponto_id")]
    point_id: PointId,
    #[serde(rename = "consumo_kwh", default)]
    consumed_kwh: f64,
    #[serde(rename = "valor")]
    amount: f64,
}

impl StoredCharge {
    fn to_record(&self, plate: &str) -> RechargeRecord {
        let timestamp = NaiveDateTime::parse_from_str(&self.date, DATE_FORMAT)
            .map(|naive| naive.and_utc())
            .unwrap_or_else(|_| {
                warn!("History: unreadable date {:?} for {}", self.date, plate);
                DateTime::<Utc>::default()
            });
        RechargeRecord {
            plate: plate.to_string(),
            point_id: self.point_id,
            timestamp,
            consumed_kwh: self.consumed_kwh,
            amount_due: self.amount,
        }
    }
}

/// History persisted as a single JSON document
pub struct JsonFileHistory {
    path: PathBuf,
    // serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl JsonFileHistory {
    /// Open (or lazily create) the history file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        info!("History: using {}", path.display());
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HistoryFile, HistoryError> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(HistoryFile::default()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HistoryFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, file: &HistoryFile) -> Result<(), HistoryError> {
        // Write to temp file then rename (atomic)
        let mut temp_name = self.path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let data = serde_json::to_string_pretty(file)?;
        fs::write(&temp_path, &data)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl HistoryStore for JsonFileHistory {
    fn register_plate(&self, plate: &str) -> Result<(), HistoryError> {
        let _guard = self.lock.lock();
        let mut file = self.load()?;
        if file.vehicles.iter().any(|v| v.plate == plate) {
            return Ok(());
        }
        file.vehicles.push(StoredVehicle {
            plate: plate.to_string(),
            charges: Vec::new(),
        });
        self.save(&file)?;
        debug!("History: registered plate {}", plate);
        Ok(())
    }

    fn append(&self, record: RechargeRecord) -> Result<(), HistoryError> {
        record.validate()?;

        let _guard = self.lock.lock();
        let mut file = self.load()?;
        let charge = StoredCharge {
            date: record.timestamp.format(DATE_FORMAT).to_string(),
            point_id: record.point_id,
            consumed_kwh: record.consumed_kwh,
            amount: record.amount_due,
        };

        match file.vehicles.iter_mut().find(|v| v.plate == record.plate) {
            Some(vehicle) => vehicle.charges.push(charge),
            None => file.vehicles.push(StoredVehicle {
                plate: record.plate.clone(),
                charges: vec![charge],
            }),
        }

        self.save(&file)?;
        info!(
            "History: recorded charge of {} at point {} (R$ {:.2})",
            record.plate, record.point_id, record.amount_due
        );
        Ok(())
    }

    fn query(&self, plate: &str) -> Result<Vec<RechargeRecord>, HistoryError> {
        let _guard = self.lock.lock();
        let file = self.load()?;
        Ok(file
            .vehicles
            .iter()
            .find(|v| v.plate == plate)
            .map(|v| v.charges.iter().map(|c| c.to_record(plate)).collect())
            .unwrap_or_default())
    }

    fn plate_exists(&self, plate: &str) -> bool {
        let _guard = self.lock.lock();
        match self.load() {
            Ok(file) => file.vehicles.iter().any(|v| v.plate == plate),
            Err(e) => {
                warn!("History: failed to read {}: {}", self.path.display(), e);
                false
            }
        }
    }
}
