//! Core types for the Recarga wire protocol

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a charging point, in `[1, N]` for a region with N points
pub type PointId = u32;

/// Shortest accepted vehicle plate
pub const MIN_PLATE_LEN: usize = 6;

/// Longest accepted vehicle plate
pub const MAX_PLATE_LEN: usize = 8;

/// Declared sender of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    #[serde(rename = "vehicle", alias = "veiculo")]
    Vehicle,
    #[serde(rename = "charging-point", alias = "ponto-de-recarga")]
    ChargingPoint,
    #[serde(rename = "server", alias = "servidor")]
    Server,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Vehicle => write!(f, "vehicle"),
            Origin::ChargingPoint => write!(f, "charging-point"),
            Origin::Server => write!(f, "server"),
        }
    }
}

/// Role a connection acquires once it identifies itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Vehicle,
    ChargingPoint,
}

impl Role {
    /// Role implied by a message origin (the server has no peer role)
    pub fn from_origin(origin: Origin) -> Option<Self> {
        match origin {
            Origin::Vehicle => Some(Role::Vehicle),
            Origin::ChargingPoint => Some(Role::ChargingPoint),
            Origin::Server => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Vehicle => write!(f, "vehicle"),
            Role::ChargingPoint => write!(f, "charging-point"),
        }
    }
}

/// Message type carried in the `tipo` field.
///
/// The set is open: unknown strings survive a decode/encode cycle as
/// [`MessageKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Identify,
    IdentifyRejected,
    GetLocation,
    RegionData,
    Location,
    RequestCharge,
    Ranking,
    RequestReservation,
    ReservationConfirmed,
    ReservationFailed,
    ReservationExpired,
    NewRequest,
    QueueStatus,
    CallingVehicle,
    YourTurn,
    VehicleArrived,
    QueuePosition,
    ChargeFinished,
    ReleasePoint,
    GetAvailability,
    Availability,
    CheckPlate,
    PlateAvailable,
    PlateUnavailable,
    QueryHistory,
    History,
    HistoryError,
    Other(String),
}

impl MessageKind {
    /// Every named message type
    pub const KNOWN: [MessageKind; 27] = [
        MessageKind::Identify,
        MessageKind::IdentifyRejected,
        MessageKind::GetLocation,
        MessageKind::RegionData,
        MessageKind::Location,
        MessageKind::RequestCharge,
        MessageKind::Ranking,
        MessageKind::RequestReservation,
        MessageKind::ReservationConfirmed,
        MessageKind::ReservationFailed,
        MessageKind::ReservationExpired,
        MessageKind::NewRequest,
        MessageKind::QueueStatus,
        MessageKind::CallingVehicle,
        MessageKind::YourTurn,
        MessageKind::VehicleArrived,
        MessageKind::QueuePosition,
        MessageKind::ChargeFinished,
        MessageKind::ReleasePoint,
        MessageKind::GetAvailability,
        MessageKind::Availability,
        MessageKind::CheckPlate,
        MessageKind::PlateAvailable,
        MessageKind::PlateUnavailable,
        MessageKind::QueryHistory,
        MessageKind::History,
        MessageKind::HistoryError,
    ];

    /// Wire name of this type
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Identify => "identificacao",
            MessageKind::IdentifyRejected => "identificacao-recusada",
            MessageKind::GetLocation => "get-localizacao",
            MessageKind::RegionData => "dados-regiao",
            MessageKind::Location => "localizacao",
            MessageKind::RequestCharge => "get-recarga",
            MessageKind::Ranking => "ranking-pontos",
            MessageKind::RequestReservation => "solicitar-reserva",
            MessageKind::ReservationConfirmed => "reserva-confirmada",
            MessageKind::ReservationFailed => "reserva-falhou",
            MessageKind::ReservationExpired => "reserva-expirada",
            MessageKind::NewRequest => "nova-solicitacao",
            MessageKind::QueueStatus => "status-fila",
            MessageKind::CallingVehicle => "chamando-veiculo",
            MessageKind::YourTurn => "sua-vez",
            MessageKind::VehicleArrived => "veiculo-chegou",
            MessageKind::QueuePosition => "posicao-fila",
            MessageKind::ChargeFinished => "recarga-finalizada",
            MessageKind::ReleasePoint => "liberar-ponto",
            MessageKind::GetAvailability => "get-disponibilidade",
            MessageKind::Availability => "disponibilidade",
            MessageKind::CheckPlate => "verificar-placa",
            MessageKind::PlateAvailable => "placa-disponivel",
            MessageKind::PlateUnavailable => "placa-indisponivel",
            MessageKind::QueryHistory => "consultar-historico",
            MessageKind::History => "historico-recargas",
            MessageKind::HistoryError => "historico-erro",
            MessageKind::Other(name) => name,
        }
    }
}

impl From<String> for MessageKind {
    fn from(name: String) -> Self {
        MessageKind::KNOWN
            .iter()
            .find(|kind| kind.as_str() == name)
            .cloned()
            .unwrap_or(MessageKind::Other(name))
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "tipo")]
    pub kind: MessageKind,
    #[serde(rename = "conteudo", default)]
    pub content: String,
    #[serde(rename = "origem")]
    pub origin: Origin,
}

impl Message {
    pub fn new(kind: MessageKind, content: impl Into<String>, origin: Origin) -> Self {
        Self {
            kind,
            content: content.into(),
            origin,
        }
    }

    /// Message sent by the broker
    pub fn server(kind: MessageKind, content: impl Into<String>) -> Self {
        Self::new(kind, content, Origin::Server)
    }

    /// Message sent by a vehicle
    pub fn vehicle(kind: MessageKind, content: impl Into<String>) -> Self {
        Self::new(kind, content, Origin::Vehicle)
    }

    /// Message sent by a charging point
    pub fn point(kind: MessageKind, content: impl Into<String>) -> Self {
        Self::new(kind, content, Origin::ChargingPoint)
    }

    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Check plate shape: 6 to 8 characters, no whitespace
pub fn is_valid_plate(plate: &str) -> bool {
    let len = plate.chars().count();
    (MIN_PLATE_LEN..=MAX_PLATE_LEN).contains(&len) && !plate.chars().any(char::is_whitespace)
}

/// Extract a plate from an identification payload.
///
/// Accepts a bare plate or a sentence carrying `placa <PLATE>` / `plate <PLATE>`.
pub fn extract_plate(content: &str) -> Option<String> {
    let content = content.trim();
    if is_valid_plate(content) {
        return Some(content.to_string());
    }

    for marker in ["placa ", "plate "] {
        if let Some((_, rest)) = content.split_once(marker) {
            let candidate = rest.split_whitespace().next().unwrap_or("");
            if is_valid_plate(candidate) {
                return Some(candidate.to_string());
            }
        }
    }

    None
}

/// Queue snapshot a charging point reports in `disponibilidade`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_id: Option<PointId>,
    pub queue_length: usize,
    pub available: bool,
}

impl AvailabilityReport {
    pub fn new(point_id: Option<PointId>, queue_length: usize) -> Self {
        Self {
            point_id,
            queue_length,
            available: queue_length == 0,
        }
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a report, accepting the older free-text form
    /// (`"Situacao atual: sem fila"` / `"Situacao atual: com N na fila"`).
    pub fn parse(payload: &str) -> Option<Self> {
        if let Ok(report) = serde_json::from_str::<AvailabilityReport>(payload) {
            return Some(report);
        }

        if payload.contains("sem fila") {
            return Some(Self::new(None, 0));
        }

        let (_, rest) = payload.split_once("com ")?;
        let count = rest.split_whitespace().next()?.parse().ok()?;
        Some(Self::new(None, count))
    }
}

/// Enqueue acknowledgement a charging point sends in `status-fila`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub plate: String,
    pub position: usize,
}

impl QueueStatus {
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}
