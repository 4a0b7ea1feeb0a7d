//! Peer registry
//!
//! Tracks every live connection together with its role, its charging point
//! id or vehicle identity, and the vehicle's lifecycle stage. All state sits
//! behind one mutex; critical sections are short and never perform I/O.
//!
//! Point ids come from a free-list kept sorted ascending, so a new point
//! always takes the lowest free id and the list returns to its original
//! content once every point has left.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use recarga_core::{PointId, Role};
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::lifecycle::{LifecycleEvent, Stage};
use crate::peer::{ConnId, Peer};

/// What [`Registry::release`] removed
#[derive(Debug)]
pub struct Released {
    pub peer: Arc<Peer>,
    pub role: Option<Role>,
    pub point_id: Option<PointId>,
    pub identity: Option<String>,
    pub stage: Option<Stage>,
}

#[derive(Default)]
struct RegistryState {
    peers: HashMap<ConnId, Arc<Peer>>,
    roles: HashMap<ConnId, Role>,
    point_ids: HashMap<ConnId, PointId>,
    points: BTreeMap<PointId, ConnId>,
    identities: HashMap<ConnId, String>,
    by_identity: HashMap<String, ConnId>,
    stages: HashMap<ConnId, Stage>,
    known_queue: HashMap<PointId, usize>,
    free_ids: Vec<PointId>,
}

impl RegistryState {
    fn bind_vehicle(&mut self, conn: ConnId) {
        self.roles.insert(conn, Role::Vehicle);
        self.stages.entry(conn).or_default();
        if !self.identities.contains_key(&conn) {
            if let Some(peer) = self.peers.get(&conn) {
                let placeholder = peer.placeholder_identity();
                self.by_identity.insert(placeholder.clone(), conn);
                self.identities.insert(conn, placeholder);
            }
        }
    }
}

/// Registry of connected vehicles and charging points
pub struct Registry {
    state: Mutex<RegistryState>,
    pool_size: usize,
}

impl Registry {
    /// Create a registry for a region with `point_count` charging points
    pub fn new(point_count: usize) -> Self {
        let state = RegistryState {
            free_ids: (1..=point_count as PointId).collect(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            pool_size: point_count,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Track a freshly accepted connection
    pub fn attach(&self, peer: Arc<Peer>) {
        let mut state = self.state.lock();
        debug!("Registry: attached connection {} ({})", peer.id(), peer.addr());
        state.peers.insert(peer.id(), peer);
    }

    /// Bind a role to a connection.
    ///
    /// Charging points receive the lowest free id. Vehicles are bound to
    /// their placeholder identity until they confirm a plate. Registering the
    /// same role again is a no-op.
    pub fn register(&self, conn: ConnId, role: Role) -> Result<Option<PointId>, BrokerError> {
        let mut state = self.state.lock();

        if !state.peers.contains_key(&conn) {
            debug!("Registry: ignoring registration of released connection {}", conn);
            return Ok(None);
        }

        if let Some(current) = state.roles.get(&conn).copied() {
            if current != role {
                warn!(
                    "Registry: connection {} is a {}, refusing to register it as {}",
                    conn, current, role
                );
            }
            return Ok(state.point_ids.get(&conn).copied());
        }

        match role {
            Role::ChargingPoint => {
                if state.free_ids.is_empty() {
                    return Err(BrokerError::PoolExhausted);
                }
                let id = state.free_ids.remove(0);
                state.roles.insert(conn, role);
                state.point_ids.insert(conn, id);
                state.points.insert(id, conn);
                info!("Registry: charging point registered with id {}", id);
                Ok(Some(id))
            }
            Role::Vehicle => {
                state.bind_vehicle(conn);
                Ok(None)
            }
        }
    }

    /// Bind a confirmed plate to a vehicle connection
    pub fn identify_vehicle(&self, conn: ConnId, plate: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();

        if !state.peers.contains_key(&conn) {
            return Ok(());
        }

        if let Some(holder) = state.by_identity.get(plate).copied() {
            if holder != conn {
                return Err(BrokerError::PlateInUse(plate.to_string()));
            }
        }

        if state.roles.get(&conn).copied() != Some(Role::Vehicle) {
            state.bind_vehicle(conn);
        }

        if let Some(previous) = state.identities.insert(conn, plate.to_string()) {
            if previous != plate {
                state.by_identity.remove(&previous);
            }
        }
        state.by_identity.insert(plate.to_string(), conn);
        info!("Registry: vehicle {} identified on connection {}", plate, conn);
        Ok(())
    }

    /// Remove a connection. Idempotent: only the first call returns `Some`.
    pub fn release(&self, conn: ConnId) -> Option<Released> {
        let mut state = self.state.lock();

        let peer = state.peers.remove(&conn)?;
        let role = state.roles.remove(&conn);
        let stage = state.stages.remove(&conn);

        let point_id = state.point_ids.remove(&conn);
        if let Some(id) = point_id {
            state.points.remove(&id);
            state.known_queue.remove(&id);
            if let Err(pos) = state.free_ids.binary_search(&id) {
                state.free_ids.insert(pos, id);
            }
        }

        let identity = state.identities.remove(&conn);
        if let Some(ref identity) = identity {
            if state.by_identity.get(identity) == Some(&conn) {
                state.by_identity.remove(identity);
            }
        }

        debug!(
            "Registry: released connection {} (role {:?}, point {:?}, identity {:?})",
            conn, role, point_id, identity
        );

        Some(Released {
            peer,
            role,
            point_id,
            identity,
            stage,
        })
    }

    pub fn peer(&self, conn: ConnId) -> Option<Arc<Peer>> {
        self.state.lock().peers.get(&conn).cloned()
    }

    pub fn lookup_by_plate(&self, plate: &str) -> Option<Arc<Peer>> {
        let state = self.state.lock();
        let conn = state.by_identity.get(plate)?;
        state.peers.get(conn).cloned()
    }

    pub fn lookup_by_point(&self, id: PointId) -> Option<Arc<Peer>> {
        let state = self.state.lock();
        let conn = state.points.get(&id)?;
        state.peers.get(conn).cloned()
    }

    /// Snapshot of connected charging points in id order
    pub fn all_points(&self) -> Vec<(PointId, Arc<Peer>)> {
        let state = self.state.lock();
        state
            .points
            .iter()
            .filter_map(|(id, conn)| state.peers.get(conn).map(|peer| (*id, peer.clone())))
            .collect()
    }

    /// Snapshot of vehicle identities (plates or placeholders)
    pub fn all_active_plates(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut plates: Vec<String> = state.identities.values().cloned().collect();
        plates.sort();
        plates
    }

    pub fn active_count(&self, role: Role) -> usize {
        self.state.lock().roles.values().filter(|r| **r == role).count()
    }

    pub fn plate_of(&self, conn: ConnId) -> Option<String> {
        self.state.lock().identities.get(&conn).cloned()
    }

    pub fn point_id_of(&self, conn: ConnId) -> Option<PointId> {
        self.state.lock().point_ids.get(&conn).copied()
    }

    pub fn role_of(&self, conn: ConnId) -> Option<Role> {
        self.state.lock().roles.get(&conn).copied()
    }

    /// Whether a live connection other than `conn` holds `plate`
    pub fn plate_taken_by_other(&self, plate: &str, conn: ConnId) -> bool {
        self.state
            .lock()
            .by_identity
            .get(plate)
            .map_or(false, |holder| *holder != conn)
    }

    /// Free point ids, ascending
    pub fn free_ids(&self) -> Vec<PointId> {
        self.state.lock().free_ids.clone()
    }

    /// Apply a lifecycle event to a vehicle connection
    pub fn advance(&self, conn: ConnId, event: LifecycleEvent) -> Result<Stage, BrokerError> {
        let mut state = self.state.lock();
        if !state.peers.contains_key(&conn) {
            return Ok(Stage::Aborted);
        }
        state.stages.entry(conn).or_default().advance(event)
    }

    /// Apply a lifecycle event to the vehicle holding `plate`.
    ///
    /// `Ok(None)` when no connected vehicle holds the plate.
    pub fn advance_plate(&self, plate: &str, event: LifecycleEvent) -> Result<Option<Stage>, BrokerError> {
        let mut state = self.state.lock();
        let Some(conn) = state.by_identity.get(plate).copied() else {
            return Ok(None);
        };
        state.stages.entry(conn).or_default().advance(event).map(Some)
    }

    pub fn stage_of(&self, conn: ConnId) -> Option<Stage> {
        self.state.lock().stages.get(&conn).copied()
    }

    pub fn stage_of_plate(&self, plate: &str) -> Option<Stage> {
        let state = self.state.lock();
        let conn = state.by_identity.get(plate)?;
        state.stages.get(conn).copied()
    }

    /// Remember the last queue length a point reported
    pub fn record_queue(&self, id: PointId, length: usize) {
        let mut state = self.state.lock();
        if state.points.contains_key(&id) {
            state.known_queue.insert(id, length);
        }
    }

    pub fn known_queue(&self, id: PointId) -> Option<usize> {
        self.state.lock().known_queue.get(&id).copied()
    }
}
