//! Message dispatcher
//!
//! One receive loop per connection. Every decoded message is handled in its
//! own task, routed by the declared origin:
//!
//! ```text
//! vehicle ──identificacao / get-recarga / localizacao / solicitar-reserva──► broker
//! broker  ──nova-solicitacao / get-disponibilidade / veiculo-chegou────────► point
//! point   ──status-fila / chamando-veiculo / recarga-finalizada────────────► broker ──► vehicle
//! ```
//!
//! The loop ends on end of stream, on a transport or decode error, or when
//! the connection is closed from elsewhere; in every case the connection is
//! released exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use recarga_core::geo;
use recarga_core::{
    extract_plate, is_valid_plate, AvailabilityReport, ChannelError, ChargeSummary, Message,
    MessageKind, MessageReader, PointId, QueueStatus, Region, Role,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::history::{HistoryStore, RechargeRecord};
use crate::lifecycle::LifecycleEvent;
use crate::peer::{ConnId, Peer};
use crate::ranking::{format_ranking, Ranker};
use crate::registry::Registry;
use crate::reservations::{Reservation, ReservationTable};

/// Routes messages between vehicles and charging points
pub struct Dispatcher {
    config: BrokerConfig,
    region: Arc<Region>,
    registry: Arc<Registry>,
    reservations: Arc<ReservationTable>,
    history: Arc<dyn HistoryStore>,
    ranker: Ranker,
    next_conn: AtomicU64,
}

impl Dispatcher {
    pub fn new(config: BrokerConfig, region: Arc<Region>, history: Arc<dyn HistoryStore>) -> Self {
        let registry = Arc::new(Registry::new(region.point_count()));
        let ranker = Ranker::new(registry.clone(), region.clone(), config.ranking.clone());

        Self {
            config,
            region,
            registry,
            reservations: Arc::new(ReservationTable::new()),
            history,
            ranker,
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn reservations(&self) -> &Arc<ReservationTable> {
        &self.reservations
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    /// Serve one connection until it ends, then release it
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S, addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(Peer::new(conn, addr, write_half));
        self.registry.attach(peer.clone());
        info!("Dispatcher: connection {} accepted from {}", conn, addr);

        let mut reader = MessageReader::new(read_half);
        loop {
            tokio::select! {
                _ = peer.closed() => {
                    debug!("Dispatcher: connection {} closed locally", conn);
                    break;
                }
                result = reader.next_message() => match result {
                    Ok(Some(msg)) => {
                        let dispatcher = self.clone();
                        let peer = peer.clone();
                        tokio::spawn(async move { dispatcher.handle_message(peer, msg).await });
                    }
                    Ok(None) => {
                        info!("Dispatcher: {} disconnected", addr);
                        break;
                    }
                    Err(e @ (ChannelError::Io(_) | ChannelError::Closed)) => {
                        error!("Dispatcher: transport error on {}: {}", addr, e);
                        break;
                    }
                    Err(e) => {
                        warn!("Dispatcher: dropping {} after bad input: {}", addr, e);
                        break;
                    }
                }
            }
        }

        self.release(conn).await;
    }

    /// Handle one decoded message; failures are logged
    pub async fn handle_message(self: Arc<Self>, peer: Arc<Peer>, msg: Message) {
        let kind = msg.kind.clone();
        let result = match Role::from_origin(msg.origin) {
            Some(Role::Vehicle) => self.handle_vehicle(&peer, msg).await,
            Some(Role::ChargingPoint) => self.handle_point(&peer, msg).await,
            None => {
                warn!("Dispatcher: ignoring {}-origin {} from {}", msg.origin, kind, peer.addr());
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Dispatcher: {} from {} failed: {}", kind, peer.addr(), e);
        }
    }

    /// Remove a connection and undo whatever it held
    pub async fn release(&self, conn: ConnId) {
        let Some(released) = self.registry.release(conn) else {
            return;
        };
        released.peer.close().await;

        match released.role {
            Some(Role::Vehicle) => {
                if let Some(identity) = released.identity {
                    if let Some(reservation) = self.reservations.remove(&identity) {
                        info!(
                            "Dispatcher: vehicle {} left, dropped its reservation at point {}",
                            identity, reservation.point_id
                        );
                    }
                }
            }
            Some(Role::ChargingPoint) => {
                if let Some(point_id) = released.point_id {
                    self.abort_point_reservations(point_id).await;
                    info!("Dispatcher: charging point {} left, id returned to pool", point_id);
                }
            }
            None => {}
        }
    }

    async fn abort_point_reservations(&self, point_id: PointId) {
        for plate in self.reservations.remove_by_point(point_id) {
            if let Err(e) = self.registry.advance_plate(&plate, LifecycleEvent::PointLost) {
                debug!("Dispatcher: {}", e);
            }
            let Some(vehicle) = self.registry.lookup_by_plate(&plate) else {
                continue;
            };
            let notice = Message::server(
                MessageKind::ReservationFailed,
                format!(
                    "Charging point {} disconnected, your reservation was cancelled",
                    point_id
                ),
            );
            if let Err(e) = vehicle.send(&notice).await {
                warn!("Dispatcher: could not notify {} of lost point: {}", plate, e);
            }
        }
    }

    // ---- vehicle side ----

    async fn handle_vehicle(self: &Arc<Self>, peer: &Arc<Peer>, msg: Message) -> Result<(), BrokerError> {
        let conn = peer.id();
        self.registry.register(conn, Role::Vehicle)?;
        if self.registry.role_of(conn) != Some(Role::Vehicle) {
            warn!("Dispatcher: {} sent vehicle message {} on a point connection", peer.addr(), msg.kind);
            return Ok(());
        }

        match msg.kind {
            MessageKind::CheckPlate => self.check_plate(peer, msg.content.trim()).await,
            MessageKind::Identify => self.identify_vehicle(peer, &msg.content).await,
            MessageKind::RequestCharge => self.request_charge(peer).await,
            MessageKind::Location => self.report_location(peer, &msg.content).await,
            MessageKind::RequestReservation => self.reserve(peer, &msg.content).await,
            MessageKind::VehicleArrived => self.vehicle_arrived(peer).await,
            MessageKind::QueryHistory => self.query_history(peer).await,
            other => {
                debug!("Dispatcher: ignoring {} from vehicle {}", other, peer.addr());
                Ok(())
            }
        }
    }

    fn identity_of(&self, peer: &Peer) -> String {
        self.registry
            .plate_of(peer.id())
            .unwrap_or_else(|| peer.placeholder_identity())
    }

    async fn check_plate(&self, peer: &Peer, plate: &str) -> Result<(), BrokerError> {
        let reply = if !is_valid_plate(plate) {
            Message::server(
                MessageKind::PlateUnavailable,
                "Invalid plate: use 6 to 8 characters without spaces.",
            )
        } else if self.registry.plate_taken_by_other(plate, peer.id()) {
            Message::server(MessageKind::PlateUnavailable, "This plate is already in use.")
        } else if self.history.plate_exists(plate) {
            Message::server(MessageKind::PlateAvailable, "Plate available for use. Welcome back!")
        } else {
            Message::server(MessageKind::PlateAvailable, "Plate available for use.")
        };

        peer.send(&reply).await?;
        Ok(())
    }

    async fn identify_vehicle(&self, peer: &Peer, content: &str) -> Result<(), BrokerError> {
        let Some(plate) = extract_plate(content) else {
            info!(
                "Dispatcher: vehicle {} identified without a plate, using its address",
                peer.addr()
            );
            return Ok(());
        };

        match self.registry.identify_vehicle(peer.id(), &plate) {
            Ok(()) => {
                if let Err(e) = self.history.register_plate(&plate) {
                    error!("Dispatcher: could not register {} in history: {}", plate, e);
                }
                Ok(())
            }
            Err(BrokerError::PlateInUse(plate)) => {
                warn!("Dispatcher: plate {} already connected, refusing {}", plate, peer.addr());
                peer.send(&Message::server(
                    MessageKind::PlateUnavailable,
                    "This plate is already in use.",
                ))
                .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn request_charge(&self, peer: &Peer) -> Result<(), BrokerError> {
        let advanced = self
            .registry
            .advance(peer.id(), LifecycleEvent::ChargeRequested)
            .and_then(|_| self.registry.advance(peer.id(), LifecycleEvent::LocationRequested));
        if let Err(e) = advanced {
            self.refuse(peer, "A reservation is already in progress, charge request ignored.")
                .await?;
            return Err(e);
        }

        peer.send(&Message::server(
            MessageKind::GetLocation,
            "Hello vehicle! Report your current location.",
        ))
        .await?;

        let region = self
            .region
            .to_json()
            .map_err(|e| BrokerError::Decode(format!("region encoding failed: {}", e)))?;
        peer.send(&Message::server(MessageKind::RegionData, region)).await?;
        Ok(())
    }

    async fn report_location(&self, peer: &Peer, content: &str) -> Result<(), BrokerError> {
        let Some((latitude, longitude)) = geo::parse_location(content) else {
            self.refuse(
                peer,
                format!("Invalid location {:?}: expected latitude,longitude", content.trim()),
            )
            .await?;
            return Err(BrokerError::Decode(format!("bad location {:?}", content)));
        };

        if let Err(e) = self.registry.advance(peer.id(), LifecycleEvent::LocationReported) {
            self.refuse(peer, "Location not expected: request a charge first.")
                .await?;
            return Err(e);
        }
        if !self.region.contains(latitude, longitude) {
            warn!(
                "Dispatcher: vehicle {} is outside the coverage area ({}, {})",
                peer.addr(),
                latitude,
                longitude
            );
        }

        let entries = self.ranker.rank(latitude, longitude).await;
        let ranking = Message::server(MessageKind::Ranking, format_ranking(&entries));
        peer.send_with_retry(&ranking, self.config.ranking_retry).await?;
        Ok(())
    }

    async fn reserve(self: &Arc<Self>, peer: &Arc<Peer>, content: &str) -> Result<(), BrokerError> {
        let conn = peer.id();
        let plate = self.identity_of(peer);

        let Ok(point_id) = content.trim().parse::<PointId>() else {
            self.refuse(peer, format!("Invalid charging point id {:?}", content.trim()))
                .await?;
            return Err(BrokerError::Decode(format!("bad point id {:?}", content)));
        };

        if let Err(e) = self.registry.advance(conn, LifecycleEvent::PointChosen) {
            self.refuse(
                peer,
                "A reservation is already in progress or no ranking was requested.",
            )
            .await?;
            return Err(e);
        }

        // (a) the point must be connected
        let Some(point) = self.registry.lookup_by_point(point_id) else {
            self.reject(peer, format!("Charging point {} not found", point_id)).await?;
            return Err(BrokerError::PointNotFound(point_id));
        };

        // (b) record before confirming
        let reservation = Reservation::new(point_id);
        if let Some(previous) = self.reservations.insert(&plate, reservation.clone()) {
            warn!(
                "Dispatcher: reservation {} of {} at point {} replaced",
                previous.id, plate, previous.point_id
            );
        }
        info!(
            "Dispatcher: reservation {} of {} at point {}",
            reservation.id, plate, point_id
        );

        // (c) hand the plate to the point
        if let Err(e) = point
            .send(&Message::server(MessageKind::NewRequest, plate.clone()))
            .await
        {
            self.reservations.remove_if(&plate, &reservation.id);
            self.reject(peer, format!("Failed to reach charging point {}", point_id))
                .await?;
            return Err(e.into());
        }

        // (d) best-effort position estimate
        let position = match point.query_availability(point_id, self.config.poll_timeout).await {
            Some(report) => {
                self.registry.record_queue(point_id, report.queue_length);
                report.queue_length.max(1)
            }
            None => self.registry.known_queue(point_id).map_or(1, |q| q + 1),
        };

        // (e) confirm
        let text = if position <= 1 {
            format!(
                "Reservation confirmed at charging point {}. You are next in line!",
                point_id
            )
        } else {
            format!(
                "Reservation confirmed at charging point {}. You are number {} in the queue, please wait your turn.",
                point_id, position
            )
        };
        let confirmation = Message::server(MessageKind::ReservationConfirmed, text);
        if let Err(e) = peer.send_with_retry(&confirmation, self.config.confirm_retry).await {
            error!("Dispatcher: could not confirm reservation to {}: {}", plate, e);
        }

        // (f) keep the vehicle informed
        let dispatcher = self.clone();
        let vehicle = peer.clone();
        tokio::spawn(async move {
            dispatcher
                .monitor_queue(vehicle, point, plate, reservation.id, point_id)
                .await
        });
        Ok(())
    }

    async fn reject(&self, peer: &Peer, reason: String) -> Result<(), BrokerError> {
        if let Err(e) = self.registry.advance(peer.id(), LifecycleEvent::Rejected) {
            debug!("Dispatcher: {}", e);
        }
        self.refuse(peer, reason).await
    }

    /// Answer a waiting vehicle with `reserva-falhou`
    async fn refuse(&self, peer: &Peer, reason: impl Into<String>) -> Result<(), BrokerError> {
        peer.send(&Message::server(MessageKind::ReservationFailed, reason))
            .await?;
        Ok(())
    }

    /// Push queue updates while the reservation is unchanged
    async fn monitor_queue(
        &self,
        vehicle: Arc<Peer>,
        point: Arc<Peer>,
        plate: String,
        reservation_id: String,
        point_id: PointId,
    ) {
        let interval = self.config.monitor.interval;
        let deadline = Instant::now() + self.config.monitor.max_duration;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    info!("Monitor: queue monitoring for {} expired", plate);
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.reservations.get(&plate) {
                Some(current) if current.id == reservation_id => {}
                _ => {
                    info!("Monitor: {} no longer holds reservation {}", plate, reservation_id);
                    return;
                }
            }

            let Some(report) = point.query_availability(point_id, self.config.poll_timeout).await else {
                debug!("Monitor: point {} did not answer", point_id);
                continue;
            };
            self.registry.record_queue(point_id, report.queue_length);

            let update = Message::server(
                MessageKind::QueuePosition,
                format!(
                    "Update: you are in the queue of charging point {}. There are {} vehicles in the queue.",
                    point_id, report.queue_length
                ),
            );
            if let Err(e) = vehicle.send(&update).await {
                warn!("Monitor: failed to update {}: {}", plate, e);
            }
        }
    }

    async fn vehicle_arrived(&self, peer: &Peer) -> Result<(), BrokerError> {
        let plate = self.identity_of(peer);
        let Some(reservation) = self.reservations.get(&plate) else {
            warn!("Dispatcher: arrival from {} without a reservation", plate);
            return Ok(());
        };

        self.registry.advance(peer.id(), LifecycleEvent::Arrived)?;

        let point = self
            .registry
            .lookup_by_point(reservation.point_id)
            .ok_or(BrokerError::PointNotFound(reservation.point_id))?;
        point
            .send(&Message::server(MessageKind::VehicleArrived, plate.clone()))
            .await?;
        info!("Dispatcher: {} arrived at point {}", plate, reservation.point_id);
        Ok(())
    }

    /// History of the connection's own plate; the payload is not consulted
    async fn query_history(&self, peer: &Peer) -> Result<(), BrokerError> {
        let plate = self.identity_of(peer);

        let reply = match self.history.query(&plate) {
            Ok(records) => match serde_json::to_string(&records) {
                Ok(json) => Message::server(MessageKind::History, json),
                Err(e) => {
                    error!("Dispatcher: history encoding failed for {}: {}", plate, e);
                    Message::server(MessageKind::HistoryError, "Failed to fetch charge history")
                }
            },
            Err(e) => {
                error!("Dispatcher: history query failed for {}: {}", plate, e);
                Message::server(MessageKind::HistoryError, "Failed to fetch charge history")
            }
        };

        peer.send(&reply).await?;
        Ok(())
    }

    // ---- charging point side ----

    async fn handle_point(&self, peer: &Arc<Peer>, msg: Message) -> Result<(), BrokerError> {
        let conn = peer.id();
        let point_id = match self.registry.register(conn, Role::ChargingPoint) {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!("Dispatcher: {} sent point message {} on a vehicle connection", peer.addr(), msg.kind);
                return Ok(());
            }
            Err(BrokerError::PoolExhausted) => {
                warn!("Dispatcher: no free point id for {}, closing", peer.addr());
                let refusal = Message::server(
                    MessageKind::IdentifyRejected,
                    "No free charging point id in this region",
                );
                if let Err(e) = peer.send(&refusal).await {
                    debug!("Dispatcher: refusal to {} not delivered: {}", peer.addr(), e);
                }
                self.release(conn).await;
                return Err(BrokerError::PoolExhausted);
            }
            Err(e) => return Err(e),
        };

        match msg.kind {
            MessageKind::Identify => {
                let report = peer
                    .query_availability(point_id, self.config.poll_timeout)
                    .await
                    .ok_or(BrokerError::Timeout("initial availability report"))?;
                self.registry.record_queue(point_id, report.queue_length);
                info!(
                    "Dispatcher: point {} ready with {} queued",
                    point_id, report.queue_length
                );
                Ok(())
            }
            MessageKind::Availability => {
                let report = AvailabilityReport::parse(&msg.content)
                    .ok_or_else(|| BrokerError::Decode(format!("bad availability {:?}", msg.content)))?;
                self.registry.record_queue(point_id, report.queue_length);
                let waiting = peer.resolve_waiters(report);
                debug!(
                    "Dispatcher: point {} reports {} queued ({} waiting)",
                    point_id, report.queue_length, waiting
                );
                Ok(())
            }
            MessageKind::QueueStatus => self.queue_status(point_id, &msg.content).await,
            MessageKind::CallingVehicle => self.calling_vehicle(point_id, msg.content.trim()).await,
            MessageKind::ChargeFinished => self.charge_finished(peer, point_id, &msg.content).await,
            MessageKind::ReservationExpired => {
                self.reservation_expired(point_id, msg.content.trim()).await
            }
            other => {
                debug!("Dispatcher: ignoring {} from point {}", other, point_id);
                Ok(())
            }
        }
    }

    /// The plate's reservation, only if it is held at `point_id`
    fn reservation_at(&self, plate: &str, point_id: PointId) -> Option<Reservation> {
        self.reservations
            .get(plate)
            .filter(|reservation| reservation.point_id == point_id)
    }

    /// Apply a point-originated lifecycle event; illegal ones are only logged
    fn advance_from_point(&self, plate: &str, event: LifecycleEvent) {
        match self.registry.advance_plate(plate, event) {
            Ok(Some(stage)) => debug!("Dispatcher: {} now {:?}", plate, stage),
            Ok(None) => debug!("Dispatcher: {} not connected for {:?}", plate, event),
            Err(e) => warn!("Dispatcher: {} ({})", e, plate),
        }
    }

    async fn queue_status(&self, point_id: PointId, content: &str) -> Result<(), BrokerError> {
        let status = QueueStatus::parse(content)
            .ok_or_else(|| BrokerError::Decode(format!("bad queue status {:?}", content)))?;
        self.registry.record_queue(point_id, status.position);
        if self.reservation_at(&status.plate, point_id).is_none() {
            debug!(
                "Dispatcher: point {} queued {} without holding its reservation",
                point_id, status.plate
            );
            return Ok(());
        }
        self.advance_from_point(&status.plate, LifecycleEvent::Enqueued);

        let Some(vehicle) = self.registry.lookup_by_plate(&status.plate) else {
            return Ok(());
        };
        vehicle
            .send(&Message::server(
                MessageKind::QueuePosition,
                format!(
                    "You are number {} in the queue of charging point {}.",
                    status.position, point_id
                ),
            ))
            .await?;
        Ok(())
    }

    async fn calling_vehicle(&self, point_id: PointId, plate: &str) -> Result<(), BrokerError> {
        if self.reservation_at(plate, point_id).is_none() {
            warn!(
                "Dispatcher: point {} called {} without holding its reservation, ignored",
                point_id, plate
            );
            return Ok(());
        }
        self.advance_from_point(plate, LifecycleEvent::Called);

        let vehicle = self
            .registry
            .lookup_by_plate(plate)
            .ok_or_else(|| BrokerError::Decode(format!("point {} called unknown vehicle {}", point_id, plate)))?;
        vehicle
            .send(&Message::server(
                MessageKind::YourTurn,
                format!("It's your turn at charging point {}!", point_id),
            ))
            .await?;
        info!("Dispatcher: point {} called {}", point_id, plate);
        Ok(())
    }

    async fn charge_finished(&self, point: &Peer, point_id: PointId, content: &str) -> Result<(), BrokerError> {
        let summary = ChargeSummary::parse(content)
            .map_err(|e| BrokerError::Decode(format!("{}: {:?}", e, content)))?;
        let plate = summary.plate.clone();

        let release = Message::server(
            MessageKind::ReleasePoint,
            "Point released to serve the next vehicle",
        );
        if let Err(e) = point.send(&release).await {
            error!("Dispatcher: could not release point {}: {}", point_id, e);
        }

        let Some(reservation) = self.reservation_at(&plate, point_id) else {
            warn!(
                "Dispatcher: point {} finished {} without holding its reservation, ignored",
                point_id, plate
            );
            return Ok(());
        };
        self.reservations.remove_if(&plate, &reservation.id);

        let record = RechargeRecord::new(&plate, point_id, summary.consumed_kwh, summary.amount);
        if let Err(e) = self.history.append(record) {
            error!("Dispatcher: could not record charge of {}: {}", plate, e);
        }

        self.advance_from_point(&plate, LifecycleEvent::Completed);
        info!(
            "Dispatcher: {} finished at point {} ({:.2} kWh, R$ {:.2})",
            plate, point_id, summary.consumed_kwh, summary.amount
        );

        let Some(vehicle) = self.registry.lookup_by_plate(&plate) else {
            warn!("Dispatcher: {} left before its charge summary", plate);
            return Ok(());
        };
        vehicle
            .send(&Message::server(MessageKind::ChargeFinished, content))
            .await?;
        Ok(())
    }

    async fn reservation_expired(&self, point_id: PointId, plate: &str) -> Result<(), BrokerError> {
        let Some(reservation) = self.reservation_at(plate, point_id) else {
            warn!(
                "Dispatcher: point {} expired {} without holding its reservation, ignored",
                point_id, plate
            );
            return Ok(());
        };
        self.reservations.remove_if(plate, &reservation.id);
        self.advance_from_point(plate, LifecycleEvent::Expired);
        info!("Dispatcher: reservation of {} at point {} expired", plate, point_id);

        let Some(vehicle) = self.registry.lookup_by_plate(plate) else {
            return Ok(());
        };
        vehicle
            .send(&Message::server(
                MessageKind::ReservationExpired,
                format!(
                    "Your reservation at charging point {} expired: arrival was not reported in time.",
                    point_id
                ),
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistory;
    use crate::lifecycle::Stage;
    use recarga_core::{CoverageArea, Origin, PointLocation, SharedWriter};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::mpsc;

    type PointWriter = Arc<SharedWriter<WriteHalf<DuplexStream>>>;

    struct TestPeer {
        reader: MessageReader<ReadHalf<DuplexStream>>,
        writer: SharedWriter<WriteHalf<DuplexStream>>,
        origin: Origin,
    }

    impl TestPeer {
        async fn send(&self, kind: MessageKind, content: &str) {
            self.writer
                .send_message(&Message::new(kind, content, self.origin))
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<Message> {
            tokio::time::timeout(Duration::from_secs(30), self.reader.next_message())
                .await
                .expect("no message in time")
                .unwrap()
        }

        /// Next message of `kind`, skipping others
        async fn recv_kind(&mut self, kind: MessageKind) -> Message {
            loop {
                let msg = self.recv().await.expect("connection closed");
                if msg.kind == kind {
                    return msg;
                }
            }
        }
    }

    fn test_region() -> Arc<Region> {
        let area = CoverageArea {
            latitude_min: -1.0,
            latitude_max: 1.0,
            longitude_min: -1.0,
            longitude_max: 1.0,
        };
        let points = vec![
            PointLocation { id: 1, latitude: 0.0045, longitude: 0.0 },
            PointLocation { id: 2, latitude: 0.009, longitude: 0.0 },
        ];
        Arc::new(Region::new(area, points).unwrap())
    }

    fn test_dispatcher() -> Arc<Dispatcher> {
        let config = BrokerConfig::default().with_poll_timeout(Duration::from_millis(500));
        Arc::new(Dispatcher::new(config, test_region(), Arc::new(MemoryHistory::new())))
    }

    fn connect(dispatcher: &Arc<Dispatcher>, port: u16, origin: Origin) -> TestPeer {
        let (client, server) = tokio::io::duplex(8192);
        let addr: SocketAddr = format!("10.0.0.1:{}", port).parse().unwrap();
        tokio::spawn(dispatcher.clone().serve_connection(server, addr));

        let (read_half, write_half) = tokio::io::split(client);
        TestPeer {
            reader: MessageReader::new(read_half),
            writer: SharedWriter::new(write_half),
            origin,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Connect a point and answer its first availability poll
    async fn ready_point(dispatcher: &Arc<Dispatcher>, port: u16, queue: usize) -> TestPeer {
        let mut point = connect(dispatcher, port, Origin::ChargingPoint);
        point.send(MessageKind::Identify, "charging point online").await;
        point.recv_kind(MessageKind::GetAvailability).await;
        let report = AvailabilityReport::new(None, queue).to_payload().unwrap();
        point.send(MessageKind::Availability, &report).await;
        point
    }

    /// Ready point that answers every poll with `queue`; its other traffic is forwarded
    async fn answering_point(
        dispatcher: &Arc<Dispatcher>,
        port: u16,
        queue: usize,
    ) -> (PointWriter, mpsc::UnboundedReceiver<Message>) {
        let TestPeer { mut reader, writer, .. } = ready_point(dispatcher, port, queue).await;
        let writer = Arc::new(writer);
        let (tx, rx) = mpsc::unbounded_channel();

        let answering = writer.clone();
        tokio::spawn(async move {
            let report = AvailabilityReport::new(None, queue).to_payload().unwrap();
            while let Ok(Some(msg)) = reader.next_message().await {
                if msg.kind == MessageKind::GetAvailability {
                    let reply = Message::point(MessageKind::Availability, report.clone());
                    if answering.send_message(&reply).await.is_err() {
                        break;
                    }
                } else {
                    let _ = tx.send(msg);
                }
            }
        });
        (writer, rx)
    }

    /// Identify `plate` and take it through ranking to a confirmed reservation
    async fn reserved_vehicle(
        dispatcher: &Arc<Dispatcher>,
        port: u16,
        plate: &str,
        point_id: PointId,
    ) -> (TestPeer, String) {
        let mut vehicle = connect(dispatcher, port, Origin::Vehicle);
        vehicle.send(MessageKind::Identify, plate).await;
        let registry = dispatcher.registry().clone();
        wait_until(|| registry.lookup_by_plate(plate).is_some()).await;

        vehicle.send(MessageKind::RequestCharge, "").await;
        vehicle.recv_kind(MessageKind::RegionData).await;
        vehicle.send(MessageKind::Location, "0.0,0.0").await;
        vehicle.recv_kind(MessageKind::Ranking).await;

        vehicle
            .send(MessageKind::RequestReservation, &point_id.to_string())
            .await;
        let confirmation = vehicle.recv_kind(MessageKind::ReservationConfirmed).await;
        assert!(confirmation
            .content
            .contains(&format!("charging point {}", point_id)));
        (vehicle, confirmation.content)
    }

    fn monitored_dispatcher() -> Arc<Dispatcher> {
        let config = BrokerConfig::default()
            .with_poll_timeout(Duration::from_millis(500))
            .with_monitor(Duration::from_secs(10), Duration::from_secs(35));
        Arc::new(Dispatcher::new(config, test_region(), Arc::new(MemoryHistory::new())))
    }

    #[tokio::test]
    async fn test_duplicate_plate_rejected() {
        let dispatcher = test_dispatcher();
        let mut first = connect(&dispatcher, 1001, Origin::Vehicle);
        let mut second = connect(&dispatcher, 1002, Origin::Vehicle);

        first.send(MessageKind::Identify, "ABC1234").await;
        let registry = dispatcher.registry().clone();
        wait_until(|| registry.lookup_by_plate("ABC1234").is_some()).await;

        second.send(MessageKind::Identify, "vehicle connected plate ABC1234").await;
        let reply = second.recv().await.unwrap();
        assert_eq!(reply.kind, MessageKind::PlateUnavailable);

        // first holder unaffected, second still connected
        assert_eq!(
            dispatcher.registry().lookup_by_plate("ABC1234").unwrap().addr().port(),
            1001
        );
        first.send(MessageKind::CheckPlate, "ABC1234").await;
        assert_eq!(first.recv().await.unwrap().kind, MessageKind::PlateAvailable);
        second.send(MessageKind::CheckPlate, "ABC1234").await;
        assert_eq!(second.recv().await.unwrap().kind, MessageKind::PlateUnavailable);
        second.send(MessageKind::CheckPlate, "AB").await;
        assert_eq!(second.recv().await.unwrap().kind, MessageKind::PlateUnavailable);
    }

    #[tokio::test]
    async fn test_pool_exhausted_refuses_point() {
        let dispatcher = test_dispatcher();
        let _p1 = ready_point(&dispatcher, 2001, 0).await;
        let _p2 = ready_point(&dispatcher, 2002, 0).await;

        let mut third = connect(&dispatcher, 2003, Origin::ChargingPoint);
        third.send(MessageKind::Identify, "charging point online").await;
        assert_eq!(third.recv().await.unwrap().kind, MessageKind::IdentifyRejected);
        assert!(third.recv().await.is_none());
        assert_eq!(dispatcher.registry().active_count(Role::ChargingPoint), 2);
    }

    #[tokio::test]
    async fn test_reservation_to_missing_point_fails() {
        let dispatcher = test_dispatcher();
        let mut vehicle = connect(&dispatcher, 3001, Origin::Vehicle);

        vehicle.send(MessageKind::Identify, "ABC1234").await;
        let registry = dispatcher.registry().clone();
        wait_until(|| registry.lookup_by_plate("ABC1234").is_some()).await;

        vehicle.send(MessageKind::RequestCharge, "").await;
        vehicle.recv_kind(MessageKind::RegionData).await;
        vehicle.send(MessageKind::Location, "0.0,0.0").await;
        let ranking = vehicle.recv_kind(MessageKind::Ranking).await;
        assert!(ranking.content.starts_with("1. Point ID: 1"));

        vehicle.send(MessageKind::RequestReservation, "2").await;
        let reply = vehicle.recv().await.unwrap();
        assert_eq!(reply.kind, MessageKind::ReservationFailed);
        assert!(reply.content.contains("not found"));
        assert!(dispatcher.reservations().is_empty());
        assert_eq!(
            dispatcher.registry().stage_of_plate("ABC1234"),
            Some(crate::lifecycle::Stage::Ranked)
        );
    }

    #[tokio::test]
    async fn test_point_disconnect_aborts_reservations() {
        let dispatcher = test_dispatcher();
        let mut point = ready_point(&dispatcher, 4001, 0).await;
        let mut vehicle = connect(&dispatcher, 4002, Origin::Vehicle);

        vehicle.send(MessageKind::Identify, "XYZ9876").await;
        let registry = dispatcher.registry().clone();
        wait_until(|| registry.lookup_by_plate("XYZ9876").is_some()).await;
        vehicle.send(MessageKind::RequestCharge, "").await;
        vehicle.recv_kind(MessageKind::RegionData).await;
        vehicle.send(MessageKind::Location, "0.0,0.0").await;

        point.recv_kind(MessageKind::GetAvailability).await;
        point
            .send(MessageKind::Availability, &AvailabilityReport::new(None, 0).to_payload().unwrap())
            .await;
        vehicle.recv_kind(MessageKind::Ranking).await;

        vehicle.send(MessageKind::RequestReservation, "1").await;
        let request = point.recv_kind(MessageKind::NewRequest).await;
        assert_eq!(request.content, "XYZ9876");
        assert_eq!(dispatcher.reservations().get("XYZ9876").unwrap().point_id, 1);

        drop(point);
        let notice = vehicle.recv_kind(MessageKind::ReservationFailed).await;
        assert!(notice.content.contains("disconnected"));
        assert!(dispatcher.reservations().is_empty());
        assert_eq!(dispatcher.registry().free_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_decode_error_releases_connection() {
        let dispatcher = test_dispatcher();
        let (mut client, server) = tokio::io::duplex(1024);
        tokio::spawn(
            dispatcher
                .clone()
                .serve_connection(server, "10.0.0.1:5001".parse().unwrap()),
        );

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(b"{\"tipo\": [}\n").await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(dispatcher.registry().all_active_plates().is_empty());
    }

    #[tokio::test]
    async fn test_history_query_uses_bound_plate() {
        let dispatcher = test_dispatcher();
        let history = dispatcher.history();
        history
            .append(RechargeRecord::new("ABC1234", 2, 30.0, 24.0))
            .unwrap();
        history
            .append(RechargeRecord::new("XYZ9876", 1, 10.0, 8.0))
            .unwrap();

        let mut vehicle = connect(&dispatcher, 6001, Origin::Vehicle);
        vehicle.send(MessageKind::Identify, "ABC1234").await;
        let registry = dispatcher.registry().clone();
        wait_until(|| registry.lookup_by_plate("ABC1234").is_some()).await;

        // a foreign plate in the payload is not honoured
        vehicle.send(MessageKind::QueryHistory, "XYZ9876").await;
        let reply = vehicle.recv().await.unwrap();
        assert_eq!(reply.kind, MessageKind::History);

        let records: Vec<RechargeRecord> = serde_json::from_str(&reply.content).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].plate, "ABC1234");
        assert_eq!(records[0].point_id, 2);
    }

    #[tokio::test]
    async fn test_location_failures_answered() {
        let dispatcher = test_dispatcher();
        let mut vehicle = connect(&dispatcher, 6101, Origin::Vehicle);
        vehicle.send(MessageKind::Identify, "LOC1234").await;
        let registry = dispatcher.registry().clone();
        wait_until(|| registry.lookup_by_plate("LOC1234").is_some()).await;

        vehicle.send(MessageKind::Location, "0.0,0.0").await;
        let reply = vehicle.recv_kind(MessageKind::ReservationFailed).await;
        assert!(reply.content.contains("request a charge first"));

        vehicle.send(MessageKind::RequestCharge, "").await;
        vehicle.recv_kind(MessageKind::RegionData).await;
        vehicle.send(MessageKind::Location, "somewhere").await;
        let reply = vehicle.recv_kind(MessageKind::ReservationFailed).await;
        assert!(reply.content.contains("Invalid location"));
        assert_eq!(registry.stage_of_plate("LOC1234"), Some(Stage::Locating));

        // asking again starts over
        vehicle.send(MessageKind::RequestCharge, "").await;
        vehicle.recv_kind(MessageKind::RegionData).await;
        vehicle.send(MessageKind::Location, "0.0,0.0").await;
        vehicle.recv_kind(MessageKind::Ranking).await;
        assert_eq!(registry.stage_of_plate("LOC1234"), Some(Stage::Ranked));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_point_events_leave_new_reservation_alone() {
        let dispatcher = test_dispatcher();
        let (point1, _point1_rx) = answering_point(&dispatcher, 8001, 0).await;
        let (point2, mut point2_rx) = answering_point(&dispatcher, 8002, 0).await;

        // reserve at point 1, leave, come back and reserve at point 2
        let (first, _) = reserved_vehicle(&dispatcher, 8003, "ABC1234", 1).await;
        drop(first);
        wait_until(|| dispatcher.reservations().get("ABC1234").is_none()).await;
        let (mut vehicle, _) = reserved_vehicle(&dispatcher, 8004, "ABC1234", 2).await;

        // point 1 still serves the plate it queued before the reconnect
        let stale_finish = ChargeSummary::new("ABC1234", 12.0, 9.6).to_payload();
        for (kind, content) in [
            (MessageKind::ReservationExpired, "ABC1234".to_string()),
            (MessageKind::CallingVehicle, "ABC1234".to_string()),
            (MessageKind::ChargeFinished, stale_finish),
        ] {
            point1.send_message(&Message::point(kind, content)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(dispatcher.reservations().get("ABC1234").unwrap().point_id, 2);
        assert_eq!(
            dispatcher.registry().stage_of_plate("ABC1234"),
            Some(Stage::Reserving)
        );
        assert!(dispatcher.history().query("ABC1234").unwrap().is_empty());

        point2
            .send_message(&Message::point(MessageKind::CallingVehicle, "ABC1234"))
            .await
            .unwrap();
        loop {
            let msg = vehicle.recv().await.expect("connection closed");
            match msg.kind {
                MessageKind::YourTurn => {
                    assert!(msg.content.contains("charging point 2"), "{}", msg.content);
                    break;
                }
                MessageKind::ReservationExpired | MessageKind::ChargeFinished => {
                    panic!("unexpected {}: {}", msg.kind, msg.content)
                }
                _ => {}
            }
        }

        vehicle.send(MessageKind::VehicleArrived, "").await;
        let arrival = loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), point2_rx.recv())
                .await
                .expect("arrival not forwarded to point 2")
                .unwrap();
            if msg.kind == MessageKind::VehicleArrived {
                break msg;
            }
        };
        assert_eq!(arrival.content, "ABC1234");
        assert_eq!(
            dispatcher.registry().stage_of_plate("ABC1234"),
            Some(Stage::Charging)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_when_reservation_goes() {
        let dispatcher = monitored_dispatcher();
        let (_point, _point_rx) = answering_point(&dispatcher, 7101, 2).await;
        let (mut vehicle, _) = reserved_vehicle(&dispatcher, 7102, "MON1234", 1).await;
        vehicle.recv_kind(MessageKind::QueuePosition).await;

        dispatcher.reservations().remove("MON1234");
        let later = tokio::time::timeout(
            Duration::from_secs(25),
            vehicle.recv_kind(MessageKind::QueuePosition),
        )
        .await;
        assert!(later.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_gives_up_after_max_duration() {
        let dispatcher = monitored_dispatcher();
        let (_point, _point_rx) = answering_point(&dispatcher, 7201, 2).await;
        let (mut vehicle, _) = reserved_vehicle(&dispatcher, 7202, "MON5678", 1).await;

        let mut updates = 0;
        while let Ok(next) =
            tokio::time::timeout(Duration::from_secs(25), vehicle.reader.next_message()).await
        {
            let msg = next.unwrap().expect("connection closed");
            if msg.kind == MessageKind::QueuePosition {
                updates += 1;
            }
        }

        // ticks at 10s, 20s and 30s; the 35s deadline ends the task
        assert_eq!(updates, 3);
        assert!(dispatcher.reservations().get("MON5678").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_pushes_queue_updates() {
        let dispatcher = test_dispatcher();
        let mut point = ready_point(&dispatcher, 7001, 0).await;
        let mut vehicle = connect(&dispatcher, 7002, Origin::Vehicle);

        // point answers every poll with a queue of 2
        let answer = AvailabilityReport::new(None, 2).to_payload().unwrap();
        let responder = tokio::spawn(async move {
            while let Some(msg) = point.recv().await {
                if msg.kind == MessageKind::GetAvailability {
                    point.send(MessageKind::Availability, &answer).await;
                }
            }
        });

        vehicle.send(MessageKind::Identify, "QWE4567").await;
        let registry = dispatcher.registry().clone();
        wait_until(|| registry.lookup_by_plate("QWE4567").is_some()).await;
        vehicle.send(MessageKind::RequestCharge, "").await;
        vehicle.recv_kind(MessageKind::RegionData).await;
        vehicle.send(MessageKind::Location, "0.0,0.0").await;
        vehicle.recv_kind(MessageKind::Ranking).await;

        vehicle.send(MessageKind::RequestReservation, "1").await;
        let confirmation = vehicle.recv_kind(MessageKind::ReservationConfirmed).await;
        assert!(confirmation.content.contains("number 2"));

        let update = vehicle.recv_kind(MessageKind::QueuePosition).await;
        assert!(update.content.contains("There are 2 vehicles"));

        dispatcher.reservations().remove("QWE4567");
        responder.abort();
    }
}
