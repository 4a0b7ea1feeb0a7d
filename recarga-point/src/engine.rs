//! Charging point queue engine
//!
//! One service slot, strict FIFO:
//!
//! ```text
//! IDLE --(queue non-empty)--> CALLING
//! CALLING --(call sent)--> AWAITING_ARRIVAL
//! AWAITING_ARRIVAL --(arrival)--> CHARGING
//! AWAITING_ARRIVAL --(timeout)--> IDLE          head dropped, broker told
//! CHARGING --(charge duration)--> SETTLING     cost computed
//! SETTLING --(summary sent)--> IDLE            head dropped
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use recarga_core::{AvailabilityReport, ChargeSummary, Message, MessageKind, MessageSink};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::PointConfig;
use crate::error::PointError;
use crate::queue::{LocalQueue, WakeSignal};

/// Phase of the single service slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Calling,
    AwaitingArrival,
    Charging,
    Settling,
}

struct EngineState {
    queue: LocalQueue,
    phase: Phase,
    /// Armed arrival waiter for the head plate
    arrival: Option<(String, oneshot::Sender<()>)>,
}

/// Serializes service at one charging point
pub struct QueueEngine<S, R> {
    config: PointConfig,
    sink: S,
    rng: Mutex<R>,
    state: Mutex<EngineState>,
    wake: WakeSignal,
}

impl<S: MessageSink, R: Rng + Send> QueueEngine<S, R> {
    pub fn new(config: PointConfig, sink: S, rng: R) -> Self {
        Self {
            config,
            sink,
            rng: Mutex::new(rng),
            state: Mutex::new(EngineState {
                queue: LocalQueue::new(),
                phase: Phase::Idle,
                arrival: None,
            }),
            wake: WakeSignal::new(),
        }
    }

    /// Outgoing channel to the broker
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn queued_plates(&self) -> Vec<String> {
        self.state.lock().queue.plates()
    }

    /// Current queue length and whether the point is free
    pub fn availability(&self) -> AvailabilityReport {
        AvailabilityReport::new(None, self.queue_len())
    }

    /// Add a vehicle to the tail; returns its 1-based position
    pub fn enqueue(&self, plate: &str) -> usize {
        let position = self.state.lock().queue.enqueue(plate);
        self.wake.signal();
        info!("Point: {} queued at position {}", plate, position);
        position
    }

    /// Nudge the drain loop (`liberar-ponto`)
    pub fn release(&self) -> bool {
        self.wake.signal()
    }

    /// Accept an arrival for the head vehicle while it is awaited
    pub fn arrived(&self, plate: &str) -> Result<(), PointError> {
        let mut state = self.state.lock();

        match state.queue.position_of(plate) {
            None => return Err(PointError::NotInQueue(plate.to_string())),
            Some(1) => {}
            Some(position) => {
                return Err(PointError::NotAtHead {
                    plate: plate.to_string(),
                    position,
                })
            }
        }

        match state.arrival.take() {
            Some((awaited, tx)) if awaited == plate => {
                let _ = tx.send(());
                info!("Point: {} arrived", plate);
                Ok(())
            }
            other => {
                state.arrival = other;
                Err(PointError::NotAwaited(plate.to_string()))
            }
        }
    }

    /// Drain the queue forever
    pub async fn run(self: Arc<Self>) {
        info!("Point: queue engine started");
        loop {
            if !self.serve_next().await && self.wake.wait_timeout(self.config.idle_poll).await {
                debug!("Point: woken up");
            }
        }
    }

    /// Serve the head vehicle, if any. Returns false when the queue is empty.
    pub async fn serve_next(&self) -> bool {
        let (plate, arrival) = {
            let mut state = self.state.lock();
            let Some(plate) = state.queue.head().map(str::to_string) else {
                state.phase = Phase::Idle;
                return false;
            };
            let (tx, rx) = oneshot::channel();
            state.arrival = Some((plate.clone(), tx));
            state.phase = Phase::Calling;
            (plate, rx)
        };

        self.call(&plate).await;
        self.set_phase(Phase::AwaitingArrival);
        info!("Point: waiting for {} to arrive", plate);

        match tokio::time::timeout(self.config.arrival_timeout, arrival).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                self.expire(&plate).await;
                return true;
            }
        }

        self.set_phase(Phase::Charging);
        info!("Point: charging {}", plate);
        tokio::time::sleep(self.config.charge_duration).await;

        self.settle(&plate).await;
        tokio::time::sleep(self.config.settle_pause).await;
        true
    }

    fn set_phase(&self, phase: Phase) {
        self.state.lock().phase = phase;
    }

    /// Send the call, retrying the same head until it goes through
    async fn call(&self, plate: &str) {
        let mut attempt = 1;
        loop {
            let msg = Message::point(MessageKind::CallingVehicle, plate);
            match self.sink.send(msg).await {
                Ok(()) => return,
                Err(e) => {
                    error!("Point: call {} for {} failed: {}", attempt, plate, e);
                    attempt += 1;
                    tokio::time::sleep(self.config.call_retry_backoff).await;
                }
            }
        }
    }

    async fn expire(&self, plate: &str) {
        {
            let mut state = self.state.lock();
            if state.queue.head() == Some(plate) {
                state.queue.dequeue();
            }
            state.arrival = None;
            state.phase = Phase::Idle;
        }
        warn!("Point: {} did not arrive in time, removed from queue", plate);

        let notice = Message::point(MessageKind::ReservationExpired, plate);
        if let Err(e) = self.sink.send(notice).await {
            error!("Point: could not report expiry of {}: {}", plate, e);
        }
    }

    async fn settle(&self, plate: &str) {
        self.set_phase(Phase::Settling);
        let cost = self.config.cost.sample(&mut *self.rng.lock());
        let summary = ChargeSummary::new(plate, cost.consumed_kwh, cost.amount);
        info!(
            "Point: charge finished for {} - {:.2} kWh, R$ {:.2}",
            plate, summary.consumed_kwh, summary.amount
        );

        {
            let mut state = self.state.lock();
            if state.queue.head() == Some(plate) {
                state.queue.dequeue();
            }
            state.phase = Phase::Idle;
        }

        let msg = Message::point(MessageKind::ChargeFinished, summary.to_payload());
        if let Err(e) = self.sink.send(msg).await {
            error!("Point: could not report charge of {}: {}", plate, e);
        }
    }
}
