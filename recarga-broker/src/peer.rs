//! Connected peer handle

use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use recarga_core::{
    AvailabilityReport, ChannelError, Message, MessageKind, PointId, SharedWriter,
};
use tokio::io::AsyncWrite;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::config::RetryPolicy;

/// Opaque connection identifier
pub type ConnId = u64;

/// Type-erased write half of a peer connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type AvailabilityWaiter = oneshot::Sender<Option<AvailabilityReport>>;

/// One connected vehicle or charging point.
///
/// Owns the write half of the connection. Closing is idempotent: the stream
/// is shut down by the first call only, and every pending availability waiter
/// is resolved as unavailable.
pub struct Peer {
    id: ConnId,
    addr: SocketAddr,
    writer: SharedWriter<BoxedWriter>,
    closed: watch::Sender<bool>,
    waiters: Mutex<Vec<AvailabilityWaiter>>,
}

impl Peer {
    pub fn new(id: ConnId, addr: SocketAddr, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            addr,
            writer: SharedWriter::new(Box::new(writer)),
            closed,
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Placeholder identity of a vehicle that has not confirmed a plate
    pub fn placeholder_identity(&self) -> String {
        self.addr.to_string()
    }

    pub async fn send(&self, msg: &Message) -> Result<(), ChannelError> {
        self.writer.send_message(msg).await
    }

    /// Send with bounded retries; returns the last error
    pub async fn send_with_retry(&self, msg: &Message, retry: RetryPolicy) -> Result<(), ChannelError> {
        let mut attempt = 1;
        loop {
            match self.send(msg).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= retry.attempts || self.is_closed() => return Err(e),
                Err(e) => {
                    warn!(
                        "Peer: attempt {} sending {} to {} failed: {}",
                        attempt, msg.kind, self.addr, e
                    );
                    attempt += 1;
                    tokio::time::sleep(retry.backoff).await;
                }
            }
        }
    }

    /// Close the connection. Returns true only for the call that closed it.
    ///
    /// The closed flag and pending waiters are settled before the stream
    /// shutdown, which may wait behind a send stuck on a full socket.
    pub async fn close(&self) -> bool {
        let first = !self.closed.send_replace(true);
        self.fail_waiters();
        self.writer.close().await;
        if first {
            debug!("Peer: closed connection {} ({})", self.id, self.addr);
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the peer has been closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // the sender lives in self, so wait_for only ends when the flag flips
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Ask a charging point for its queue length and wait for the answer.
    ///
    /// Returns `None` on send failure, peer loss or timeout.
    pub async fn query_availability(&self, point_id: PointId, wait: Duration) -> Option<AvailabilityReport> {
        let rx = self.add_waiter();
        let request = Message::server(
            MessageKind::GetAvailability,
            format!("Hello charging point {}! Report your availability / queue", point_id),
        );

        if let Err(e) = self.send(&request).await {
            debug!("Peer: availability request to point {} failed: {}", point_id, e);
            return None;
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(report)) => report,
            Ok(Err(_)) => None,
            Err(_) => {
                debug!("Peer: point {} did not report availability in {:?}", point_id, wait);
                None
            }
        }
    }

    /// Register a waiter for the next availability report
    pub fn add_waiter(&self) -> oneshot::Receiver<Option<AvailabilityReport>> {
        let (tx, rx) = oneshot::channel();
        if self.is_closed() {
            let _ = tx.send(None);
        } else {
            self.waiters.lock().push(tx);
        }
        rx
    }

    /// Hand a report to every pending waiter; returns how many were waiting
    pub fn resolve_waiters(&self, report: AvailabilityReport) -> usize {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Some(report));
        }
        count
    }

    fn fail_waiters(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            let _ = waiter.send(None);
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
