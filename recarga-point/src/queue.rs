//! Local FIFO queue and wake signal

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

/// FIFO of plates; the head is being served or about to be called
#[derive(Debug, Default, Clone)]
pub struct LocalQueue {
    plates: VecDeque<String>,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail and return the 1-based position.
    ///
    /// A plate already queued keeps its place.
    pub fn enqueue(&mut self, plate: &str) -> usize {
        if let Some(position) = self.position_of(plate) {
            return position;
        }
        self.plates.push_back(plate.to_string());
        self.plates.len()
    }

    pub fn dequeue(&mut self) -> Option<String> {
        self.plates.pop_front()
    }

    pub fn head(&self) -> Option<&str> {
        self.plates.front().map(String::as_str)
    }

    /// 1-based position of `plate`
    pub fn position_of(&self, plate: &str) -> Option<usize> {
        self.plates.iter().position(|p| p == plate).map(|i| i + 1)
    }

    pub fn len(&self) -> usize {
        self.plates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plates.is_empty()
    }

    pub fn plates(&self) -> Vec<String> {
        self.plates.iter().cloned().collect()
    }
}

/// Single-slot wake-up: signals sent while one is pending are dropped
pub struct WakeSignal {
    tx: mpsc::Sender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl WakeSignal {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Returns false if a signal was already pending
    pub fn signal(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }

    /// Wait for a signal; false on timeout
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut rx = self.rx.lock().await;
        matches!(tokio::time::timeout(timeout, rx.recv()).await, Ok(Some(())))
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}
