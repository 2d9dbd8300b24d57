use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownEvent {
    /// First CTRL+C: abort the job and wait for its final frame.
    AbortJob,
    /// Second CTRL+C: exit without waiting.
    Immediate,
}

#[derive(Debug, Default)]
pub struct InterruptCounter {
    seen: AtomicU8,
}

impl InterruptCounter {
    pub fn record(&self) -> ShutdownEvent {
        match self.seen.fetch_add(1, Ordering::SeqCst) {
            0 => ShutdownEvent::AbortJob,
            _ => ShutdownEvent::Immediate,
        }
    }
}

/// CTRL+C events for the main loop. Once the handler is gone, `next` never resolves.
pub struct ShutdownListener {
    rx: Option<mpsc::UnboundedReceiver<ShutdownEvent>>,
}

impl ShutdownListener {
    fn new(rx: mpsc::UnboundedReceiver<ShutdownEvent>) -> Self {
        Self { rx: Some(rx) }
    }

    pub async fn next(&mut self) -> ShutdownEvent {
        let event = match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        };
        match event {
            Some(event) => event,
            None => {
                self.rx = None;
                std::future::pending().await
            }
        }
    }
}

pub fn spawn_ctrl_c_handler(counter: Arc<InterruptCounter>) -> ShutdownListener {
    let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let event = counter.record();
            let _ = shutdown_tx.send(event);
            if event == ShutdownEvent::Immediate {
                return;
            }
        }
    });
    ShutdownListener::new(shutdown_rx)
}
