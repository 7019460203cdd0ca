//! Upper-layer delivery of inbound frames

use tokio::sync::broadcast;

use crate::frame::InboundFrame;

/// Receiver of accepted inbound frames
///
/// Called synchronously from the receive loop of the interface the frame
/// arrived on. A sink that blocks stalls reception on that interface.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: InboundFrame);
}

impl<F> FrameSink for F
where
    F: Fn(InboundFrame) + Send + Sync,
{
    fn on_frame(&self, frame: InboundFrame) {
        self(frame)
    }
}

/// Fans inbound frames out to any number of async subscribers
///
/// Frames arriving while nobody is subscribed are dropped; slow subscribers
/// see `RecvError::Lagged` instead of blocking the receive loop.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<InboundFrame>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundFrame> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl FrameSink for BroadcastSink {
    fn on_frame(&self, frame: InboundFrame) {
        // No receivers, but that's okay
        let _ = self.tx.send(frame);
    }
}
