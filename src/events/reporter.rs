//! Event forwarding to the coordinator.
//!
//! The reporter subscribes to the aggregate topic and forwards every event
//! to the coordinator node. While the coordinator is unreachable, events
//! are buffered up to a fixed cap (oldest dropped on overflow) and flushed
//! in order on reconnection. `task_output` events are too high-volume to
//! buffer; they are forwarded only when connected.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use super::{Event, EventKind};

/// Buffered events kept while disconnected.
pub const BUFFER_CAP: usize = 1000;

/// Where forwarded events go; the daemon plugs in an RPC-backed sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event; `Err` means "not connected right now".
    async fn send(&self, event: &Event) -> Result<(), String>;
}

#[async_trait]
impl EventSink for crate::mesh::rpc::RpcClient {
    async fn send(&self, event: &Event) -> Result<(), String> {
        self.forward_event(event).await.map_err(|e| e.to_string())
    }
}

/// Forwarding reporter with bounded replay buffer.
pub struct Reporter<S: EventSink> {
    sink: S,
    buffer: VecDeque<Event>,
    dropped: u64,
}

impl<S: EventSink> Reporter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            buffer: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Events dropped due to buffer overflow (diagnostics).
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Handle one event: flush any backlog first, then forward.
    pub async fn handle(&mut self, event: Event) {
        if !self.flush().await {
            self.stash(event);
            return;
        }
        if self.sink.send(&event).await.is_err() {
            self.stash(event);
        }
    }

    /// Drain the consumer side of the bus until it closes.
    pub async fn run(mut self, mut rx: UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        debug!("reporter channel closed; {} events dropped total", self.dropped);
    }

    /// Replay the buffer in order; `false` when the sink is still down.
    async fn flush(&mut self) -> bool {
        while let Some(event) = self.buffer.front() {
            if self.sink.send(event).await.is_err() {
                return false;
            }
            self.buffer.pop_front();
        }
        true
    }

    fn stash(&mut self, event: Event) {
        // Streaming output is never buffered.
        if event.kind == EventKind::TaskOutput {
            return;
        }
        if self.buffer.len() >= BUFFER_CAP {
            self.buffer.pop_front();
            self.dropped += 1;
            if self.dropped % 100 == 1 {
                warn!("reporter buffer full; dropping oldest events");
            }
        }
        self.buffer.push_back(event);
    }
}
