//! BroadcastEventSink - tokio broadcast で購読者にイベントを配信
//!
//! 購読者がいなくても emit は失敗しません。遅い購読者は古いイベントを
//! 取りこぼします（`RecvError::Lagged`）。

use tokio::sync::broadcast;

use crate::domain::SchedulerEvent;
use crate::ports::EventSink;

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: SchedulerEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProjectId;

    #[tokio::test]
    async fn subscribers_receive_events_emitted_after_subscribing() {
        let sink = BroadcastEventSink::default();
        sink.emit(SchedulerEvent::ProjectCompleted {
            project_id: ProjectId::new("early"),
        });

        let mut rx = sink.subscribe();
        sink.emit(SchedulerEvent::ProjectCompleted {
            project_id: ProjectId::new("p"),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            SchedulerEvent::ProjectCompleted {
                project_id: ProjectId::new("p")
            }
        );
    }
}
