//! EventHub - scheduler イベントの配信口
//!
//! 内蔵の broadcast チャネル（`Scheduler::subscribe`）と、builder で
//! 追加された EventSink の両方に配信します。

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::domain::{SchedulerEvent, TaskRecord, TaskStatus};
use crate::impls::BroadcastEventSink;
use crate::ports::EventSink;

pub(crate) struct EventHub {
    broadcast: BroadcastEventSink,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventHub {
    pub(crate) fn new(capacity: usize, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            broadcast: BroadcastEventSink::new(capacity),
            sinks,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.broadcast.subscribe()
    }

    pub(crate) fn emit(&self, event: SchedulerEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
        self.broadcast.emit(event);
    }

    /// `task` supplies identity only; `status` is the new status.
    pub(crate) fn status_changed(&self, task: &TaskRecord, status: TaskStatus, error: Option<String>) {
        self.emit(SchedulerEvent::TaskStatusChanged {
            task_id: task.id,
            project_id: task.project_id.clone(),
            stage: task.stage,
            status,
            error,
        });
    }
}
