//! EventSink port - 通知の抽象化
//!
//! - NoopEventSink: 何もしない
//! - BroadcastEventSink（impls）: tokio broadcast で購読者に配信

use crate::domain::SchedulerEvent;

/// EventSink は scheduler のイベントを受け取る
///
/// `emit` は同期・非ブロッキングでなければならない（executor の中から呼ばれる）。
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SchedulerEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: SchedulerEvent) {}
}
