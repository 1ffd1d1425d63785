//! EventBus - lifecycle イベントの配信
//!
//! polling / ephemeral の両 lifecycle が同じ bus に publish し、
//! facade（run_now 待ち）や外部の監視コレクタが subscribe します。
//!
//! # ルール
//! - publish はブロックしない（subscriber がいなければ捨てられる）
//! - ring buffer は全 receiver で共有。遅れた receiver は `Lagged(n)` を受けて n 件飛ばす
//! - 永続化しない。subscribe 後に publish されたイベントだけが届く

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::TaskEvent;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<TaskEvent>>,
}

impl EventBus {
    /// Capacity is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: TaskEvent) {
        trace!(task_id = %event.id, event = event.name(), "publish");
        let _ = self.tx.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TaskEvent>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErroredTask, TaskId};
    use chrono::Utc;
    use tokio::sync::broadcast::error::RecvError;

    fn failed(id: &str) -> TaskEvent {
        TaskEvent::run(
            TaskId::new(id),
            Utc::now(),
            Err(ErroredTask {
                id: TaskId::new(id),
                error: "boom".to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn subscribers_only_see_later_events() {
        let bus = EventBus::new(8);
        bus.publish(failed("before"));

        let mut rx = bus.subscribe();
        bus.publish(failed("after"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.id.as_str(), "after");
    }

    #[tokio::test]
    async fn slow_subscribers_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for n in 0..5 {
            bus.publish(failed(&format!("t{n}")));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().id.as_str(), "t3");
    }
}
