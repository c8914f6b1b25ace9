//! Activity delivery between the producer stages and the workers.
//!
//! The queue only promises delivery of serialized activities; ordering and
//! retry policy belong to the backing transport. The in-process queue backs
//! the single-node runner, where the dispatcher drains it from a background
//! task.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::Activity;

#[async_trait]
pub trait ActivityQueue: Send + Sync {
    async fn send(&self, activity: &Activity) -> anyhow::Result<()>;
}

pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<Activity>,
}

impl MemoryQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Activity>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ActivityQueue for MemoryQueue {
    async fn send(&self, activity: &Activity) -> anyhow::Result<()> {
        self.tx
            .send(activity.clone())
            .map_err(|_| anyhow::anyhow!("activity queue receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::activity::tests::sample_merge_activity;

    #[tokio::test]
    async fn delivers_in_send_order() {
        let (queue, mut rx) = MemoryQueue::channel();
        let mut first = sample_merge_activity();
        first.sk = "2024-01-04".to_string();
        let mut second = sample_merge_activity();
        second.sk = "2024-01-20".to_string();

        queue.send(&first).await.unwrap();
        queue.send(&second).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().sk, "2024-01-04");
        assert_eq!(rx.recv().await.unwrap().sk, "2024-01-20");
    }
}
