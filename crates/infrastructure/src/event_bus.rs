use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// 进程内的发布订阅总线
///
/// 按主题字符串分发事件给当前所有订阅者，不经过消息队列。
/// 订阅者落后超过容量时会丢失最早的事件。
#[derive(Clone)]
pub struct LocalEventBus<T: Clone + Send + 'static> {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<T>>>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> LocalEventBus<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// 发布事件，返回收到事件的订阅者数量
    pub async fn publish(&self, topic: &str, event: T) -> usize {
        let sender = self.topics.read().await.get(topic).cloned();
        let Some(sender) = sender else {
            return 0;
        };
        match sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                // 所有订阅者都已离开
                let mut topics = self.topics.write().await;
                if topics.get(topic).map(|s| s.receiver_count() == 0).unwrap_or(false) {
                    topics.remove(topic);
                    debug!("事件主题 '{}' 已无订阅者，移除", topic);
                }
                0
            }
        }
    }

    /// 订阅主题，丢弃返回的接收端即取消订阅
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<T> {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl<T: Clone + Send + 'static> Default for LocalEventBus<T> {
    fn default() -> Self {
        Self::new(256)
    }
}
