use async_trait::async_trait;
use queen_core::config::QueueConfig;
use queen_core::traits::{
    headers, MessageHandler, QueueClient, QueueMessage, SubscribeOptions,
};
use queen_core::{QueenError, QueenResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 内存队列客户端
///
/// 使用 Tokio channels 在进程内实现发布订阅、点对点发送和请求应答，
/// 适用于嵌入式部署和测试。每个订阅拥有独立的投递通道和消费任务，
/// 处理函数返回错误时按配置重新投递。
pub struct InMemoryQueueClient {
    /// 主题名 -> 订阅者与积压消息
    topics: Arc<RwLock<HashMap<String, TopicChannels>>>,
    /// 关联ID -> 等待回复的请求
    pending: Arc<Mutex<HashMap<String, PendingReply>>>,
    /// 订阅ID -> 主题名
    subscriptions: Arc<RwLock<HashMap<String, String>>>,
    config: InMemoryQueueConfig,
}

#[derive(Default)]
struct TopicChannels {
    subscribers: Vec<Subscriber>,
    /// 点对点发送时的轮询位置
    next_subscriber: usize,
    /// 共享订阅组 -> 轮询位置
    next_in_group: HashMap<String, usize>,
    /// 没有订阅者时 `send` 的消息先积压在这里
    backlog: VecDeque<QueueMessage>,
}

struct Subscriber {
    id: String,
    group: Option<String>,
    sender: mpsc::UnboundedSender<QueueMessage>,
    worker: JoinHandle<()>,
}

struct PendingReply {
    reply_topic: String,
    sender: oneshot::Sender<QueueMessage>,
}

#[derive(Debug, Clone)]
pub struct InMemoryQueueConfig {
    /// 处理失败后最多重新投递的次数
    pub max_redeliveries: u32,
    /// 重新投递前的等待时间
    pub redelivery_delay: Duration,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: 3,                          // 默认最多重投3次
            redelivery_delay: Duration::from_millis(100), // 默认100ms后重投
        }
    }
}

impl From<&QueueConfig> for InMemoryQueueConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_redeliveries: config.max_redeliveries,
            redelivery_delay: config.redelivery_delay(),
        }
    }
}

/// 在 `send_receive` 返回或被取消时清理等待表
struct PendingGuard {
    pending: Arc<Mutex<HashMap<String, PendingReply>>>,
    correlation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let pending = self.pending.clone();
        let correlation_id = std::mem::take(&mut self.correlation_id);
        if let Ok(mut map) = pending.try_lock() {
            map.remove(&correlation_id);
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                pending.lock().await.remove(&correlation_id);
            });
        }
    }
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self::with_config(InMemoryQueueConfig::default())
    }

    pub fn with_config(config: InMemoryQueueConfig) -> Self {
        info!("创建内存队列客户端: {:?}", config);
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// 主题当前的订阅者数量
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|channels| channels.subscribers.len())
            .unwrap_or(0)
    }

    /// 主题积压的点对点消息数量
    pub async fn backlog_len(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|channels| channels.backlog.len())
            .unwrap_or(0)
    }

    /// 如果消息是某个 `send_receive` 等待的回复，直接交给等待方
    async fn try_complete_reply(&self, topic: &str, message: QueueMessage) -> Option<QueueMessage> {
        let Some(correlation_id) = message.correlation_id().map(str::to_string) else {
            return Some(message);
        };
        let mut pending = self.pending.lock().await;
        match pending.get(&correlation_id) {
            Some(waiter) if waiter.reply_topic == topic => {}
            _ => return Some(message),
        }
        if let Some(waiter) = pending.remove(&correlation_id) {
            debug!("收到关联ID {} 的回复，主题 '{}'", correlation_id, topic);
            if waiter.sender.send(message).is_err() {
                debug!("等待关联ID {} 的请求已经放弃", correlation_id);
            }
        }
        None
    }

    fn spawn_worker(
        &self,
        topic: String,
        subscription_id: String,
        handler: MessageHandler,
        sender: mpsc::UnboundedSender<QueueMessage>,
        mut receiver: mpsc::UnboundedReceiver<QueueMessage>,
    ) -> JoinHandle<()> {
        let config = self.config.clone();
        tokio::spawn(async move {
            while let Some(mut message) = receiver.recv().await {
                message.delivery_count += 1;
                let message_id = message.id.clone();
                match handler(message.clone()).await {
                    Ok(()) => {
                        debug!("消息 {} 已确认，主题 '{}'", message_id, topic);
                    }
                    Err(e) if message.delivery_count <= config.max_redeliveries => {
                        warn!(
                            "处理消息 {} 失败，将重新投递（第{}次）: {}",
                            message_id, message.delivery_count, e
                        );
                        let sender = sender.clone();
                        let delay = config.redelivery_delay;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = sender.send(message);
                        });
                    }
                    Err(e) => {
                        warn!(
                            "消息 {} 超过最大重投次数，丢弃，订阅 {}: {}",
                            message_id, subscription_id, e
                        );
                    }
                }
            }
            debug!("订阅 {} 的消费任务退出", subscription_id);
        })
    }
}

impl Default for InMemoryQueueClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn publish(&self, topic: &str, mut message: QueueMessage) -> QueenResult<()> {
        message.topic = topic.to_string();
        let Some(message) = self.try_complete_reply(topic, message).await else {
            return Ok(());
        };

        let mut topics = self.topics.write().await;
        let Some(channels) = topics.get_mut(topic) else {
            debug!("主题 '{}' 没有订阅者，丢弃消息 {}", topic, message.id);
            return Ok(());
        };

        // 独占订阅者各收一份，每个共享组只投递给组内一个成员
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, subscriber) in channels.subscribers.iter().enumerate() {
            match &subscriber.group {
                Some(group) => groups.entry(group.clone()).or_default().push(index),
                None => {
                    let _ = subscriber.sender.send(message.clone());
                }
            }
        }
        for (group, members) in groups {
            let cursor = channels.next_in_group.entry(group).or_insert(0);
            let index = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            let _ = channels.subscribers[index].sender.send(message.clone());
        }
        debug!("消息 {} 已发布到主题 '{}'", message.id, topic);
        Ok(())
    }

    async fn send(&self, topic: &str, mut message: QueueMessage) -> QueenResult<()> {
        message.topic = topic.to_string();
        let Some(message) = self.try_complete_reply(topic, message).await else {
            return Ok(());
        };

        let mut topics = self.topics.write().await;
        let channels = topics.entry(topic.to_string()).or_default();
        if channels.subscribers.is_empty() {
            debug!("主题 '{}' 暂无订阅者，消息 {} 进入积压", topic, message.id);
            channels.backlog.push_back(message);
            return Ok(());
        }
        let index = channels.next_subscriber % channels.subscribers.len();
        channels.next_subscriber = channels.next_subscriber.wrapping_add(1);
        channels.subscribers[index]
            .sender
            .send(message)
            .map_err(|e| QueenError::message_queue(format!("发送到主题 '{}' 失败: {}", topic, e)))
    }

    async fn send_receive(
        &self,
        topic: &str,
        message: QueueMessage,
        reply_topic: &str,
    ) -> QueenResult<QueueMessage> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let message = message
            .with_header(headers::CORRELATION_ID, &correlation_id)
            .with_header(headers::REPLY_TOPIC, reply_topic);

        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(
            correlation_id.clone(),
            PendingReply {
                reply_topic: reply_topic.to_string(),
                sender,
            },
        );
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            correlation_id: correlation_id.clone(),
        };

        self.send(topic, message).await?;
        receiver.await.map_err(|_| {
            QueenError::message_queue(format!("等待关联ID {} 的回复时通道关闭", correlation_id))
        })
    }

    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: MessageHandler,
    ) -> QueenResult<String> {
        if options.topic.is_empty() {
            return Err(QueenError::validation("订阅主题不能为空"));
        }
        let subscription_id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = self.spawn_worker(
            options.topic.clone(),
            subscription_id.clone(),
            handler,
            sender.clone(),
            receiver,
        );

        let mut topics = self.topics.write().await;
        let channels = topics.entry(options.topic.clone()).or_default();
        // 积压的点对点消息交给第一个订阅者
        while let Some(message) = channels.backlog.pop_front() {
            let _ = sender.send(message);
        }
        channels.subscribers.push(Subscriber {
            id: subscription_id.clone(),
            group: options.group.clone(),
            sender,
            worker,
        });
        drop(topics);

        self.subscriptions
            .write()
            .await
            .insert(subscription_id.clone(), options.topic.clone());
        info!(
            "订阅主题 '{}'，订阅ID {}，共享组 {:?}",
            options.topic, subscription_id, options.group
        );
        Ok(subscription_id)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> QueenResult<()> {
        let Some(topic) = self.subscriptions.write().await.remove(subscription_id) else {
            warn!("订阅 {} 不存在", subscription_id);
            return Ok(());
        };
        let mut topics = self.topics.write().await;
        if let Some(channels) = topics.get_mut(&topic) {
            if let Some(pos) = channels.subscribers.iter().position(|s| s.id == subscription_id) {
                let subscriber = channels.subscribers.remove(pos);
                subscriber.worker.abort();
            }
        }
        info!("取消订阅 {}，主题 '{}'", subscription_id, topic);
        Ok(())
    }

    async fn close(&self) -> QueenResult<()> {
        let mut topics = self.topics.write().await;
        for (_, channels) in topics.drain() {
            for subscriber in channels.subscribers {
                subscriber.worker.abort();
            }
        }
        self.subscriptions.write().await.clear();
        self.pending.lock().await.clear();
        info!("内存队列客户端已关闭");
        Ok(())
    }
}
