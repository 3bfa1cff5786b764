//! 消息队列客户端接口
//!
//! 提供四种原语：
//! - `publish`：广播到主题的所有订阅者（共享订阅组内只投递给一个成员）
//! - `send`：点对点投递给主题的一个订阅者
//! - `send_receive`：点对点投递并等待带相同关联ID的回复
//! - `subscribe`：注册处理函数，处理函数返回 `Ok` 即确认，返回 `Err` 则重新投递

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::QueenResult;

/// 消息头名称
pub mod headers {
    pub const CORRELATION_ID: &str = "CorrelationID";
    pub const REPLY_TOPIC: &str = "ReplyTopic";
    pub const SOURCE: &str = "Source";
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    /// 已经投递的次数，首次投递为1
    pub delivery_count: u32,
    pub created_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: String::new(),
            payload,
            headers: HashMap::new(),
            delivery_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(headers::CORRELATION_ID)
    }

    pub fn reply_topic(&self) -> Option<&str> {
        self.header(headers::REPLY_TOPIC)
    }

    /// 构造对本消息的回复，带上关联ID
    pub fn reply(&self, payload: Vec<u8>) -> QueueMessage {
        let mut reply = QueueMessage::new(payload);
        if let Some(id) = self.correlation_id() {
            reply = reply.with_header(headers::CORRELATION_ID, id);
        }
        reply
    }
}

/// 订阅选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub topic: String,
    /// 共享订阅组，同组内的订阅者以负载均衡方式接收消息
    pub group: Option<String>,
}

impl SubscribeOptions {
    pub fn exclusive(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            group: None,
        }
    }

    pub fn shared(topic: &str, group: &str) -> Self {
        Self {
            topic: topic.to_string(),
            group: Some(group.to_string()),
        }
    }
}

/// 消息处理函数
pub type MessageHandler =
    Arc<dyn Fn(QueueMessage) -> BoxFuture<'static, QueenResult<()>> + Send + Sync>;

/// 把异步闭包包装成 [`MessageHandler`]
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueenResult<()>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn publish(&self, topic: &str, message: QueueMessage) -> QueenResult<()>;

    async fn send(&self, topic: &str, message: QueueMessage) -> QueenResult<()>;

    /// 发送后等待 `reply_topic` 上关联ID相同的回复，超时由调用方控制
    async fn send_receive(
        &self,
        topic: &str,
        message: QueueMessage,
        reply_topic: &str,
    ) -> QueenResult<QueueMessage>;

    /// 返回订阅ID
    async fn subscribe(&self, options: SubscribeOptions, handler: MessageHandler)
        -> QueenResult<String>;

    async fn unsubscribe(&self, subscription_id: &str) -> QueenResult<()>;

    async fn close(&self) -> QueenResult<()>;
}
