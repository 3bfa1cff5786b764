use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// 用户订阅，决定CPU与磁盘配额
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// 订阅期内允许使用的CPU秒数
    pub cpu_quota_secs: i64,
    #[serde(default)]
    pub disk_quota_mb: i64,
}

impl Subscription {
    pub fn expired(&self) -> bool {
        self.ended_at < Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub organization_id: String,
    /// 0 表示不限制
    #[serde(default)]
    pub max_concurrency: usize,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub subscription: Option<Subscription>,
}

impl User {
    pub fn new(id: &str, organization_id: &str) -> Self {
        Self {
            id: id.to_string(),
            username: id.to_string(),
            organization_id: organization_id.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Organization {
    pub id: String,
    #[serde(default)]
    pub max_concurrency: usize,
    #[serde(default)]
    pub configs: HashMap<String, Value>,
}

/// 订阅窗口内的资源用量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceUsage {
    pub cpu_secs: i64,
    pub disk_mb: i64,
}
