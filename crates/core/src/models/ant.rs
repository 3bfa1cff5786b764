use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::state::RequestState;
use crate::{QueenError, QueenResult};

/// 容器标签中记录作业请求ID的键
pub const LABEL_REQUEST_ID: &str = "RequestID";
pub const LABEL_USER_ID: &str = "UserID";
pub const LABEL_ORG_ID: &str = "OrgID";
pub const LABEL_SERVER: &str = "QueenServer";

/// 任务执行方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskMethod {
    #[default]
    Shell,
    Docker,
    Kubernetes,
    HttpGet,
    HttpPostForm,
    HttpPostJson,
    HttpPutJson,
    HttpDelete,
    ForkJob,
    AwaitForkedJob,
    Messaging,
    #[serde(rename = "WEBSOCKET")]
    WebSocket,
    ExpireArtifacts,
}

impl TaskMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMethod::Shell => "SHELL",
            TaskMethod::Docker => "DOCKER",
            TaskMethod::Kubernetes => "KUBERNETES",
            TaskMethod::HttpGet => "HTTP_GET",
            TaskMethod::HttpPostForm => "HTTP_POST_FORM",
            TaskMethod::HttpPostJson => "HTTP_POST_JSON",
            TaskMethod::HttpPutJson => "HTTP_PUT_JSON",
            TaskMethod::HttpDelete => "HTTP_DELETE",
            TaskMethod::ForkJob => "FORK_JOB",
            TaskMethod::AwaitForkedJob => "AWAIT_FORKED_JOB",
            TaskMethod::Messaging => "MESSAGING",
            TaskMethod::WebSocket => "WEBSOCKET",
            TaskMethod::ExpireArtifacts => "EXPIRE_ARTIFACTS",
        }
    }

    /// 支持缓存目录的执行方式
    pub fn supports_cache(&self) -> bool {
        matches!(
            self,
            TaskMethod::Shell | TaskMethod::Docker | TaskMethod::Kubernetes
        )
    }
}

impl fmt::Display for TaskMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskMethod {
    type Err = QueenError;

    fn from_str(s: &str) -> QueenResult<Self> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_ascii_uppercase()))
            .map_err(|_| QueenError::validation(format!("未知的执行方式: {s}")))
    }
}

/// 某个作业请求从某个Ant上借用的任务类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntAllocation {
    pub ant_id: String,
    pub ant_topic: String,
    pub job_request_id: u64,
    pub task_types: HashMap<String, RequestState>,
    pub allocated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AntAllocation {
    pub fn new(ant_id: &str, ant_topic: &str, job_request_id: u64, task_type: &str) -> Self {
        let now = Utc::now();
        let mut task_types = HashMap::new();
        task_types.insert(task_type.to_string(), RequestState::Reserved);
        Self {
            ant_id: ant_id.to_string(),
            ant_topic: ant_topic.to_string(),
            job_request_id,
            task_types,
            allocated_at: now,
            updated_at: now,
        }
    }
}

/// Ant通过心跳上报的能力描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntRegistration {
    pub ant_id: String,
    pub ant_topic: String,
    #[serde(default)]
    pub encryption_key: String,
    pub max_capacity: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub methods: Vec<TaskMethod>,
    #[serde(default)]
    pub current_load: i32,
    #[serde(default)]
    pub total_executed: i64,
    /// 按作业请求ID索引的分配记录
    #[serde(default)]
    pub allocations: HashMap<u64, AntAllocation>,
    pub created_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl AntRegistration {
    pub fn new(ant_id: &str, ant_topic: &str, max_capacity: i32, methods: Vec<TaskMethod>) -> Self {
        let now = Utc::now();
        Self {
            ant_id: ant_id.to_string(),
            ant_topic: ant_topic.to_string(),
            encryption_key: String::new(),
            max_capacity,
            tags: Vec::new(),
            methods,
            current_load: 0,
            total_executed: 0,
            allocations: HashMap::new(),
            created_at: now,
            received_at: now,
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// 校验注册信息，容量非法时修正为1
    pub fn validate(&mut self) -> QueenResult<()> {
        if self.ant_id.is_empty() {
            return Err(QueenError::validation("ant_id不能为空"));
        }
        if self.ant_topic.is_empty() {
            return Err(QueenError::validation("ant_topic不能为空"));
        }
        if self.methods.is_empty() {
            return Err(QueenError::validation("methods不能为空"));
        }
        if self.max_capacity <= 0 {
            self.max_capacity = 1;
        }
        for allocation in self.allocations.values_mut() {
            allocation.ant_id = self.ant_id.clone();
            allocation.ant_topic = self.ant_topic.clone();
        }
        Ok(())
    }

    pub fn is_alive(&self, alive_timeout: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.received_at) <= alive_timeout
    }

    /// 判断Ant是否存活并且支持指定的执行方式与全部标签
    pub fn supports(&self, method: TaskMethod, tags: &[String], alive_timeout: Duration) -> bool {
        if !self.is_alive(alive_timeout, Utc::now()) {
            return false;
        }
        if !self.methods.contains(&method) {
            return false;
        }
        tags.iter()
            .filter(|t| !t.is_empty())
            .all(|t| self.tags.iter().any(|own| own == t))
    }
}

/// 一次预留：把一个Ant绑定到一个(作业请求, 任务类型)上
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntReservation {
    pub job_request_id: u64,
    pub task_type: String,
    pub ant_id: String,
    pub ant_topic: String,
    #[serde(default)]
    pub encryption_key: String,
    pub allocated_at: DateTime<Utc>,
    pub current_load: i32,
    pub total_reservations: i32,
}

impl AntReservation {
    pub fn new(
        ant_id: &str,
        ant_topic: &str,
        job_request_id: u64,
        task_type: &str,
        current_load: i32,
        total_reservations: i32,
    ) -> Self {
        Self {
            job_request_id,
            task_type: task_type.to_string(),
            ant_id: ant_id.to_string(),
            ant_topic: ant_topic.to_string(),
            encryption_key: String::new(),
            allocated_at: Utc::now(),
            current_load,
            total_reservations,
        }
    }

    pub fn validate(&self) -> QueenResult<()> {
        if self.ant_id.is_empty() {
            return Err(QueenError::validation("预留记录缺少ant_id"));
        }
        if self.ant_topic.is_empty() {
            return Err(QueenError::validation("预留记录缺少ant_topic"));
        }
        Ok(())
    }
}

impl fmt::Display for AntReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {} (load={}, total={})",
            self.job_request_id, self.task_type, self.ant_id, self.current_load, self.total_reservations
        )
    }
}

/// Ant上报的容器生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerLifecycleEvent {
    pub ant_id: String,
    pub method: TaskMethod,
    pub container_name: String,
    #[serde(default)]
    pub container_id: String,
    pub container_state: RequestState,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ContainerLifecycleEvent {
    /// 从容器标签中解析作业请求ID
    pub fn request_id(&self) -> Option<u64> {
        self.labels
            .get(LABEL_REQUEST_ID)
            .and_then(|id| id.parse::<u64>().ok())
    }
}
