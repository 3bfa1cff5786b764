use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::ant::TaskMethod;
use super::job_definition::TaskDefinition;
use super::state::RequestState;

/// 一次作业运行请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: u64,
    pub job_definition_id: String,
    pub job_type: String,
    #[serde(default)]
    pub job_version: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
    pub job_state: RequestState,
    #[serde(default)]
    pub job_execution_id: String,
    #[serde(default)]
    pub last_job_execution_id: String,
    #[serde(default)]
    pub retried: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub cron_triggered: bool,
    #[serde(default)]
    pub schedule_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRequest {
    pub fn new(id: u64, definition_id: &str, job_type: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_definition_id: definition_id.to_string(),
            job_type: job_type.to_string(),
            job_version: String::new(),
            user_id: String::new(),
            organization_id: String::new(),
            job_state: RequestState::Pending,
            job_execution_id: String::new(),
            last_job_execution_id: String::new(),
            retried: 0,
            priority: 0,
            cron_triggered: false,
            schedule_attempts: 0,
            scheduled_at: now,
            error_code: String::new(),
            error_message: String::new(),
            params: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_user(mut self, user_id: &str, organization_id: &str) -> Self {
        self.user_id = user_id.to_string();
        self.organization_id = organization_id.to_string();
        self
    }

    pub fn with_param(mut self, name: &str, value: Value) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }

    /// 递增并返回重试次数
    pub fn incr_retried(&mut self) -> u32 {
        self.retried += 1;
        self.retried
    }
}

/// 作业请求一次尝试的运行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: String,
    pub job_request_id: u64,
    pub job_type: String,
    #[serde(default)]
    pub job_version: String,
    pub job_state: RequestState,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub tasks: Vec<TaskExecution>,
    #[serde(default)]
    pub contexts: HashMap<String, Value>,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobExecution {
    /// 为作业请求创建一个 READY 状态的运行记录
    pub fn new(request: &JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_request_id: request.id,
            job_type: request.job_type.clone(),
            job_version: request.job_version.clone(),
            job_state: RequestState::Ready,
            user_id: request.user_id.clone(),
            organization_id: request.organization_id.clone(),
            tasks: Vec::new(),
            contexts: HashMap::new(),
            error_code: String::new(),
            error_message: String::new(),
            started_at: now,
            ended_at: None,
            updated_at: now,
        }
    }

    pub fn get_task(&self, task_type: &str) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.task_type == task_type)
    }

    pub fn delete_task(&mut self, id: &str) -> Option<TaskExecution> {
        let pos = self.tasks.iter().position(|t| t.id == id)?;
        Some(self.tasks.remove(pos))
    }

    /// 插入或替换同ID的任务执行记录
    pub fn upsert_task(&mut self, task: TaskExecution) {
        match self.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task,
            None => self.tasks.push(task),
        }
    }

    pub fn add_context(&mut self, name: &str, value: Value) {
        self.contexts.insert(name.to_string(), value);
    }

    pub fn elapsed_secs(&self) -> i64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.started_at).num_seconds()
    }
}

/// 工件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    #[default]
    Task,
    Log,
    Cache,
    Other,
}

/// 任务产出的工件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Artifact {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: ArtifactKind,
    #[serde(default)]
    pub job_request_id: u64,
    #[serde(default)]
    pub job_execution_id: String,
    #[serde(default)]
    pub task_execution_id: String,
    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub content_length: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Artifact {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn add_metadata(&mut self, name: &str, value: &str) {
        self.metadata.insert(name.to_string(), value.to_string());
    }
}

/// 任务的一次尝试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
    pub job_execution_id: String,
    pub task_type: String,
    pub method: TaskMethod,
    pub task_state: RequestState,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub exit_code: String,
    #[serde(default)]
    pub exit_message: String,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub failed_command: String,
    #[serde(default)]
    pub ant_id: String,
    #[serde(default)]
    pub ant_host: String,
    #[serde(default)]
    pub retried: u32,
    #[serde(default)]
    pub task_order: usize,
    #[serde(default)]
    pub contexts: HashMap<String, Value>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub stdout: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskExecution {
    pub fn new(job_execution_id: &str, definition: &TaskDefinition, task_order: usize) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_execution_id: job_execution_id.to_string(),
            task_type: definition.task_type.clone(),
            method: definition.method,
            task_state: RequestState::Ready,
            allow_failure: definition.allow_failure,
            exit_code: String::new(),
            exit_message: String::new(),
            error_code: String::new(),
            error_message: String::new(),
            failed_command: String::new(),
            ant_id: String::new(),
            ant_host: String::new(),
            retried: 0,
            task_order,
            contexts: HashMap::new(),
            artifacts: Vec::new(),
            stdout: Vec::new(),
            started_at: now,
            ended_at: None,
            updated_at: now,
        }
    }

    pub fn add_context(&mut self, name: &str, value: Value) {
        self.contexts.insert(name.to_string(), value);
    }

    pub fn add_artifact(&mut self, artifact: Artifact) {
        match self.artifacts.iter_mut().find(|a| a.id == artifact.id) {
            Some(existing) => *existing = artifact,
            None => self.artifacts.push(artifact),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.task_state.is_failed()
    }
}
