use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::ant::{ContainerLifecycleEvent, TaskMethod};
use super::job_execution::Artifact;
use super::state::RequestState;
use crate::{QueenError, QueenResult};

/// 发往Ant的任务动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskAction {
    #[default]
    Execute,
    /// 列出Ant上正在运行的容器
    List,
    Terminate,
}

/// 执行器（容器、Pod、Shell）的运行选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutorOptions {
    pub name: String,
    #[serde(default)]
    pub main_container: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub artifacts_directory: String,
    #[serde(default)]
    pub cache_directory: String,
    #[serde(default)]
    pub working_directory: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskRequest {
    pub action: TaskAction,
    pub job_request_id: u64,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub job_version: String,
    #[serde(default)]
    pub job_execution_id: String,
    #[serde(default)]
    pub task_execution_id: String,
    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub method: TaskMethod,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub job_retry: u32,
    #[serde(default)]
    pub task_retry: u32,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub before_script: Vec<String>,
    #[serde(default)]
    pub script: Vec<String>,
    #[serde(default)]
    pub after_script: Vec<String>,
    #[serde(default)]
    pub executor_opts: ExecutorOptions,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub artifact_ids: Vec<String>,
    /// 依赖任务产出的工件
    #[serde(default)]
    pub dependent_artifacts: Vec<Artifact>,
    #[serde(default)]
    pub fork_job_type: String,
    #[serde(default)]
    pub fork_job_version: String,
    pub created_at: DateTime<Utc>,
}

impl TaskRequest {
    /// 构造只用于查询Ant状态的请求
    pub fn list(ant_id: &str) -> Self {
        Self {
            action: TaskAction::List,
            task_type: ant_id.to_string(),
            created_at: Utc::now(),
            ..Default::default()
        }
    }

    /// 工件与缓存目录的相对路径: `{user/}job-{request}/{task}`
    pub fn key_path(&self) -> String {
        let prefix = if self.user_id.is_empty() {
            String::new()
        } else {
            format!("{}/", self.user_id)
        };
        format!("{}job-{}/{}", prefix, self.job_request_id, self.task_type)
    }

    pub fn validate(&self) -> QueenResult<()> {
        if self.action != TaskAction::Execute {
            return Ok(());
        }
        if self.job_request_id == 0 {
            return Err(QueenError::validation("任务请求缺少job_request_id"));
        }
        if self.task_type.is_empty() {
            return Err(QueenError::validation("任务请求缺少task_type"));
        }
        if self.task_execution_id.is_empty() {
            return Err(QueenError::validation("任务请求缺少task_execution_id"));
        }
        Ok(())
    }

    /// 校验后用预留上的密钥加密序列化
    pub fn marshal(&self, cipher: &dyn PayloadCipher, key: &str) -> QueenResult<Vec<u8>> {
        self.validate()?;
        let payload = serde_json::to_vec(self)?;
        cipher.seal(key, payload)
    }

    pub fn unmarshal(cipher: &dyn PayloadCipher, key: &str, payload: &[u8]) -> QueenResult<Self> {
        let plain = cipher.open(key, payload)?;
        Ok(serde_json::from_slice(&plain)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskResponse {
    pub job_request_id: u64,
    #[serde(default)]
    pub task_execution_id: String,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub task_type: String,
    pub status: RequestState,
    #[serde(default)]
    pub ant_id: String,
    #[serde(default)]
    pub host: String,
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
    pub task_context: HashMap<String, Value>,
    /// 需要合并到作业上下文中的变量
    #[serde(default)]
    pub job_context: HashMap<String, Value>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub stdout: Vec<String>,
    /// LIST动作返回的容器
    #[serde(default)]
    pub containers: Vec<ContainerLifecycleEvent>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskResponse {
    /// 以请求为模板构造一个响应，fake ant 和结果复用都用到
    pub fn for_request(request: &TaskRequest, status: RequestState, exit_code: &str) -> Self {
        Self {
            job_request_id: request.job_request_id,
            task_execution_id: request.task_execution_id.clone(),
            job_type: request.job_type.clone(),
            task_type: request.task_type.clone(),
            status,
            exit_code: exit_code.to_string(),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn marshal(&self, cipher: &dyn PayloadCipher, key: &str) -> QueenResult<Vec<u8>> {
        cipher.seal(key, serde_json::to_vec(self)?)
    }

    pub fn unmarshal(cipher: &dyn PayloadCipher, key: &str, payload: &[u8]) -> QueenResult<Self> {
        let plain = cipher.open(key, payload)?;
        Ok(serde_json::from_slice(&plain)?)
    }

    pub fn add_context(&mut self, name: &str, value: Value) {
        self.task_context.insert(name.to_string(), value);
    }
}

/// 任务消息的加解密接缝
pub trait PayloadCipher: Send + Sync {
    fn seal(&self, key: &str, payload: Vec<u8>) -> QueenResult<Vec<u8>>;
    fn open(&self, key: &str, payload: &[u8]) -> QueenResult<Vec<u8>>;
}

/// 不做任何变换，加密由队列传输层负责
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCipher;

impl PayloadCipher for PlainCipher {
    fn seal(&self, _key: &str, payload: Vec<u8>) -> QueenResult<Vec<u8>> {
        Ok(payload)
    }

    fn open(&self, _key: &str, payload: &[u8]) -> QueenResult<Vec<u8>> {
        Ok(payload.to_vec())
    }
}
