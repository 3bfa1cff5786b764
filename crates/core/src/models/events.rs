use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::ant::AntReservation;
use super::job_execution::{JobExecution, JobRequest, TaskExecution};
use super::state::RequestState;
use crate::QueenResult;

/// 在队列上传输的事件统一使用JSON编码
pub trait QueueEvent: Serialize + DeserializeOwned {
    fn encode(&self) -> QueenResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(payload: &[u8]) -> QueenResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// 所有事件共有的字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    pub id: String,
    /// 产生事件的服务器ID
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl EventHeader {
    pub fn new(source: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// 通知启动器开始运行某个作业执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionLaunchEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub job_request_id: u64,
    pub job_type: String,
    pub job_execution_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
    /// 任务类型 -> 预留
    #[serde(default)]
    pub reservations: HashMap<String, AntReservation>,
}

impl JobExecutionLaunchEvent {
    pub fn new(
        source: &str,
        request: &JobRequest,
        job_execution_id: &str,
        reservations: HashMap<String, AntReservation>,
    ) -> Self {
        Self {
            header: EventHeader::new(source),
            job_request_id: request.id,
            job_type: request.job_type.clone(),
            job_execution_id: job_execution_id.to_string(),
            user_id: request.user_id.clone(),
            organization_id: request.organization_id.clone(),
            reservations,
        }
    }
}

impl QueueEvent for JobExecutionLaunchEvent {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionLifecycleEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub job_request_id: u64,
    #[serde(default)]
    pub job_execution_id: String,
    pub job_type: String,
    pub job_state: RequestState,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub contexts: HashMap<String, Value>,
}

impl JobExecutionLifecycleEvent {
    pub fn new(source: &str, request: &JobRequest, execution: Option<&JobExecution>) -> Self {
        Self {
            header: EventHeader::new(source),
            job_request_id: request.id,
            job_execution_id: execution.map(|e| e.id.clone()).unwrap_or_default(),
            job_type: request.job_type.clone(),
            job_state: request.job_state,
            priority: request.priority,
            user_id: request.user_id.clone(),
            organization_id: request.organization_id.clone(),
            error_code: request.error_code.clone(),
            contexts: execution.map(|e| e.contexts.clone()).unwrap_or_default(),
        }
    }
}

impl QueueEvent for JobExecutionLifecycleEvent {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionLifecycleEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub job_request_id: u64,
    pub job_execution_id: String,
    pub task_execution_id: String,
    pub job_type: String,
    pub task_type: String,
    pub task_state: RequestState,
    #[serde(default)]
    pub exit_code: String,
    #[serde(default)]
    pub ant_id: String,
    #[serde(default)]
    pub user_id: String,
}

impl TaskExecutionLifecycleEvent {
    pub fn new(source: &str, request: &JobRequest, task: &TaskExecution) -> Self {
        Self {
            header: EventHeader::new(source),
            job_request_id: request.id,
            job_execution_id: task.job_execution_id.clone(),
            task_execution_id: task.id.clone(),
            job_type: request.job_type.clone(),
            task_type: task.task_type.clone(),
            task_state: task.task_state,
            exit_code: task.exit_code.clone(),
            ant_id: task.ant_id.clone(),
            user_id: request.user_id.clone(),
        }
    }
}

impl QueueEvent for TaskExecutionLifecycleEvent {}

impl QueueEvent for super::ant::AntRegistration {}
impl QueueEvent for super::ant::ContainerLifecycleEvent {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_event_wire_shape() {
        let mut request = JobRequest::new(12, "def", "build");
        request.job_state = RequestState::Cancelled;
        let event = JobExecutionLifecycleEvent::new("queen-1", &request, None);
        let payload = event.encode().unwrap();

        let raw: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(raw["job_state"], "CANCELLED");
        assert_eq!(raw["source"], "queen-1");
        assert!(raw.get("header").is_none());

        let decoded = JobExecutionLifecycleEvent::decode(&payload).unwrap();
        assert_eq!(decoded.job_request_id, 12);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(JobExecutionLaunchEvent::decode(b"not json").is_err());
    }
}
