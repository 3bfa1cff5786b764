use serde::{Deserialize, Serialize};

pub const ERR_JOB_EXECUTE: &str = "ERR_JOB_EXECUTE";
pub const ERR_QUOTA_EXCEEDED: &str = "ERR_QUOTA_EXCEEDED";
pub const ERR_JOB_SCHEDULE: &str = "ERR_JOB_SCHEDULE";
pub const ERR_JOB_CANCELLED: &str = "ERR_JOB_CANCELLED";
pub const ERR_ANTS_UNAVAILABLE: &str = "ERR_ANTS_UNAVAILABLE";
pub const ERR_TASK_EXECUTE: &str = "ERR_TASK_EXECUTE";
pub const ERR_INVALID_NEXT_TASK: &str = "ERR_INVALID_NEXT_TASK";
pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_FILTERED_JOB: &str = "ERR_FILTERED_JOB";
pub const ERR_ANT_RESOURCES: &str = "ERR_ANT_RESOURCES";
pub const ERR_FATAL: &str = "ERR_FATAL";
pub const ERR_RESTART_JOB: &str = "ERR_RESTART_JOB";
pub const ERR_RESTART_TASK: &str = "ERR_RESTART_TASK";
pub const ERR_TASK_TIMED_OUT: &str = "ERR_TASK_TIMED_OUT";
pub const ERR_PAUSE_JOB: &str = "ERR_PAUSE_JOB";

/// 跳出作业重试循环的错误码
pub fn is_terminal_code(code: &str) -> bool {
    matches!(code, ERR_FATAL | ERR_RESTART_JOB | ERR_PAUSE_JOB)
}

/// 错误码匹配后采取的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCodeAction {
    SuspendJob,
    RetryJob,
    RetryTask,
    #[default]
    HardFailure,
}

/// 错误码仓库中的一条记录
///
/// `pattern` 与错误信息做不区分大小写的包含匹配，
/// 其余的作用域字段为空时表示不限制。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ErrorCode {
    pub id: String,
    pub pattern: String,
    pub error_code: String,
    #[serde(default)]
    pub action: ErrorCodeAction,
    /// 动作为 RETRY_JOB/RETRY_TASK 时覆盖的重试次数
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub platform_scope: String,
    #[serde(default)]
    pub command_scope: String,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub task_type_scope: String,
    #[serde(default)]
    pub description: String,
}

impl ErrorCode {
    pub fn new(pattern: &str, error_code: &str, action: ErrorCodeAction, retry: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: pattern.to_string(),
            error_code: error_code.to_string(),
            action,
            retry,
            ..Default::default()
        }
    }

    /// 作用域越具体得分越高，用于多条规则同时命中时的排序
    pub fn specificity(&self) -> usize {
        [
            &self.platform_scope,
            &self.command_scope,
            &self.job_type,
            &self.task_type_scope,
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .count()
    }

    pub fn matches(
        &self,
        message: &str,
        platform: &str,
        command: &str,
        job_type: &str,
        task_type: &str,
    ) -> bool {
        let scope_ok = |scope: &str, actual: &str| scope.is_empty() || scope == actual;
        !self.pattern.is_empty()
            && message
                .to_lowercase()
                .contains(&self.pattern.to_lowercase())
            && scope_ok(&self.platform_scope, platform)
            && scope_ok(&self.command_scope, command)
            && scope_ok(&self.job_type, job_type)
            && scope_ok(&self.task_type_scope, task_type)
    }
}
