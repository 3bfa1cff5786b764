use thiserror::Error;

use crate::models::error_code::{
    ERR_ANTS_UNAVAILABLE, ERR_JOB_CANCELLED, ERR_JOB_EXECUTE, ERR_QUOTA_EXCEEDED,
    ERR_TASK_TIMED_OUT, ERR_VALIDATION,
};

/// 编排引擎错误类型定义
#[derive(Debug, Clone, Error)]
pub enum QueenError {
    /// 输入缺失或格式非法，不会重试
    #[error("参数校验失败: {0}")]
    Validation(String),

    /// 暂时没有可用资源，调用方需要把作业请求重新排队
    #[error("作业需要重新排队: {0}")]
    Requeue(String),

    /// 订阅配额超限，调用方应暂停或取消而不是重试
    #[error("配额超限: {0}")]
    QuotaExceeded(String),

    /// 任务级别找不到可用的Ant
    #[error("没有可用的Ant: {0}")]
    AntsUnavailable(String),

    /// 带有结构化错误码的执行错误
    #[error("执行失败[{code}]: {message}")]
    Execution { code: String, message: String },

    #[error("作业执行记录已存在: {0}")]
    JobExecutionExists(String),

    #[error("状态非法: {0}")]
    InvalidState(String),

    #[error("{kind}未找到: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("持久化错误: {0}")]
    Persistence(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("操作已取消: {0}")]
    Cancelled(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl QueenError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn requeue<S: Into<String>>(msg: S) -> Self {
        Self::Requeue(msg.into())
    }

    pub fn quota_exceeded<S: Into<String>>(msg: S) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn ants_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::AntsUnavailable(msg.into())
    }

    pub fn execution<C: Into<String>, S: Into<String>>(code: C, msg: S) -> Self {
        Self::Execution {
            code: code.into(),
            message: msg.into(),
        }
    }

    pub fn not_found<S: Into<String>>(kind: &'static str, id: S) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn message_queue<S: Into<String>>(msg: S) -> Self {
        Self::MessageQueue(msg.into())
    }

    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// 结构化错误码
    pub fn error_code(&self) -> &str {
        match self {
            Self::Validation(_) => ERR_VALIDATION,
            Self::QuotaExceeded(_) => ERR_QUOTA_EXCEEDED,
            Self::AntsUnavailable(_) => ERR_ANTS_UNAVAILABLE,
            Self::Execution { code, .. } => code,
            Self::Timeout(_) => ERR_TASK_TIMED_OUT,
            Self::Cancelled(_) => ERR_JOB_CANCELLED,
            _ => ERR_JOB_EXECUTE,
        }
    }

    pub fn is_requeue(&self) -> bool {
        matches!(self, Self::Requeue(_))
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }

    /// 判断错误是否可以按照常规重试策略重试
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_)
            | Self::QuotaExceeded(_)
            | Self::JobExecutionExists(_)
            | Self::Configuration(_)
            | Self::Cancelled(_) => false,
            Self::Execution { code, .. } => !crate::models::error_code::is_terminal_code(code),
            _ => true,
        }
    }
}

impl From<serde_json::Error> for QueenError {
    fn from(err: serde_json::Error) -> Self {
        QueenError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type QueenResult<T> = std::result::Result<T, QueenError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::error_code::{ERR_FATAL, ERR_RESTART_JOB};

    #[test]
    fn test_error_codes() {
        assert_eq!(QueenError::validation("x").error_code(), ERR_VALIDATION);
        assert_eq!(QueenError::quota_exceeded("x").error_code(), ERR_QUOTA_EXCEEDED);
        assert_eq!(QueenError::ants_unavailable("x").error_code(), ERR_ANTS_UNAVAILABLE);
        assert_eq!(QueenError::execution(ERR_FATAL, "boom").error_code(), ERR_FATAL);
        assert_eq!(QueenError::internal("x").error_code(), ERR_JOB_EXECUTE);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(QueenError::requeue("no ants yet").is_requeue());
        assert!(QueenError::ants_unavailable("gone").is_retryable());
        assert!(!QueenError::quota_exceeded("cpu").is_retryable());
        assert!(!QueenError::execution(ERR_FATAL, "fatal").is_retryable());
        assert!(!QueenError::execution(ERR_RESTART_JOB, "restart").is_retryable());
        assert!(QueenError::execution(ERR_JOB_EXECUTE, "generic").is_retryable());
    }
}
