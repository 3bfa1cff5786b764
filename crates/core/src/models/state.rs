use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{QueenError, QueenResult};

/// 作业请求、作业执行与任务执行共用的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    #[default]
    Pending,
    Ready,
    Started,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Paused,
    /// 以下几个只作为退出码路由的目标出现
    Fatal,
    RestartJob,
    PauseJob,
    RestartTask,
    Reserved,
    Deleted,
    Unknown,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "PENDING",
            RequestState::Ready => "READY",
            RequestState::Started => "STARTED",
            RequestState::Executing => "EXECUTING",
            RequestState::Completed => "COMPLETED",
            RequestState::Failed => "FAILED",
            RequestState::Cancelled => "CANCELLED",
            RequestState::Paused => "PAUSED",
            RequestState::Fatal => "FATAL",
            RequestState::RestartJob => "RESTART_JOB",
            RequestState::PauseJob => "PAUSE_JOB",
            RequestState::RestartTask => "RESTART_TASK",
            RequestState::Reserved => "RESERVED",
            RequestState::Deleted => "DELETED",
            RequestState::Unknown => "UNKNOWN",
        }
    }

    /// 终态：COMPLETED、FAILED、CANCELLED
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }

    pub fn is_completed(&self) -> bool {
        *self == RequestState::Completed
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RequestState::Failed | RequestState::Cancelled)
    }

    pub fn is_paused(&self) -> bool {
        *self == RequestState::Paused
    }

    pub fn is_executing(&self) -> bool {
        *self == RequestState::Executing
    }

    /// 是否可以结束（终态或暂停）
    pub fn can_finalize(&self) -> bool {
        self.is_terminal() || self.is_paused()
    }

    pub fn can_restart(&self) -> bool {
        matches!(
            self,
            RequestState::Failed | RequestState::Cancelled | RequestState::Paused
        )
    }

    pub fn can_cancel(&self) -> bool {
        !self.is_terminal() || self.is_paused()
    }

    /// 合法的状态迁移表
    pub fn can_transition_to(&self, new_state: RequestState) -> bool {
        use RequestState::*;
        match self {
            Failed | Cancelled => new_state == Pending,
            Pending | Paused => matches!(new_state, Ready | Failed),
            Ready => matches!(new_state, Started | Failed | Pending | Paused),
            Started => new_state == Executing,
            Executing => matches!(new_state, Failed | Completed | Paused | Cancelled),
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = QueenError;

    fn from_str(s: &str) -> QueenResult<Self> {
        let state = match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => RequestState::Pending,
            "READY" => RequestState::Ready,
            "STARTED" => RequestState::Started,
            "EXECUTING" => RequestState::Executing,
            "COMPLETED" => RequestState::Completed,
            "FAILED" => RequestState::Failed,
            "CANCELLED" => RequestState::Cancelled,
            "PAUSED" => RequestState::Paused,
            "FATAL" => RequestState::Fatal,
            "RESTART_JOB" => RequestState::RestartJob,
            "PAUSE_JOB" => RequestState::PauseJob,
            "RESTART_TASK" => RequestState::RestartTask,
            "RESERVED" => RequestState::Reserved,
            "DELETED" => RequestState::Deleted,
            "UNKNOWN" => RequestState::Unknown,
            other => {
                return Err(QueenError::validation(format!("未知的状态: {other}")));
            }
        };
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(RequestState::Completed.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(RequestState::Cancelled.is_terminal());
        assert!(!RequestState::Paused.is_terminal());
        assert!(!RequestState::Executing.is_terminal());
        assert!(RequestState::Paused.can_finalize());
    }

    #[test]
    fn test_transition_table() {
        assert!(RequestState::Pending.can_transition_to(RequestState::Ready));
        assert!(RequestState::Paused.can_transition_to(RequestState::Ready));
        assert!(RequestState::Ready.can_transition_to(RequestState::Pending));
        assert!(RequestState::Executing.can_transition_to(RequestState::Completed));
        assert!(RequestState::Failed.can_transition_to(RequestState::Pending));
        // 终态的作业执行不能回到非终态
        assert!(!RequestState::Completed.can_transition_to(RequestState::Ready));
        assert!(!RequestState::Failed.can_transition_to(RequestState::Executing));
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!(
            "restart_job".parse::<RequestState>().unwrap(),
            RequestState::RestartJob
        );
        assert!("nope".parse::<RequestState>().is_err());
        let json = serde_json::to_string(&RequestState::PauseJob).unwrap();
        assert_eq!(json, "\"PAUSE_JOB\"");
    }
}
