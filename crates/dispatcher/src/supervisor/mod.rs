//! 作业与任务的执行监督
//!
//! `JobSupervisor` 沿任务图逐个执行任务并处理作业级重试、取消、暂停和超时；
//! `TaskSupervisor` 负责单个任务与Ant之间的请求应答和任务级重试。

mod context;
mod job_supervisor;
mod task_supervisor;

pub use context::{CancelReason, ExecutionContext};
pub use job_supervisor::JobSupervisor;
pub use task_supervisor::TaskSupervisor;
