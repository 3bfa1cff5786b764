//! # Queen Dispatcher
//!
//! 作业编排的核心：Ant资源管理、作业与任务状态机、执行监督和作业启动器。
//!
//! 启动器从共享启动主题取得作业，状态机负责所有状态迁移和持久化，
//! 监督者沿任务图把任务请求发送给预留的Ant并等待结果。

pub mod fsm;
pub mod launcher;
pub mod metrics;
pub mod resource;
pub mod supervisor;

pub use fsm::{Collaborators, JobExecutionStateMachine, TaskExecutionStateMachine};
pub use launcher::JobLauncher;
pub use resource::{ResourceManager, ResourceManagerImpl};
pub use supervisor::{CancelReason, ExecutionContext, JobSupervisor, TaskSupervisor};
