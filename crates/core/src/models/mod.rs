//! # 数据模型
//!
//! 编排引擎的核心数据结构：作业模板、作业请求与执行记录、Ant注册与预留、
//! 生命周期事件以及发往Ant的任务消息。
//!
//! ## 状态流转
//!
//! ```text
//! PENDING/PAUSED → READY → STARTED → EXECUTING → COMPLETED
//!                                          ↓
//!                               FAILED / CANCELLED / PAUSED
//! ```
//!
//! 作业执行记录进入终态后不会再回到非终态，只有作业请求可以回到 PENDING 或 PAUSED。
//!
//! ## 序列化
//!
//! 所有模型都实现 `serde`，队列上统一使用 JSON 编码，状态与执行方式使用
//! `SCREAMING_SNAKE_CASE` 文本。

pub mod ant;
pub mod error_code;
pub mod events;
pub mod job_definition;
pub mod job_execution;
pub mod state;
pub mod task_message;
pub mod template;
pub mod user;

pub use ant::*;
pub use error_code::*;
pub use events::*;
pub use job_definition::*;
pub use job_execution::*;
pub use state::*;
pub use task_message::*;
pub use template::*;
pub use user::*;
