//! 作业与任务执行状态机
//!
//! 所有合法的状态迁移以及伴随的持久化、指标和生命周期事件都在这里完成。
//! 任务状态机持有作业状态机的可变引用，在其上下文之上扩展。

mod job_state;
mod params;
mod task_state;

use std::sync::Arc;

use queen_core::config::QueenConfig;
use queen_core::models::PayloadCipher;
use queen_core::traits::{ArtifactManager, ErrorCodeRepository, JobManager, QueueClient, UserManager};

use crate::resource::ResourceManager;

pub use job_state::{HeartbeatProbe, JobExecutionStateMachine};
pub use params::build_dynamic_params;
pub use task_state::TaskExecutionStateMachine;

/// 状态机依赖的外部协作者
#[derive(Clone)]
pub struct Collaborators {
    pub config: Arc<QueenConfig>,
    pub job_manager: Arc<dyn JobManager>,
    pub artifact_manager: Arc<dyn ArtifactManager>,
    pub user_manager: Arc<dyn UserManager>,
    pub error_codes: Arc<dyn ErrorCodeRepository>,
    pub resource_manager: Arc<dyn ResourceManager>,
    pub queue: Arc<dyn QueueClient>,
    pub cipher: Arc<dyn PayloadCipher>,
}

impl Collaborators {
    pub fn server_id(&self) -> &str {
        &self.config.common.id
    }
}
