//! Ant资源管理：注册表、预留与释放、过期清理

mod manager;
mod reaper;
mod state;

use async_trait::async_trait;
use std::collections::HashMap;

use queen_core::models::{
    AntRegistration, AntReservation, ContainerLifecycleEvent, JobDefinition, TaskMethod,
};
use queen_core::QueenResult;

pub use manager::ResourceManagerImpl;
pub use reaper::{spawn_allocation_reaper, spawn_ant_reaper};
pub use state::{ReapedAllocation, ResourceState};

/// 资源管理器接口
///
/// 唯一能发放或回收预留的组件。释放操作都是幂等的，
/// 任务完成、作业取消和清理任务可能并发地释放同一份分配。
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// 注册或刷新Ant，返回是否为新Ant
    async fn register(&self, registration: AntRegistration) -> QueenResult<bool>;

    async fn registration(&self, ant_id: &str) -> Option<AntRegistration>;

    async fn registrations(&self) -> Vec<AntRegistration>;

    /// 背压检查：每个任务的执行方式和标签都至少有一个匹配且有空闲容量的Ant
    async fn has_ants_for_job_tags(
        &self,
        requirements: &[(TaskMethod, Vec<String>)],
    ) -> QueenResult<()>;

    async fn reserve(
        &self,
        request_id: u64,
        task_type: &str,
        method: TaskMethod,
        tags: &[String],
        dry_run: bool,
    ) -> QueenResult<AntReservation>;

    /// 为作业的每个任务预留Ant，任一失败时回滚已做的预留
    async fn reserve_job_resources(
        &self,
        request_id: u64,
        definition: &JobDefinition,
    ) -> QueenResult<HashMap<String, AntReservation>> {
        let mut reservations = HashMap::new();
        for task in &definition.tasks {
            match self
                .reserve(request_id, &task.task_type, task.method, &task.tags, false)
                .await
            {
                Ok(reservation) => {
                    reservations.insert(task.task_type.clone(), reservation);
                }
                Err(e) => {
                    if let Err(release_err) = self.release_job(request_id).await {
                        tracing::warn!(request_id, "回滚预留失败: {}", release_err);
                    }
                    return Err(e);
                }
            }
        }
        Ok(reservations)
    }

    /// 不做分配地检查作业的每个任务是否都能找到Ant
    async fn check_job_resources(
        &self,
        request_id: u64,
        definition: &JobDefinition,
    ) -> QueenResult<HashMap<String, AntReservation>> {
        let mut reservations = HashMap::new();
        for task in &definition.tasks {
            let reservation = self
                .reserve(request_id, &task.task_type, task.method, &task.tags, true)
                .await?;
            reservations.insert(task.task_type.clone(), reservation);
        }
        Ok(reservations)
    }

    async fn release(&self, request_id: u64, ant_id: &str, task_type: &str) -> QueenResult<()>;

    async fn release_job(&self, request_id: u64) -> QueenResult<()>;

    async fn container_events(&self, request_id: u64) -> Vec<ContainerLifecycleEvent>;
}
