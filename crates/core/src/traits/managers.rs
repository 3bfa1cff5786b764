//! 外部协作者接口：作业、工件、用户的持久化以及错误码仓库

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Artifact, ErrorCode, JobDefinition, JobExecution, JobRequest, Organization, ResourceUsage,
    TaskExecution, User,
};
use crate::QueenResult;

/// 并发统计的范围
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConcurrencyScope {
    JobType(String),
    User(String),
    Organization(String),
}

#[async_trait]
pub trait JobManager: Send + Sync {
    /// 版本为空时返回最新版本
    async fn get_job_definition(&self, job_type: &str, version: &str) -> QueenResult<JobDefinition>;

    async fn get_job_request(&self, id: u64) -> QueenResult<JobRequest>;

    async fn save_job_request(&self, request: &JobRequest) -> QueenResult<()>;

    /// 刷新作业请求的更新时间，避免被当作孤儿作业
    async fn update_job_request_timestamp(&self, id: u64) -> QueenResult<()>;

    async fn cancel_job_request(&self, id: u64) -> QueenResult<()>;

    /// 统计处于 READY/STARTED/EXECUTING 的作业请求数量
    async fn count_executing_requests(&self, scope: ConcurrencyScope) -> QueenResult<usize>;

    async fn get_job_execution(&self, id: &str) -> QueenResult<JobExecution>;

    async fn save_job_execution(&self, execution: &JobExecution) -> QueenResult<()>;

    async fn delete_job_execution(&self, id: &str) -> QueenResult<()>;

    /// 原子地保存作业请求和作业执行
    async fn finalize_job_request_and_execution(
        &self,
        request: &JobRequest,
        execution: Option<&JobExecution>,
    ) -> QueenResult<()>;

    async fn save_task_execution(&self, task: &TaskExecution) -> QueenResult<()>;

    async fn delete_task_execution(&self, id: &str) -> QueenResult<()>;

    /// 用户从 `since` 开始的资源用量
    async fn get_resource_usage(&self, user_id: &str, since: DateTime<Utc>)
        -> QueenResult<ResourceUsage>;
}

#[async_trait]
pub trait ArtifactManager: Send + Sync {
    async fn get_artifact(&self, id: &str) -> QueenResult<Option<Artifact>>;

    async fn save_artifact(&self, artifact: &Artifact) -> QueenResult<()>;
}

#[async_trait]
pub trait UserManager: Send + Sync {
    async fn get_user(&self, id: &str) -> QueenResult<User>;

    async fn get_organization(&self, id: &str) -> QueenResult<Organization>;
}

#[async_trait]
pub trait ErrorCodeRepository: Send + Sync {
    /// 找到与错误信息和作用域最匹配的错误码
    async fn match_error(
        &self,
        message: &str,
        platform: &str,
        command: &str,
        job_type: &str,
        task_type: &str,
    ) -> QueenResult<Option<ErrorCode>>;
}
