//! 协作者接口的内存实现，用于嵌入式部署和测试

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queen_core::models::{
    Artifact, ErrorCode, JobDefinition, JobExecution, JobRequest, Organization, RequestState,
    ResourceUsage, TaskExecution, User,
};
use queen_core::traits::{
    ArtifactManager, ConcurrencyScope, ErrorCodeRepository, JobManager, UserManager,
};
use queen_core::{QueenError, QueenResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct JobTables {
    definitions: Vec<JobDefinition>,
    requests: HashMap<u64, JobRequest>,
    executions: HashMap<String, JobExecution>,
    tasks: HashMap<String, TaskExecution>,
    usage: HashMap<String, ResourceUsage>,
}

/// 作业请求、作业执行和任务执行的内存存储
#[derive(Clone, Default)]
pub struct InMemoryJobManager {
    tables: Arc<RwLock<JobTables>>,
}

impl InMemoryJobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 校验后保存作业模板
    pub async fn add_job_definition(&self, mut definition: JobDefinition) -> QueenResult<JobDefinition> {
        definition.validate()?;
        let mut tables = self.tables.write().await;
        tables
            .definitions
            .retain(|d| !(d.job_type == definition.job_type && d.version == definition.version));
        tables.definitions.push(definition.clone());
        Ok(definition)
    }

    pub async fn add_job_request(&self, request: JobRequest) {
        self.tables.write().await.requests.insert(request.id, request);
    }

    pub async fn set_resource_usage(&self, user_id: &str, usage: ResourceUsage) {
        self.tables
            .write()
            .await
            .usage
            .insert(user_id.to_string(), usage);
    }

    pub async fn job_executions(&self) -> Vec<JobExecution> {
        self.tables.read().await.executions.values().cloned().collect()
    }

    pub async fn task_executions(&self) -> Vec<TaskExecution> {
        self.tables.read().await.tasks.values().cloned().collect()
    }
}

#[async_trait]
impl JobManager for InMemoryJobManager {
    async fn get_job_definition(&self, job_type: &str, version: &str) -> QueenResult<JobDefinition> {
        let tables = self.tables.read().await;
        tables
            .definitions
            .iter()
            .rev()
            .find(|d| d.job_type == job_type && (version.is_empty() || d.version == version))
            .cloned()
            .ok_or_else(|| QueenError::not_found("作业模板", format!("{job_type}:{version}")))
    }

    async fn get_job_request(&self, id: u64) -> QueenResult<JobRequest> {
        self.tables
            .read()
            .await
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| QueenError::not_found("作业请求", id.to_string()))
    }

    async fn save_job_request(&self, request: &JobRequest) -> QueenResult<()> {
        let mut request = request.clone();
        request.updated_at = Utc::now();
        self.tables.write().await.requests.insert(request.id, request);
        Ok(())
    }

    async fn update_job_request_timestamp(&self, id: u64) -> QueenResult<()> {
        let mut tables = self.tables.write().await;
        let request = tables
            .requests
            .get_mut(&id)
            .ok_or_else(|| QueenError::not_found("作业请求", id.to_string()))?;
        request.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_job_request(&self, id: u64) -> QueenResult<()> {
        let mut tables = self.tables.write().await;
        let request = tables
            .requests
            .get_mut(&id)
            .ok_or_else(|| QueenError::not_found("作业请求", id.to_string()))?;
        if request.job_state.is_terminal() {
            return Ok(());
        }
        request.job_state = RequestState::Cancelled;
        request.updated_at = Utc::now();
        debug!(request_id = id, "作业请求已取消");
        Ok(())
    }

    async fn count_executing_requests(&self, scope: ConcurrencyScope) -> QueenResult<usize> {
        let tables = self.tables.read().await;
        let count = tables
            .requests
            .values()
            .filter(|r| {
                matches!(
                    r.job_state,
                    RequestState::Ready | RequestState::Started | RequestState::Executing
                )
            })
            .filter(|r| match &scope {
                ConcurrencyScope::JobType(job_type) => &r.job_type == job_type,
                ConcurrencyScope::User(user_id) => &r.user_id == user_id,
                ConcurrencyScope::Organization(org_id) => &r.organization_id == org_id,
            })
            .count();
        Ok(count)
    }

    async fn get_job_execution(&self, id: &str) -> QueenResult<JobExecution> {
        self.tables
            .read()
            .await
            .executions
            .get(id)
            .cloned()
            .ok_or_else(|| QueenError::not_found("作业执行", id))
    }

    async fn save_job_execution(&self, execution: &JobExecution) -> QueenResult<()> {
        let mut execution = execution.clone();
        execution.updated_at = Utc::now();
        self.tables
            .write()
            .await
            .executions
            .insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn delete_job_execution(&self, id: &str) -> QueenResult<()> {
        let mut tables = self.tables.write().await;
        tables.executions.remove(id);
        tables.tasks.retain(|_, t| t.job_execution_id != id);
        Ok(())
    }

    async fn finalize_job_request_and_execution(
        &self,
        request: &JobRequest,
        execution: Option<&JobExecution>,
    ) -> QueenResult<()> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        let mut request = request.clone();
        request.updated_at = now;
        tables.requests.insert(request.id, request);
        if let Some(execution) = execution {
            let mut execution = execution.clone();
            execution.updated_at = now;
            for task in &execution.tasks {
                tables.tasks.insert(task.id.clone(), task.clone());
            }
            tables.executions.insert(execution.id.clone(), execution);
        }
        Ok(())
    }

    async fn save_task_execution(&self, task: &TaskExecution) -> QueenResult<()> {
        let mut task = task.clone();
        task.updated_at = Utc::now();
        self.tables.write().await.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn delete_task_execution(&self, id: &str) -> QueenResult<()> {
        self.tables.write().await.tasks.remove(id);
        Ok(())
    }

    async fn get_resource_usage(
        &self,
        user_id: &str,
        _since: DateTime<Utc>,
    ) -> QueenResult<ResourceUsage> {
        Ok(self
            .tables
            .read()
            .await
            .usage
            .get(user_id)
            .copied()
            .unwrap_or_default())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryArtifactManager {
    artifacts: Arc<RwLock<HashMap<String, Artifact>>>,
}

impl InMemoryArtifactManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.artifacts.read().await.len()
    }
}

#[async_trait]
impl ArtifactManager for InMemoryArtifactManager {
    async fn get_artifact(&self, id: &str) -> QueenResult<Option<Artifact>> {
        Ok(self.artifacts.read().await.get(id).cloned())
    }

    async fn save_artifact(&self, artifact: &Artifact) -> QueenResult<()> {
        if artifact.id.is_empty() {
            return Err(QueenError::validation("工件ID不能为空"));
        }
        self.artifacts
            .write()
            .await
            .insert(artifact.id.clone(), artifact.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryUserManager {
    users: Arc<RwLock<HashMap<String, User>>>,
    organizations: Arc<RwLock<HashMap<String, Organization>>>,
}

impl InMemoryUserManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user: User) {
        self.users.write().await.insert(user.id.clone(), user);
    }

    pub async fn add_organization(&self, organization: Organization) {
        self.organizations
            .write()
            .await
            .insert(organization.id.clone(), organization);
    }
}

#[async_trait]
impl UserManager for InMemoryUserManager {
    async fn get_user(&self, id: &str) -> QueenResult<User> {
        self.users
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| QueenError::not_found("用户", id))
    }

    async fn get_organization(&self, id: &str) -> QueenResult<Organization> {
        self.organizations
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| QueenError::not_found("组织", id))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryErrorCodeRepository {
    codes: Arc<RwLock<Vec<ErrorCode>>>,
}

impl InMemoryErrorCodeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, code: ErrorCode) {
        self.codes.write().await.push(code);
    }
}

#[async_trait]
impl ErrorCodeRepository for InMemoryErrorCodeRepository {
    async fn match_error(
        &self,
        message: &str,
        platform: &str,
        command: &str,
        job_type: &str,
        task_type: &str,
    ) -> QueenResult<Option<ErrorCode>> {
        let codes = self.codes.read().await;
        Ok(codes
            .iter()
            .filter(|c| c.matches(message, platform, command, job_type, task_type))
            .max_by_key(|c| c.specificity())
            .cloned())
    }
}
