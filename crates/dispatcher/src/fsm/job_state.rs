use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use queen_core::models::{
    AntReservation, ErrorCode, ErrorCodeAction, JobDefinition, JobExecution,
    JobExecutionLaunchEvent, JobExecutionLifecycleEvent, JobRequest, Organization, QueueEvent,
    RequestState, TaskDefinition, User, ERR_PAUSE_JOB, ERR_RESTART_JOB,
};
use queen_core::traits::{ConcurrencyScope, JobManager, QueueMessage};
use queen_core::{QueenError, QueenResult};

use super::params::build_dynamic_params;
use super::Collaborators;
use crate::metrics::{
    incr_job_counter, record_job_completed_secs, JOB_CANCELLED_TOTAL, JOB_COMPLETED_TOTAL,
    JOB_FAILED_TOTAL, JOB_PAUSED_TOTAL, JOB_RESTARTED_TOTAL, JOB_REVERTED_TO_PENDING_TOTAL,
};

/// 一个作业请求及其作业执行的状态机
pub struct JobExecutionStateMachine {
    pub(crate) deps: Collaborators,
    pub request: JobRequest,
    definition: Option<JobDefinition>,
    user: Option<User>,
    organization: Option<Organization>,
    pub execution: Option<JobExecution>,
    /// 任务类型 -> 预留
    pub reservations: HashMap<String, AntReservation>,
    /// 上一次作业执行，用于复用已完成任务的结果
    pub last_execution: Option<JobExecution>,
    /// 最近一次任务失败匹配到的错误码
    pub last_error_code: Option<ErrorCode>,
}

impl JobExecutionStateMachine {
    pub fn new(deps: Collaborators, request: JobRequest) -> Self {
        Self {
            deps,
            request,
            definition: None,
            user: None,
            organization: None,
            execution: None,
            reservations: HashMap::new(),
            last_execution: None,
            last_error_code: None,
        }
    }

    /// 加载作业模板、用户和组织，必须在任何状态迁移之前调用
    pub async fn validate(&mut self) -> QueenResult<()> {
        if self.request.id == 0 {
            return Err(QueenError::validation("作业请求缺少ID"));
        }
        let mut definition = self
            .deps
            .job_manager
            .get_job_definition(&self.request.job_type, &self.request.job_version)
            .await
            .map_err(|e| QueenError::validation(format!("加载作业模板失败: {e}")))?;
        definition.validate()?;

        if !self.request.user_id.is_empty() {
            let user = self
                .deps
                .user_manager
                .get_user(&self.request.user_id)
                .await
                .map_err(|e| QueenError::validation(format!("加载用户失败: {e}")))?;
            self.user = Some(user);
        }
        if !self.request.organization_id.is_empty() {
            match self
                .deps
                .user_manager
                .get_organization(&self.request.organization_id)
                .await
            {
                Ok(organization) => self.organization = Some(organization),
                Err(e) => debug!(request_id = self.request.id, "加载组织失败: {}", e),
            }
        }
        if !self.request.last_job_execution_id.is_empty() {
            self.last_execution = self
                .deps
                .job_manager
                .get_job_execution(&self.request.last_job_execution_id)
                .await
                .ok();
        }
        self.definition = Some(definition);
        Ok(())
    }

    pub fn definition(&self) -> QueenResult<&JobDefinition> {
        self.definition
            .as_ref()
            .ok_or_else(|| QueenError::invalid_state(format!("作业请求 {} 尚未校验", self.request.id)))
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn execution_mut(&mut self) -> QueenResult<&mut JobExecution> {
        let request_id = self.request.id;
        self.execution
            .as_mut()
            .ok_or_else(|| QueenError::invalid_state(format!("作业请求 {request_id} 没有作业执行")))
    }

    /// 删除任务的执行记录，下次执行时重新派发
    pub async fn forget_task(&mut self, task_type: &str) -> QueenResult<()> {
        let job_manager = Arc::clone(&self.deps.job_manager);
        let execution = self.execution_mut()?;
        if let Some(task) = execution.get_task(task_type).cloned() {
            execution.delete_task(&task.id);
            job_manager.delete_task_execution(&task.id).await?;
            debug!(task_type, task_id = %task.id, "删除任务执行，准备重跑");
        }
        Ok(())
    }

    pub fn build_dynamic_params(&self, task: Option<&TaskDefinition>) -> QueenResult<HashMap<String, Value>> {
        Ok(build_dynamic_params(
            self.organization.as_ref(),
            self.definition()?,
            &self.request,
            self.execution.as_ref(),
            task,
        ))
    }

    /// 过滤条件渲染为 "true" 时不应调度该作业
    pub fn should_skip(&self) -> QueenResult<bool> {
        let params = self.build_dynamic_params(None)?;
        Ok(self.definition()?.filtered(&params))
    }

    /// 作业、用户、组织的并发上限以及Ant容量检查，不满足时需要重新排队
    pub async fn check_ant_resources_and_concurrency_for_job(&self) -> QueenResult<()> {
        let definition = self.definition()?;
        let job_manager = &self.deps.job_manager;

        let running = job_manager
            .count_executing_requests(ConcurrencyScope::JobType(self.request.job_type.clone()))
            .await?;
        if running >= definition.max_concurrency {
            return Err(QueenError::requeue(format!(
                "作业 {} 已有 {} 个在运行，达到并发上限 {}",
                self.request.job_type, running, definition.max_concurrency
            )));
        }
        if let Some(user) = self.user.as_ref().filter(|u| u.max_concurrency > 0) {
            let running = job_manager
                .count_executing_requests(ConcurrencyScope::User(user.id.clone()))
                .await?;
            if running >= user.max_concurrency {
                return Err(QueenError::requeue(format!(
                    "用户 {} 已有 {} 个作业在运行，达到并发上限 {}",
                    user.id, running, user.max_concurrency
                )));
            }
        }
        if let Some(organization) = self.organization.as_ref().filter(|o| o.max_concurrency > 0) {
            let running = job_manager
                .count_executing_requests(ConcurrencyScope::Organization(organization.id.clone()))
                .await?;
            if running >= organization.max_concurrency {
                return Err(QueenError::requeue(format!(
                    "组织 {} 已有 {} 个作业在运行，达到并发上限 {}",
                    organization.id, running, organization.max_concurrency
                )));
            }
        }
        self.deps
            .resource_manager
            .has_ants_for_job_tags(&definition.task_requirements())
            .await
            .map_err(|e| QueenError::requeue(e.to_string()))
    }

    pub async fn check_subscription_quota(&self) -> QueenResult<()> {
        if !self.deps.config.common.subscription_quota_enabled {
            return Ok(());
        }
        match &self.user {
            Some(user) => check_quota(self.deps.job_manager.as_ref(), user).await,
            None => Ok(()),
        }
    }

    fn transition(&mut self, to: RequestState) -> QueenResult<()> {
        if !self.request.job_state.can_transition_to(to) {
            return Err(QueenError::invalid_state(format!(
                "作业请求 {} 不能从 {} 迁移到 {}",
                self.request.id, self.request.job_state, to
            )));
        }
        self.request.job_state = to;
        Ok(())
    }

    fn set_request_error(&mut self, code: &str, message: &str) {
        self.request.error_code = code.to_string();
        self.request.error_message = message.to_string();
    }

    /// 调度失败：PENDING -> FAILED，不发布事件
    pub async fn schedule_failed(&mut self, code: &str, message: &str) -> QueenResult<()> {
        self.transition(RequestState::Failed)?;
        self.set_request_error(code, message);
        self.deps.job_manager.save_job_request(&self.request).await?;
        warn!(request_id = self.request.id, code, "作业调度失败: {}", message);
        Ok(())
    }

    pub async fn reserve_job_resources(&mut self) -> QueenResult<HashMap<String, AntReservation>> {
        let reservations = self
            .deps
            .resource_manager
            .reserve_job_resources(self.request.id, self.definition()?)
            .await?;
        self.reservations = reservations.clone();
        Ok(reservations)
    }

    pub async fn check_job_resources(&self) -> QueenResult<HashMap<String, AntReservation>> {
        self.deps
            .resource_manager
            .check_job_resources(self.request.id, self.definition()?)
            .await
    }

    /// PENDING/PAUSED -> READY，并发送启动事件
    ///
    /// 请求引用的上一次作业执行未结束时复用它，否则新建。
    pub async fn create_job_execution(&mut self) -> QueenResult<JobExecution> {
        if let Some(existing) = &self.execution {
            return Err(QueenError::JobExecutionExists(format!(
                "作业请求 {} 已有作业执行 {}",
                self.request.id, existing.id
            )));
        }
        if !self.request.job_state.can_transition_to(RequestState::Ready) {
            return Err(QueenError::invalid_state(format!(
                "作业请求 {} 处于 {}，不能创建作业执行",
                self.request.id, self.request.job_state
            )));
        }

        let reusable = if self.request.job_execution_id.is_empty() {
            None
        } else {
            self.deps
                .job_manager
                .get_job_execution(&self.request.job_execution_id)
                .await
                .ok()
                .filter(|e| !e.job_state.is_terminal())
        };
        let execution = match reusable {
            Some(mut execution) => {
                debug!(request_id = self.request.id, execution_id = %execution.id, "复用未结束的作业执行");
                execution.job_state = RequestState::Ready;
                execution.error_code.clear();
                execution.error_message.clear();
                execution.ended_at = None;
                execution
            }
            None => JobExecution::new(&self.request),
        };
        self.deps.job_manager.save_job_execution(&execution).await?;

        self.transition(RequestState::Ready)?;
        self.request.job_execution_id = execution.id.clone();
        self.request.scheduled_at = Utc::now();
        self.request.schedule_attempts += 1;
        self.request.error_code.clear();
        self.request.error_message.clear();
        self.deps.job_manager.save_job_request(&self.request).await?;
        self.execution = Some(execution.clone());

        let event = JobExecutionLaunchEvent::new(
            self.deps.server_id(),
            &self.request,
            &execution.id,
            self.reservations.clone(),
        );
        let sent = match event.encode() {
            Ok(payload) => {
                self.deps
                    .queue
                    .send(&self.deps.config.topics.job_launch, QueueMessage::new(payload))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(request_id = self.request.id, "发送启动事件失败: {}", e);
            self.launch_failed(&e).await?;
            return Err(e);
        }
        info!(
            request_id = self.request.id,
            job_type = %self.request.job_type,
            execution_id = %execution.id,
            "作业执行已创建"
        );
        Ok(execution)
    }

    /// 启动前检查预留是否齐全，并加载作业执行
    pub async fn prepare_launch(
        &mut self,
        execution_id: &str,
        reservations: HashMap<String, AntReservation>,
    ) -> QueenResult<()> {
        let definition = self.definition()?;
        if let Some(missing) = definition
            .tasks
            .iter()
            .find(|t| !reservations.contains_key(&t.task_type))
        {
            return Err(QueenError::requeue(format!(
                "任务 {} 没有预留（预留 {} 个，任务 {} 个）",
                missing.task_type,
                reservations.len(),
                definition.tasks.len()
            )));
        }
        for reservation in reservations.values() {
            reservation.validate()?;
        }

        let execution = self.deps.job_manager.get_job_execution(execution_id).await?;
        if execution.job_request_id != self.request.id {
            return Err(QueenError::validation(format!(
                "作业执行 {} 不属于作业请求 {}",
                execution_id, self.request.id
            )));
        }
        if self.request.job_state != RequestState::Ready {
            return Err(QueenError::invalid_state(format!(
                "作业请求 {} 处于 {}，不是READY",
                self.request.id, self.request.job_state
            )));
        }
        if execution.job_state != RequestState::Ready {
            return Err(QueenError::invalid_state(format!(
                "作业执行 {} 处于 {}，不是READY",
                execution.id, execution.job_state
            )));
        }
        self.reservations = reservations;
        self.execution = Some(execution);
        Ok(())
    }

    /// READY -> STARTED -> EXECUTING
    pub async fn set_job_status_to_executing(&mut self) -> QueenResult<()> {
        self.transition(RequestState::Started)?;
        self.transition(RequestState::Executing)?;
        let now = Utc::now();
        let execution = self.execution_mut()?;
        execution.job_state = RequestState::Executing;
        execution.started_at = now;
        self.finalize().await?;
        self.publish_lifecycle_event().await;
        info!(request_id = self.request.id, job_type = %self.request.job_type, "作业开始执行");
        Ok(())
    }

    pub async fn execution_completed(&mut self) -> QueenResult<()> {
        self.transition(RequestState::Completed)?;
        self.set_request_error("", "");
        let execution = self.execution_mut()?;
        execution.job_state = RequestState::Completed;
        execution.ended_at = Some(Utc::now());
        let elapsed = execution.elapsed_secs();
        self.finalize().await?;
        incr_job_counter(JOB_COMPLETED_TOTAL, &self.request.job_type);
        record_job_completed_secs(&self.request.job_type, elapsed as f64);
        self.publish_lifecycle_event().await;
        info!(request_id = self.request.id, elapsed_secs = elapsed, "作业执行完成");
        Ok(())
    }

    pub async fn execution_failed(&mut self, code: &str, message: &str) -> QueenResult<()> {
        self.transition(RequestState::Failed)?;
        self.end_execution(RequestState::Failed, code, message)?;
        self.finalize().await?;
        incr_job_counter(JOB_FAILED_TOTAL, &self.request.job_type);
        self.publish_lifecycle_event().await;
        warn!(request_id = self.request.id, code, "作业执行失败: {}", message);
        Ok(())
    }

    pub async fn execution_cancelled(&mut self, code: &str, message: &str) -> QueenResult<()> {
        self.transition(RequestState::Cancelled)?;
        self.end_execution(RequestState::Cancelled, code, message)?;
        self.finalize().await?;
        incr_job_counter(JOB_CANCELLED_TOTAL, &self.request.job_type);
        self.publish_lifecycle_event().await;
        info!(request_id = self.request.id, code, "作业执行已取消: {}", message);
        Ok(())
    }

    /// 请求和执行都置为PAUSED，执行记录保留以便恢复
    pub async fn pause_job(&mut self, message: &str) -> QueenResult<()> {
        self.force_release().await;
        self.transition(RequestState::Paused)?;
        self.set_request_error(ERR_PAUSE_JOB, message);
        if let Some(execution) = self.execution.as_mut() {
            execution.job_state = RequestState::Paused;
            execution.error_code = ERR_PAUSE_JOB.to_string();
            execution.error_message = message.to_string();
        }
        self.finalize().await?;
        incr_job_counter(JOB_PAUSED_TOTAL, &self.request.job_type);
        self.publish_lifecycle_event().await;
        info!(request_id = self.request.id, "作业已暂停: {}", message);
        Ok(())
    }

    /// 启动失败，请求无论处于READY还是STARTED都直接置为FAILED
    pub async fn launch_failed(&mut self, err: &QueenError) -> QueenResult<()> {
        self.force_release().await;
        let message = err.to_string();
        self.request.job_state = RequestState::Failed;
        self.set_request_error(err.error_code(), &message);
        if self.execution.is_some() {
            self.end_execution(RequestState::Failed, err.error_code(), &message)?;
        }
        self.finalize().await?;
        incr_job_counter(JOB_FAILED_TOTAL, &self.request.job_type);
        self.publish_lifecycle_event().await;
        warn!(request_id = self.request.id, "作业启动失败: {}", message);
        Ok(())
    }

    /// 暂时无法启动：释放资源、删除执行记录，请求退回PENDING
    pub async fn revert_request_to_pending(&mut self, reason: &str) -> QueenResult<()> {
        self.force_release().await;
        if self.request.job_state != RequestState::Pending {
            self.transition(RequestState::Pending)?;
        }
        if !self.request.job_execution_id.is_empty() {
            self.deps
                .job_manager
                .delete_job_execution(&self.request.job_execution_id)
                .await?;
            self.request.job_execution_id.clear();
        }
        self.execution = None;
        self.request.error_message = reason.to_string();
        self.deps.job_manager.save_job_request(&self.request).await?;
        incr_job_counter(JOB_REVERTED_TO_PENDING_TOTAL, &self.request.job_type);
        info!(request_id = self.request.id, "作业请求已退回PENDING: {}", reason);
        Ok(())
    }

    /// 收到重启信号：执行以ERR_RESTART_JOB结束，请求退回PENDING并记住这次执行
    pub async fn restart_job_back_to_pending(&mut self, message: &str) -> QueenResult<()> {
        self.force_release().await;
        if self.execution.is_some() {
            self.end_execution(RequestState::Failed, ERR_RESTART_JOB, message)?;
        }
        if let Some(execution) = &self.execution {
            self.request.last_job_execution_id = execution.id.clone();
        }
        self.request.job_state = RequestState::Pending;
        self.request.job_execution_id.clear();
        self.set_request_error(ERR_RESTART_JOB, message);
        self.finalize().await?;
        incr_job_counter(JOB_RESTARTED_TOTAL, &self.request.job_type);
        self.publish_lifecycle_event().await;
        info!(request_id = self.request.id, "作业将重新排队执行: {}", message);
        Ok(())
    }

    fn end_execution(&mut self, state: RequestState, code: &str, message: &str) -> QueenResult<()> {
        self.set_request_error(code, message);
        let execution = self.execution_mut()?;
        execution.job_state = state;
        execution.error_code = code.to_string();
        execution.error_message = message.to_string();
        execution.ended_at = Some(Utc::now());
        Ok(())
    }

    /// 作业级重试：模板重试次数，或RETRY_JOB错误码给出的次数
    pub fn can_retry(&self) -> bool {
        let retry = self.definition.as_ref().map(|d| d.retry).unwrap_or(0);
        if self.request.retried < retry + 1 {
            return true;
        }
        matches!(
            &self.last_error_code,
            Some(code) if code.action == ErrorCodeAction::RetryJob && self.request.retried < code.retry + 1
        )
    }

    /// 每重试 `hard_reset_after_retries + 1` 次做一次不复用结果的完整重启
    pub fn does_require_full_restart(&self) -> bool {
        let Some(definition) = &self.definition else {
            return false;
        };
        let hard_reset = definition.hard_reset_after_retries;
        hard_reset > 0 && self.request.retried > 0 && self.request.retried % (hard_reset + 1) == 0
    }

    pub fn heartbeat_probe(&self) -> HeartbeatProbe {
        HeartbeatProbe {
            job_manager: Arc::clone(&self.deps.job_manager),
            request_id: self.request.id,
            user: self.user.clone(),
            quota_enabled: self.deps.config.common.subscription_quota_enabled,
        }
    }

    /// 释放作业持有的全部预留，错误只记录
    pub async fn force_release(&mut self) {
        if let Err(e) = self.deps.resource_manager.release_job(self.request.id).await {
            warn!(request_id = self.request.id, "释放作业资源失败: {}", e);
        }
        self.reservations.clear();
    }

    async fn finalize(&self) -> QueenResult<()> {
        self.deps
            .job_manager
            .finalize_job_request_and_execution(&self.request, self.execution.as_ref())
            .await
    }

    /// 发布作业生命周期事件，失败只记录，状态已经提交
    pub async fn publish_lifecycle_event(&self) {
        let event = JobExecutionLifecycleEvent::new(
            self.deps.server_id(),
            &self.request,
            self.execution.as_ref(),
        );
        let result = match event.encode() {
            Ok(payload) => {
                self.deps
                    .queue
                    .publish(&self.deps.config.topics.job_lifecycle, QueueMessage::new(payload))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(
                request_id = self.request.id,
                state = %self.request.job_state,
                "发布作业生命周期事件失败: {}",
                e
            );
        }
    }
}

/// 订阅配额检查：没有订阅、订阅过期或CPU/磁盘用量超限都视为超额
pub(crate) async fn check_quota(job_manager: &dyn JobManager, user: &User) -> QueenResult<()> {
    let subscription = user
        .subscription
        .as_ref()
        .ok_or_else(|| QueenError::quota_exceeded(format!("用户 {} 没有订阅", user.id)))?;
    if subscription.expired() {
        return Err(QueenError::quota_exceeded(format!(
            "用户 {} 的订阅已于 {} 过期",
            user.id, subscription.ended_at
        )));
    }
    let usage = job_manager
        .get_resource_usage(&user.id, subscription.started_at)
        .await?;
    if subscription.cpu_quota_secs > 0 && usage.cpu_secs >= subscription.cpu_quota_secs {
        return Err(QueenError::quota_exceeded(format!(
            "用户 {} 的CPU用量 {}s 已达到配额 {}s",
            user.id, usage.cpu_secs, subscription.cpu_quota_secs
        )));
    }
    if subscription.disk_quota_mb > 0 && usage.disk_mb >= subscription.disk_quota_mb {
        return Err(QueenError::quota_exceeded(format!(
            "用户 {} 的磁盘用量 {}MB 已达到配额 {}MB",
            user.id, usage.disk_mb, subscription.disk_quota_mb
        )));
    }
    Ok(())
}

/// 作业运行期间的心跳：刷新请求时间戳并复查配额
pub struct HeartbeatProbe {
    job_manager: Arc<dyn JobManager>,
    request_id: u64,
    user: Option<User>,
    quota_enabled: bool,
}

impl HeartbeatProbe {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub async fn tick(&self) -> QueenResult<()> {
        self.job_manager
            .update_job_request_timestamp(self.request_id)
            .await?;
        match (&self.user, self.quota_enabled) {
            (Some(user), true) => check_quota(self.job_manager.as_ref(), user).await,
            _ => Ok(()),
        }
    }

    /// 配额超限时通过作业管理器取消请求
    pub async fn cancel_request(&self) -> QueenResult<()> {
        self.job_manager.cancel_job_request(self.request_id).await
    }
}
