use chrono::Utc;
use rand::distr::{Alphanumeric, SampleString};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use queen_core::models::{
    AntReservation, Artifact, ErrorCode, ErrorCodeAction, ExecutorOptions, QueueEvent,
    RequestState, TaskAction, TaskDefinition, TaskExecution, TaskExecutionLifecycleEvent,
    TaskMethod, TaskRequest, TaskResponse, ERR_ANTS_UNAVAILABLE, ERR_TASK_EXECUTE,
    LABEL_ORG_ID, LABEL_REQUEST_ID, LABEL_SERVER, LABEL_USER_ID,
};
use queen_core::traits::QueueMessage;
use queen_core::{QueenError, QueenResult};

use super::job_state::JobExecutionStateMachine;
use crate::metrics::{incr_job_counter, TASK_COMPLETED_TOTAL, TASK_FAILED_TOTAL};

pub const CONTEXT_ANT_ID: &str = "AntID";
pub const CONTEXT_ANT_TOPIC: &str = "AntTopic";
pub const CONTEXT_REUSED_RESULT: &str = "ReusedPreviousResultFromTaskExecution";

const ARTIFACTS_ROOT: &str = "/tmp/queen-artifacts";
const CACHE_ROOT: &str = "/tmp/queen-cache";

/// 转换成 DNS-1123 标签：小写字母、数字和连字符，最长63个字符
fn to_dns_label(name: &str) -> String {
    let mapped: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(63)
        .collect();
    mapped.trim_matches('-').to_string()
}

/// 作业执行中单个任务的状态机
pub struct TaskExecutionStateMachine<'a> {
    pub job: &'a mut JobExecutionStateMachine,
    /// 用动态参数渲染后的任务模板
    pub definition: TaskDefinition,
    pub task_execution: TaskExecution,
    pub reservation: Option<AntReservation>,
    previous: Option<TaskExecution>,
    matched_error_code: Option<ErrorCode>,
    already_completed: bool,
}

impl<'a> TaskExecutionStateMachine<'a> {
    /// 已完成的任务原样返回；未完成的旧记录先删除再新建
    pub async fn new(job: &'a mut JobExecutionStateMachine, task_type: &str) -> QueenResult<Self> {
        let template = job
            .definition()?
            .get_task(task_type)
            .cloned()
            .ok_or_else(|| {
                QueenError::validation(format!("作业 {} 没有任务 {}", job.request.job_type, task_type))
            })?;
        let params = job.build_dynamic_params(Some(&template))?;
        let definition = template.resolve(&params);
        let job_manager = std::sync::Arc::clone(&job.deps.job_manager);
        let previous = job
            .last_execution
            .as_ref()
            .and_then(|e| e.get_task(task_type))
            .cloned();

        let execution = job.execution_mut()?;
        let existing = execution.get_task(task_type).cloned();
        let (task_execution, already_completed) = match existing {
            Some(existing) if existing.task_state.is_completed() => (existing, true),
            stale => {
                if let Some(stale) = stale {
                    execution.delete_task(&stale.id);
                    job_manager.delete_task_execution(&stale.id).await?;
                    debug!(task_type, stale_id = %stale.id, "删除未完成的旧任务执行");
                }
                let order = execution.tasks.len();
                let task_execution = TaskExecution::new(&execution.id, &definition, order);
                execution.upsert_task(task_execution.clone());
                job_manager.save_task_execution(&task_execution).await?;
                (task_execution, false)
            }
        };

        let reservation = job.reservations.get(task_type).cloned();
        Ok(Self {
            job,
            definition,
            task_execution,
            reservation,
            previous,
            matched_error_code: None,
            already_completed,
        })
    }

    /// 之前已经完成的任务，不需要再执行
    pub fn is_already_completed(&self) -> bool {
        self.already_completed
    }

    fn request_id(&self) -> u64 {
        self.job.request.id
    }

    /// 确认预留仍然有效，Ant下线或不再支持该任务时重新预留
    pub async fn prepare_execution(&mut self) -> QueenResult<AntReservation> {
        match self.resolve_reservation().await {
            Ok(reservation) => {
                self.task_execution.ant_id = reservation.ant_id.clone();
                self.task_execution
                    .add_context(CONTEXT_ANT_ID, json!(reservation.ant_id));
                self.task_execution
                    .add_context(CONTEXT_ANT_TOPIC, json!(reservation.ant_topic));
                self.job
                    .reservations
                    .insert(self.definition.task_type.clone(), reservation.clone());
                self.reservation = Some(reservation.clone());
                Ok(reservation)
            }
            Err(e) => {
                let message = format!("任务 {} 找不到可用的Ant: {}", self.definition.task_type, e);
                self.set_failed(ERR_ANTS_UNAVAILABLE, &message);
                self.reservation = None;
                Err(QueenError::ants_unavailable(message))
            }
        }
    }

    async fn resolve_reservation(&self) -> QueenResult<AntReservation> {
        let resource_manager = &self.job.deps.resource_manager;
        let alive_timeout = self.job.deps.config.resources.alive_timeout();
        let definition = &self.definition;

        if let Some(reservation) = &self.reservation {
            match resource_manager.registration(&reservation.ant_id).await {
                Some(registration)
                    if registration.supports(definition.method, &definition.tags, alive_timeout) =>
                {
                    return Ok(reservation.clone());
                }
                Some(_) => {
                    info!(
                        request_id = self.request_id(),
                        ant_id = %reservation.ant_id,
                        task_type = %definition.task_type,
                        "Ant不再支持该任务，重新预留"
                    );
                    resource_manager
                        .release(self.request_id(), &reservation.ant_id, &definition.task_type)
                        .await?;
                }
                None => {
                    info!(
                        request_id = self.request_id(),
                        ant_id = %reservation.ant_id,
                        "预留的Ant已下线，重新预留"
                    );
                }
            }
        }
        resource_manager
            .reserve(
                self.request_id(),
                &definition.task_type,
                definition.method,
                &definition.tags,
                false,
            )
            .await
    }

    /// 组装发往Ant的任务请求
    pub fn build_task_request(&self) -> QueenResult<TaskRequest> {
        let job = &*self.job;
        let job_definition = job.definition()?;
        let execution = job
            .execution
            .as_ref()
            .ok_or_else(|| QueenError::invalid_state("任务缺少作业执行"))?;

        let mut dependent_artifacts = Vec::new();
        for dependency in &self.definition.dependencies {
            let task = execution.get_task(dependency).ok_or_else(|| {
                QueenError::validation(format!(
                    "任务 {} 依赖的任务 {} 不在作业执行中",
                    self.definition.task_type, dependency
                ))
            })?;
            dependent_artifacts.extend(task.artifacts.iter().cloned());
        }

        let variables = job.build_dynamic_params(Some(&self.definition))?;
        let mut request = TaskRequest {
            action: TaskAction::Execute,
            job_request_id: job.request.id,
            job_type: job.request.job_type.clone(),
            job_version: job_definition.version.clone(),
            job_execution_id: execution.id.clone(),
            task_execution_id: self.task_execution.id.clone(),
            task_type: self.definition.task_type.clone(),
            method: self.definition.method,
            platform: job_definition.platform.clone(),
            user_id: job.request.user_id.clone(),
            organization_id: job.request.organization_id.clone(),
            job_retry: job.request.retried,
            task_retry: self.task_execution.retried,
            allow_failure: self.definition.allow_failure,
            tags: self.definition.tags.clone(),
            before_script: self.definition.before_script.clone(),
            script: self.definition.script.clone(),
            after_script: self.definition.after_script.clone(),
            variables,
            timeout_secs: self.definition.timeout_secs,
            artifact_ids: self.definition.artifact_ids.clone(),
            dependent_artifacts,
            fork_job_type: self.definition.fork_job_type.clone(),
            fork_job_version: self.definition.job_version.clone(),
            created_at: Utc::now(),
            ..Default::default()
        };

        let suffix = Alphanumeric.sample_string(&mut rand::rng(), 4);
        let name = to_dns_label(&format!(
            "FRM-{}-{}-{}-{}-{}",
            job.request.id,
            self.definition.short_task_type(),
            job.request.retried,
            self.task_execution.retried,
            suffix
        ));
        let mut labels = HashMap::new();
        labels.insert(LABEL_REQUEST_ID.to_string(), job.request.id.to_string());
        labels.insert(LABEL_USER_ID.to_string(), job.request.user_id.clone());
        labels.insert(LABEL_ORG_ID.to_string(), job.request.organization_id.clone());
        labels.insert(LABEL_SERVER.to_string(), job.deps.server_id().to_string());

        let key_path = request.key_path();
        request.executor_opts = ExecutorOptions {
            name,
            main_container: self.definition.container_image.clone(),
            environment: self.definition.environment.clone(),
            labels,
            artifacts_directory: format!("{ARTIFACTS_ROOT}/{key_path}"),
            cache_directory: if self.definition.method.supports_cache() {
                format!("{CACHE_ROOT}/{key_path}")
            } else {
                String::new()
            },
            working_directory: String::new(),
        };
        Ok(request)
    }

    /// 作业不需要完整重启，且上一次执行中同一任务已经完成
    pub fn can_reuse_previous_result(&self) -> bool {
        !self.job.does_require_full_restart()
            && self
                .previous
                .as_ref()
                .map(|p| p.task_state.is_completed())
                .unwrap_or(false)
    }

    /// 用上一次执行的结果在本地合成响应
    pub fn build_task_response_from_previous_result(&self) -> QueenResult<TaskResponse> {
        let previous = self
            .previous
            .as_ref()
            .filter(|p| p.task_state.is_completed())
            .ok_or_else(|| {
                QueenError::invalid_state(format!(
                    "任务 {} 没有可复用的结果",
                    self.definition.task_type
                ))
            })?;
        let mut response = TaskResponse {
            job_request_id: self.request_id(),
            task_execution_id: self.task_execution.id.clone(),
            job_type: self.job.request.job_type.clone(),
            task_type: previous.task_type.clone(),
            status: RequestState::Completed,
            ant_id: previous.ant_id.clone(),
            host: previous.ant_host.clone(),
            exit_code: previous.exit_code.clone(),
            exit_message: previous.exit_message.clone(),
            task_context: previous.contexts.clone(),
            artifacts: previous.artifacts.clone(),
            stdout: previous.stdout.clone(),
            started_at: Some(previous.started_at),
            ended_at: previous.ended_at,
            ..Default::default()
        };
        response.add_context(CONTEXT_REUSED_RESULT, json!(previous.id));
        Ok(response)
    }

    /// 合并Ant返回的结果；失败时匹配错误码并返回错误
    pub async fn update_task_from_response(&mut self, response: TaskResponse) -> QueenResult<()> {
        let task_type = self.definition.task_type.clone();
        for (name, value) in response.task_context {
            self.task_execution.add_context(&name, value);
        }
        if !response.job_context.is_empty() {
            let execution = self.job.execution_mut()?;
            for (name, value) in response.job_context {
                execution.add_context(&name, value);
            }
        }

        let task = &mut self.task_execution;
        if !response.ant_id.is_empty() {
            task.ant_id = response.ant_id;
        }
        if !response.host.is_empty() {
            task.ant_host = response.host;
        }
        task.exit_code = response.exit_code;
        task.exit_message = response.exit_message;
        task.failed_command = response.failed_command;
        if !response.stdout.is_empty() {
            task.stdout = response.stdout;
        }
        if let Some(started_at) = response.started_at {
            task.started_at = started_at;
        }
        task.task_state = response.status;
        task.error_code = response.error_code;
        if !response.error_message.is_empty() {
            task.error_message = response.error_message;
        }
        if let Some((state, code)) = self
            .definition
            .override_status_and_error_code(&task.exit_code)
        {
            debug!(task_type = %task_type, exit_code = %task.exit_code, state = %state, "退出码覆盖任务状态");
            task.task_state = state;
            if let Some(code) = code {
                task.error_code = code;
            }
        }
        if task.task_state.can_finalize() {
            task.ended_at = Some(response.ended_at.unwrap_or_else(Utc::now));
        }

        for (index, artifact) in response.artifacts.into_iter().enumerate() {
            self.save_artifact(index, artifact).await?;
        }

        let state = self.task_execution.task_state;
        if state.is_completed() || state.is_executing() {
            return Ok(());
        }

        let message = if self.task_execution.error_message.is_empty() {
            self.task_execution.exit_message.clone()
        } else {
            self.task_execution.error_message.clone()
        };
        if self.task_execution.error_code.is_empty() {
            let platform = self.job.definition()?.platform.clone();
            let matched = self
                .job
                .deps
                .error_codes
                .match_error(
                    &message,
                    &platform,
                    &self.task_execution.failed_command,
                    &self.job.request.job_type,
                    &task_type,
                )
                .await?;
            match matched {
                Some(code) => {
                    debug!(task_type = %task_type, code = %code.error_code, "匹配到错误码");
                    self.task_execution.error_code = code.error_code.clone();
                    self.job.last_error_code = Some(code.clone());
                    self.matched_error_code = Some(code);
                }
                None => self.task_execution.error_code = ERR_TASK_EXECUTE.to_string(),
            }
        }
        self.task_execution.error_message = message.clone();
        Err(QueenError::execution(
            self.task_execution.error_code.clone(),
            format!("任务 {} 执行失败: {}", task_type, message),
        ))
    }

    /// 补全工件归属，合并已有的元数据后保存
    async fn save_artifact(&mut self, index: usize, mut artifact: Artifact) -> QueenResult<()> {
        let request_id = self.request_id();
        let forked = matches!(
            self.definition.method,
            TaskMethod::ForkJob | TaskMethod::AwaitForkedJob
        );
        if forked && artifact.job_request_id != 0 && artifact.job_request_id != request_id {
            artifact.task_type = format!("{}::{}", artifact.job_request_id, artifact.task_type);
        }
        if artifact.job_request_id == 0 {
            artifact.job_request_id = request_id;
        }
        if artifact.task_type.is_empty() {
            artifact.task_type = self.task_execution.task_type.clone();
        }
        artifact.job_execution_id = self.task_execution.job_execution_id.clone();
        artifact.task_execution_id = self.task_execution.id.clone();
        artifact.user_id = self.job.request.user_id.clone();
        artifact.organization_id = self.job.request.organization_id.clone();

        let artifact_manager = &self.job.deps.artifact_manager;
        if let Some(existing) = artifact_manager.get_artifact(&artifact.id).await? {
            for (name, value) in existing.metadata {
                artifact.metadata.entry(name).or_insert(value);
            }
        }
        artifact.add_metadata("task_state", self.task_execution.task_state.as_str());
        artifact_manager.save_artifact(&artifact).await?;

        if !artifact.url.is_empty() {
            let key = format!("{}_ArtifactURL_{}", self.task_execution.task_type, index + 1);
            self.task_execution.add_context(&key, Value::String(artifact.url.clone()));
        }
        self.task_execution.add_artifact(artifact);
        Ok(())
    }

    pub async fn set_task_to_executing(&mut self) -> QueenResult<()> {
        let task = &mut self.task_execution;
        task.task_state = RequestState::Executing;
        task.started_at = Utc::now();
        task.ended_at = None;
        task.error_code.clear();
        task.error_message.clear();
        self.matched_error_code = None;
        self.sync_to_job()?;
        self.job
            .deps
            .job_manager
            .save_task_execution(&self.task_execution)
            .await?;
        self.publish_lifecycle_event().await;
        Ok(())
    }

    pub fn set_failed(&mut self, code: &str, message: &str) {
        self.task_execution.task_state = RequestState::Failed;
        self.task_execution.error_code = code.to_string();
        self.task_execution.error_message = message.to_string();
        self.task_execution.ended_at = Some(Utc::now());
    }

    /// 任务级重试：模板重试次数，或RETRY_TASK错误码给出的次数
    pub fn can_retry(&self) -> bool {
        let retried = self.task_execution.retried;
        if retried < self.definition.retry + 1 {
            return true;
        }
        matches!(
            &self.matched_error_code,
            Some(code) if code.action == ErrorCodeAction::RetryTask && retried < code.retry + 1
        )
    }

    /// 持久化最终状态并发布任务生命周期事件
    pub async fn finalize_task_state(&mut self) -> QueenResult<()> {
        if self.task_execution.ended_at.is_none() {
            self.task_execution.ended_at = Some(Utc::now());
        }
        self.sync_to_job()?;
        let job_manager = &self.job.deps.job_manager;
        job_manager.save_task_execution(&self.task_execution).await?;
        if let Some(execution) = &self.job.execution {
            job_manager.save_job_execution(execution).await?;
        }
        let job_type = &self.job.request.job_type;
        if self.task_execution.task_state.is_completed() {
            incr_job_counter(TASK_COMPLETED_TOTAL, job_type);
        } else {
            incr_job_counter(TASK_FAILED_TOTAL, job_type);
        }
        self.publish_lifecycle_event().await;
        info!(
            request_id = self.request_id(),
            task_type = %self.task_execution.task_type,
            state = %self.task_execution.task_state,
            exit_code = %self.task_execution.exit_code,
            "任务执行结束"
        );
        Ok(())
    }

    fn sync_to_job(&mut self) -> QueenResult<()> {
        let task = self.task_execution.clone();
        self.job.execution_mut()?.upsert_task(task);
        Ok(())
    }

    async fn publish_lifecycle_event(&self) {
        let deps = &self.job.deps;
        let event = TaskExecutionLifecycleEvent::new(deps.server_id(), &self.job.request, &self.task_execution);
        let result = match event.encode() {
            Ok(payload) => {
                deps.queue
                    .publish(&deps.config.topics.task_lifecycle, QueueMessage::new(payload))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(
                request_id = self.request_id(),
                task_type = %self.task_execution.task_type,
                "发布任务生命周期事件失败: {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_is_dns_compatible() {
        assert_eq!(to_dns_label("FRM-12-compile-0-1-AbC9"), "frm-12-compile-0-1-abc9");
        assert_eq!(to_dns_label("FRM_1_a.b-"), "frm-1-a-b");
        assert_eq!(to_dns_label(&"x".repeat(100)).len(), 63);
    }
}
