use std::time::Duration;
use tracing::{debug, info, warn};

use queen_core::models::{
    is_terminal_code, RequestState, TaskExecution, TaskRequest, TaskResponse, ERR_TASK_EXECUTE,
};
use queen_core::traits::{headers, QueueMessage};
use queen_core::{QueenError, QueenResult};

use super::context::ExecutionContext;
use crate::fsm::{JobExecutionStateMachine, TaskExecutionStateMachine};

/// 任务超时之外留给Ant上报结果的余量
const TASK_TIMEOUT_GRACE: Duration = Duration::from_secs(60);
/// Ant报告仍在执行时的轮询间隔下限
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 驱动单个任务与Ant之间的请求应答
#[derive(Debug, Clone, Default)]
pub struct TaskSupervisor;

impl TaskSupervisor {
    pub fn new() -> Self {
        Self
    }

    /// 执行任务并返回最终的任务执行记录
    ///
    /// 任务失败不会返回错误，由调用方根据任务状态路由；
    /// 只有状态机本身出错时才返回错误。
    pub async fn execute(
        &self,
        job: &mut JobExecutionStateMachine,
        task_type: &str,
        parent: &ExecutionContext,
    ) -> QueenResult<TaskExecution> {
        let mut tsm = TaskExecutionStateMachine::new(job, task_type).await?;
        if tsm.is_already_completed() {
            debug!(task_type, "任务已经完成，直接返回");
            return Ok(tsm.task_execution.clone());
        }

        let max_task_timeout = tsm.job.deps.config.common.max_task_timeout();
        let timeout = match tsm.definition.timeout() {
            Some(timeout) => Some(timeout + TASK_TIMEOUT_GRACE),
            None if !max_task_timeout.is_zero() => Some(max_task_timeout),
            None => None,
        };
        let ctx = parent.child_with_timeout(timeout);

        let result = self.invoke(&mut tsm, &ctx).await;

        // 所有结果都在这里收尾
        if let Err(e) = &result {
            if !tsm.task_execution.task_state.is_failed() && !tsm.task_execution.task_state.is_paused() {
                tsm.set_failed(e.error_code(), &e.to_string());
            } else if tsm.task_execution.error_message.is_empty() {
                tsm.task_execution.error_message = e.to_string();
            }
        } else if !tsm.task_execution.task_state.can_finalize() {
            let err = ctx
                .error()
                .unwrap_or_else(|| QueenError::execution(ERR_TASK_EXECUTE, "任务以未知状态结束"));
            tsm.set_failed(err.error_code(), &err.to_string());
        }
        tsm.finalize_task_state().await?;
        Ok(tsm.task_execution.clone())
    }

    async fn invoke(&self, tsm: &mut TaskExecutionStateMachine<'_>, ctx: &ExecutionContext) -> QueenResult<()> {
        let task_type = tsm.definition.task_type.clone();
        if tsm.definition.is_except() {
            info!(task_type = %task_type, "任务满足跳过条件");
            tsm.task_execution.task_state = RequestState::Completed;
            tsm.task_execution.exit_code = "SKIPPED".to_string();
            return Ok(());
        }

        if tsm.can_reuse_previous_result() {
            let response = tsm.build_task_response_from_previous_result()?;
            info!(task_type = %task_type, "复用上一次作业执行的任务结果");
            return tsm.update_task_from_response(response).await;
        }

        tsm.set_task_to_executing().await?;
        let mut last_error: Option<QueenError> = None;
        loop {
            if let Some(err) = ctx.error() {
                return Err(err);
            }

            let outcome = self.dispatch(tsm, ctx).await;
            let state = tsm.task_execution.task_state;
            match outcome {
                Ok(()) if state.is_executing() => {
                    let poll = tsm.definition.delay_between_retries().max(MIN_POLL_INTERVAL);
                    debug!(task_type = %task_type, "Ant报告任务仍在执行，{:?} 后再次查询", poll);
                    ctx.sleep(poll).await?;
                    continue;
                }
                Ok(()) => return Ok(()),
                Err(e) if ctx.is_done() => return Err(ctx.error().unwrap_or(e)),
                Err(e) => {
                    let code = tsm.task_execution.error_code.clone();
                    if is_terminal_code(&code) || state.is_paused() {
                        return Err(e);
                    }
                    warn!(
                        task_type = %task_type,
                        retried = tsm.task_execution.retried,
                        "任务执行失败: {}",
                        e
                    );
                    last_error = Some(e);
                }
            }

            tsm.task_execution.retried += 1;
            if !tsm.can_retry() {
                break;
            }
            ctx.sleep(tsm.definition.delay_between_retries()).await?;
            tsm.set_task_to_executing().await?;
        }
        Err(last_error.unwrap_or_else(|| QueenError::execution(ERR_TASK_EXECUTE, "任务重试次数已用完")))
    }

    /// 一次请求应答；失败时任务状态已经更新
    async fn dispatch(&self, tsm: &mut TaskExecutionStateMachine<'_>, ctx: &ExecutionContext) -> QueenResult<()> {
        // 每次发送前都确认Ant仍然在线并且支持该任务
        let reservation = tsm.prepare_execution().await?;
        let request = tsm.build_task_request()?;
        let cipher = std::sync::Arc::clone(&tsm.job.deps.cipher);
        let payload = request.marshal(cipher.as_ref(), &reservation.encryption_key)?;
        let server_id = tsm.job.deps.server_id().to_string();
        let reply_topic = tsm.job.deps.config.topics.task_reply_topic(&server_id);
        let message = QueueMessage::new(payload).with_header(headers::SOURCE, &server_id);

        debug!(
            request_id = request.job_request_id,
            task_type = %request.task_type,
            ant_id = %reservation.ant_id,
            task_retry = request.task_retry,
            "发送任务请求"
        );
        let queue = std::sync::Arc::clone(&tsm.job.deps.queue);
        let reply = ctx
            .run(queue.send_receive(&reservation.ant_topic, message, &reply_topic))
            .await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) if ctx.is_done() => return Err(e),
            Err(e) => {
                // 队列出错时重新选择Ant
                tsm.reservation = None;
                tsm.set_failed(ERR_TASK_EXECUTE, &e.to_string());
                return Err(e);
            }
        };
        let response = TaskResponse::unmarshal(cipher.as_ref(), &reservation.encryption_key, &reply.payload)?;
        check_response(&request, &response)?;
        tsm.update_task_from_response(response).await
    }
}

fn check_response(request: &TaskRequest, response: &TaskResponse) -> QueenResult<()> {
    if response.job_request_id != request.job_request_id
        || (!response.task_execution_id.is_empty() && response.task_execution_id != request.task_execution_id)
    {
        return Err(QueenError::validation(format!(
            "任务响应不匹配: 期望 {}/{}，收到 {}/{}",
            request.job_request_id,
            request.task_execution_id,
            response.job_request_id,
            response.task_execution_id
        )));
    }
    Ok(())
}
