use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use queen_core::models::{
    is_terminal_code, JobExecutionLifecycleEvent, JobDefinition, NextTask, RequestState,
    TaskDefinition, TaskExecution, ERR_INVALID_NEXT_TASK, ERR_PAUSE_JOB, ERR_QUOTA_EXCEEDED,
    ERR_RESTART_JOB, ERR_TASK_EXECUTE,
};
use queen_core::{QueenError, QueenResult};
use queen_infrastructure::LocalEventBus;

use super::context::{CancelReason, ExecutionContext};
use super::task_supervisor::TaskSupervisor;
use crate::fsm::{HeartbeatProbe, JobExecutionStateMachine};

/// 作业超时之外的余量
const JOB_TIMEOUT_GRACE: Duration = Duration::from_secs(2);
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);
/// `EXECUTING` 路由重跑同一任务的间隔下限
const MIN_RERUN_INTERVAL: Duration = Duration::from_millis(10);

/// 驱动一个作业执行从EXECUTING到结束
#[derive(Clone)]
pub struct JobSupervisor {
    task_supervisor: TaskSupervisor,
    event_bus: LocalEventBus<JobExecutionLifecycleEvent>,
    lifecycle_topic: String,
}

impl JobSupervisor {
    pub fn new(event_bus: LocalEventBus<JobExecutionLifecycleEvent>, lifecycle_topic: &str) -> Self {
        Self {
            task_supervisor: TaskSupervisor::new(),
            event_bus,
            lifecycle_topic: lifecycle_topic.to_string(),
        }
    }

    /// 运行作业直到结束，返回作业请求的最终状态
    pub async fn run(
        &self,
        mut jsm: JobExecutionStateMachine,
        parent: &ExecutionContext,
    ) -> QueenResult<RequestState> {
        let common = jsm.deps.config.common.clone();
        let max_job_timeout = common.max_job_timeout();
        let timeout = jsm
            .definition()?
            .timeout()
            .or((!max_job_timeout.is_zero()).then_some(max_job_timeout))
            .map(|t| t + JOB_TIMEOUT_GRACE);
        let ctx = parent.child_with_timeout(timeout);

        // 先订阅再进入EXECUTING，不会错过紧随其后的取消事件
        let watcher = self.spawn_lifecycle_watcher(jsm.request.id, &ctx).await;
        if let Err(e) = jsm.set_job_status_to_executing().await {
            watcher.abort();
            jsm.launch_failed(&e).await?;
            return Err(e);
        }
        let heartbeat = spawn_heartbeat(
            jsm.heartbeat_probe(),
            common.job_status_update_interval(),
            ctx.clone(),
        );

        let outcome = self.execute_with_retries(&mut jsm, &ctx).await;
        watcher.abort();
        heartbeat.abort();

        self.finish(&mut jsm, &ctx, parent, outcome).await?;
        Ok(jsm.request.job_state)
    }

    /// 订阅进程内生命周期事件，外部取消或暂停时结束上下文
    async fn spawn_lifecycle_watcher(&self, request_id: u64, ctx: &ExecutionContext) -> JoinHandle<()> {
        let mut events = self.event_bus.subscribe(&self.lifecycle_topic).await;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.job_request_id == request_id => {
                        let reason = match event.job_state {
                            RequestState::Paused => CancelReason::Paused,
                            state if state.is_terminal() => CancelReason::Cancelled,
                            _ => continue,
                        };
                        info!(request_id, state = %event.job_state, "收到作业生命周期事件，结束执行");
                        ctx.cancel(reason);
                        break;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(request_id, skipped, "生命周期事件订阅落后");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn execute_with_retries(
        &self,
        jsm: &mut JobExecutionStateMachine,
        ctx: &ExecutionContext,
    ) -> QueenResult<()> {
        loop {
            if jsm.does_require_full_restart() {
                reset_execution(jsm).await?;
            }
            let err = match self.execute_graph(jsm, ctx).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if is_terminal_code(err.error_code()) || err.is_quota_exceeded() || ctx.is_done() {
                return Err(err);
            }

            jsm.request.incr_retried();
            if !jsm.can_retry() {
                return Err(err);
            }
            warn!(
                request_id = jsm.request.id,
                retried = jsm.request.retried,
                "作业执行失败，准备重试: {}",
                err
            );
            if let Err(e) = jsm.deps.job_manager.save_job_request(&jsm.request).await {
                warn!(request_id = jsm.request.id, "保存重试次数失败: {}", e);
            }
            if ctx.sleep(jsm.definition()?.delay_between_retries()).await.is_err() {
                return Err(err);
            }
        }
    }

    /// 从第一个任务开始按退出码路由依次执行
    async fn execute_graph(
        &self,
        jsm: &mut JobExecutionStateMachine,
        ctx: &ExecutionContext,
    ) -> QueenResult<()> {
        let definition = jsm.definition()?.clone();
        let mut current = definition.first_task()?.clone();
        let max_hops = definition.tasks.len();
        let mut hops = 0;
        loop {
            if let Some(err) = ctx.error() {
                return Err(err);
            }
            let task = self
                .task_supervisor
                .execute(jsm, &current.task_type, ctx)
                .await?;
            match definition.next_task(&current, task.task_state, &task.exit_code) {
                NextTask::Task(next) => {
                    // 按名字路由回自己也算一次跳转
                    hops += 1;
                    if hops > max_hops {
                        return Err(QueenError::execution(
                            ERR_INVALID_NEXT_TASK,
                            format!("任务路由超过 {max_hops} 次跳转，存在环"),
                        ));
                    }
                    debug!(from = %current.task_type, to = %next.task_type, "路由到下一个任务");
                    current = next.clone();
                }
                NextTask::Rerun(task_definition) => {
                    let poll = task_definition.delay_between_retries().max(MIN_RERUN_INTERVAL);
                    debug!(task_type = %current.task_type, "退出码要求重跑任务，{:?} 后再次执行", poll);
                    ctx.sleep(poll).await?;
                    jsm.forget_task(&current.task_type).await?;
                }
                NextTask::End => return end_of_graph(&definition, &current, &task),
            }
        }
    }

    async fn finish(
        &self,
        jsm: &mut JobExecutionStateMachine,
        ctx: &ExecutionContext,
        parent: &ExecutionContext,
        outcome: QueenResult<()>,
    ) -> QueenResult<()> {
        let err = match outcome {
            Ok(()) => return jsm.execution_completed().await,
            Err(e) => e,
        };
        match ctx.cancel_reason() {
            Some(CancelReason::Paused) => jsm.pause_job("收到暂停事件").await,
            Some(CancelReason::Shutdown) => {
                jsm.restart_job_back_to_pending("服务器关闭，作业重新排队").await
            }
            Some(reason) => {
                jsm.execution_cancelled(reason.error_code(), &err.to_string())
                    .await
            }
            None => {
                self.run_always_tasks(jsm, parent).await;
                let message = err.to_string();
                match err.error_code() {
                    ERR_RESTART_JOB => jsm.restart_job_back_to_pending(&message).await,
                    ERR_PAUSE_JOB => jsm.pause_job(&message).await,
                    _ if err.is_quota_exceeded() => {
                        jsm.execution_cancelled(ERR_QUOTA_EXCEEDED, &message).await
                    }
                    code => jsm.execution_failed(code, &message).await,
                }
            }
        }
    }

    /// 失败后补跑还没有执行过的 always_run 任务
    async fn run_always_tasks(&self, jsm: &mut JobExecutionStateMachine, parent: &ExecutionContext) {
        let pending: Vec<String> = match (jsm.definition(), jsm.execution.as_ref()) {
            (Ok(definition), Some(execution)) => definition
                .always_run_tasks()
                .into_iter()
                .filter(|t| execution.get_task(&t.task_type).is_none())
                .map(|t| t.task_type.clone())
                .collect(),
            _ => Vec::new(),
        };
        let ctx = parent.child_with_timeout(None);
        for task_type in pending {
            match self.task_supervisor.execute(jsm, &task_type, &ctx).await {
                Ok(task) => info!(task_type = %task_type, state = %task.task_state, "always_run 任务已执行"),
                Err(e) => warn!(task_type = %task_type, "always_run 任务执行出错: {}", e),
            }
        }
    }
}

/// 没有后继任务时判断作业是否成功结束
fn end_of_graph(definition: &JobDefinition, current: &TaskDefinition, task: &TaskExecution) -> QueenResult<()> {
    let state = task.task_state;
    if state.is_paused() {
        return Err(QueenError::execution(
            ERR_PAUSE_JOB,
            format!("任务 {} 请求暂停作业", task.task_type),
        ));
    }
    if state.is_failed() && !current.allow_failure {
        let code = if task.error_code.is_empty() {
            ERR_TASK_EXECUTE
        } else {
            task.error_code.as_str()
        };
        return Err(QueenError::execution(
            code,
            format!("任务 {} 失败: {}", task.task_type, task.error_message),
        ));
    }
    if state.is_completed() && is_unrouted_exit(definition, current, &task.exit_code) {
        return Err(QueenError::execution(
            ERR_INVALID_NEXT_TASK,
            format!("任务 {} 的退出码 {} 没有对应的路由", task.task_type, task.exit_code),
        ));
    }
    Ok(())
}

/// 任务按退出码路由到其他任务，而这次的退出码没有匹配任何路由
fn is_unrouted_exit(definition: &JobDefinition, task: &TaskDefinition, exit_code: &str) -> bool {
    let key = exit_code.trim().to_ascii_uppercase();
    if !task.has_next()
        || task.on_exit_code.contains_key(&key)
        || task.on_exit_code.contains_key(RequestState::Completed.as_str())
    {
        return false;
    }
    task.on_exit_code.iter().any(|(route, target)| {
        route.parse::<RequestState>().is_err() && definition.get_task(target).is_some()
    })
}

/// 完整重启：丢弃本次执行中的任务结果和上一次执行的结果
async fn reset_execution(jsm: &mut JobExecutionStateMachine) -> QueenResult<()> {
    let job_manager = Arc::clone(&jsm.deps.job_manager);
    let execution = jsm.execution_mut()?;
    for task in execution.tasks.drain(..) {
        job_manager.delete_task_execution(&task.id).await?;
    }
    execution.contexts.clear();
    jsm.last_execution = None;
    info!(request_id = jsm.request.id, retried = jsm.request.retried, "作业完整重启");
    Ok(())
}

/// 周期性刷新请求时间戳并复查配额，超额时取消作业
fn spawn_heartbeat(probe: HeartbeatProbe, interval: Duration, ctx: ExecutionContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(MIN_HEARTBEAT_INTERVAL));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match probe.tick().await {
                        Ok(()) => {}
                        Err(e) if e.is_quota_exceeded() => {
                            warn!(request_id = probe.request_id(), "配额超限，取消作业: {}", e);
                            ctx.cancel(CancelReason::QuotaExceeded);
                            if let Err(e) = probe.cancel_request().await {
                                warn!(request_id = probe.request_id(), "取消作业请求失败: {}", e);
                            }
                            break;
                        }
                        Err(e) => warn!(request_id = probe.request_id(), "作业心跳失败: {}", e),
                    }
                }
                _ = ctx.done() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use queen_core::models::TaskMethod;

    fn task_with_exit_routes() -> (JobDefinition, TaskDefinition) {
        let mut definition = JobDefinition::new(
            "build",
            vec![
                TaskDefinition::new("compile", TaskMethod::Shell)
                    .on_exit("0", "package")
                    .on_failed("cleanup"),
                TaskDefinition::new("package", TaskMethod::Shell),
                TaskDefinition::new("cleanup", TaskMethod::Shell).always_run(),
            ],
        );
        definition.validate().unwrap();
        let compile = definition.get_task("compile").unwrap().clone();
        (definition, compile)
    }

    #[test]
    fn test_unrouted_exit_code_is_ambiguous() {
        let (definition, compile) = task_with_exit_routes();
        assert!(!is_unrouted_exit(&definition, &compile, "0"));
        assert!(is_unrouted_exit(&definition, &compile, "3"));

        let only_failed = TaskDefinition::new("x", TaskMethod::Shell).on_failed("cleanup");
        assert!(!is_unrouted_exit(&definition, &only_failed, "0"));
    }

    #[test]
    fn test_end_of_graph_outcomes() {
        let (definition, compile) = task_with_exit_routes();
        let package = definition.get_task("package").unwrap().clone();
        let mut task = TaskExecution::new("exec-1", &package, 0);

        task.task_state = RequestState::Completed;
        assert!(end_of_graph(&definition, &package, &task).is_ok());

        task.task_state = RequestState::Failed;
        let err = end_of_graph(&definition, &package, &task).unwrap_err();
        assert_eq!(err.error_code(), ERR_TASK_EXECUTE);

        task.task_state = RequestState::Paused;
        assert_eq!(
            end_of_graph(&definition, &package, &task).unwrap_err().error_code(),
            ERR_PAUSE_JOB
        );

        let mut compiled = TaskExecution::new("exec-1", &compile, 0);
        compiled.task_state = RequestState::Completed;
        compiled.exit_code = "7".into();
        assert_eq!(
            end_of_graph(&definition, &compile, &compiled).unwrap_err().error_code(),
            ERR_INVALID_NEXT_TASK
        );
    }
}
