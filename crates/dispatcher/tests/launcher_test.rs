mod common;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use mockall::mock;

    use queen_core::models::{
        ErrorCode, ErrorCodeAction, JobRequest, RequestState, TaskRequest, TaskResponse,
        ERR_INVALID_NEXT_TASK, ERR_TASK_EXECUTE, ERR_TASK_TIMED_OUT,
    };
    use queen_core::traits::{ErrorCodeRepository, JobManager};
    use queen_core::QueenResult;

    use crate::common::{completed, failed, job, task, test_config, Harness, Script};

    mock! {
        pub ErrorCodes {}

        #[async_trait]
        impl ErrorCodeRepository for ErrorCodes {
            async fn match_error(
                &self,
                message: &str,
                platform: &str,
                command: &str,
                job_type: &str,
                task_type: &str,
            ) -> QueenResult<Option<ErrorCode>>;
        }
    }

    /// 前 `times` 次请求按 `first` 回复，之后按 `then` 回复
    fn switch_after(times: usize, first: Script, then: Script) -> Script {
        let calls = Arc::new(AtomicUsize::new(0));
        Arc::new(move |request: &TaskRequest| {
            if calls.fetch_add(1, Ordering::SeqCst) < times {
                first(request)
            } else {
                then(request)
            }
        })
    }

    fn by_task(failing: &'static str) -> Script {
        Arc::new(move |request: &TaskRequest| {
            if request.task_type == failing {
                let mut response = TaskResponse::for_request(request, RequestState::Failed, "1");
                response.error_message = "编译错误".to_string();
                response
            } else {
                TaskResponse::for_request(request, RequestState::Completed, "0")
            }
        })
    }

    #[tokio::test]
    async fn test_job_runs_task_graph_to_completion() {
        let harness = Harness::new().await;
        let ant = harness.start_ant("A1", Duration::ZERO, completed("0")).await;
        harness
            .add_job(job(
                "build",
                vec![task("compile").on_completed("package"), task("package")],
            ))
            .await;

        let id = harness.submit(JobRequest::new(1, "", "build")).await.unwrap();
        let request = harness.wait_for_terminal(id).await;

        assert_eq!(request.job_state, RequestState::Completed);
        assert_eq!(ant.executed(), 2);
        let executions = harness.job_manager.job_executions().await;
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].job_state, RequestState::Completed);
        let tasks: Vec<_> = executions[0].tasks.iter().map(|t| t.task_type.as_str()).collect();
        assert_eq!(tasks, vec!["compile", "package"]);
        assert!(executions[0].tasks.iter().all(|t| t.task_state == RequestState::Completed));

        harness.wait_for_release("A1").await;
    }

    #[tokio::test]
    async fn test_allowed_failure_continues_to_next_task() {
        let harness = Harness::new().await;
        let ant = harness.start_ant("A1", Duration::ZERO, by_task("lint")).await;
        harness
            .add_job(job(
                "build",
                vec![
                    task("lint").allow_failure().on_completed("package"),
                    task("package"),
                ],
            ))
            .await;

        let id = harness.submit(JobRequest::new(2, "", "build")).await.unwrap();
        let request = harness.wait_for_terminal(id).await;

        assert_eq!(request.job_state, RequestState::Completed);
        assert_eq!(ant.executed(), 2);
        let execution = &harness.job_manager.job_executions().await[0];
        assert_eq!(execution.get_task("lint").unwrap().task_state, RequestState::Failed);
        assert_eq!(
            execution.get_task("package").unwrap().task_state,
            RequestState::Completed
        );
    }

    #[tokio::test]
    async fn test_failed_task_fails_job_and_runs_always_tasks() {
        let harness = Harness::new().await;
        harness.start_ant("A1", Duration::ZERO, by_task("compile")).await;
        harness
            .add_job(job(
                "build",
                vec![
                    task("compile").on_completed("package"),
                    task("package"),
                    task("cleanup").always_run(),
                ],
            ))
            .await;

        let id = harness.submit(JobRequest::new(3, "", "build")).await.unwrap();
        let request = harness.wait_for_terminal(id).await;

        assert_eq!(request.job_state, RequestState::Failed);
        assert_eq!(request.error_code, ERR_TASK_EXECUTE);
        let execution = &harness.job_manager.job_executions().await[0];
        assert!(execution.get_task("package").is_none());
        assert_eq!(
            execution.get_task("cleanup").unwrap().task_state,
            RequestState::Completed
        );
    }

    #[tokio::test]
    async fn test_task_retry_recovers_from_transient_failure() {
        let harness = Harness::new().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let script: Script = Arc::new(move |request: &TaskRequest| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                TaskResponse::for_request(request, RequestState::Failed, "1")
            } else {
                TaskResponse::for_request(request, RequestState::Completed, "0")
            }
        });
        let ant = harness.start_ant("A1", Duration::ZERO, script).await;
        let mut compile = task("compile");
        compile.retry = 1;
        harness.add_job(job("build", vec![compile])).await;

        let id = harness.submit(JobRequest::new(4, "", "build")).await.unwrap();
        let request = harness.wait_for_terminal(id).await;

        assert_eq!(request.job_state, RequestState::Completed);
        assert_eq!(ant.executed(), 2);
        let execution = &harness.job_manager.job_executions().await[0];
        let task = execution.get_task("compile").unwrap();
        assert_eq!(task.retried, 1);
        assert_eq!(task.task_state, RequestState::Completed);
    }

    #[tokio::test]
    async fn test_matched_error_code_is_recorded_on_job() {
        let mut error_codes = MockErrorCodes::new();
        error_codes
            .expect_match_error()
            .withf(|message, _, _, job_type, task_type| {
                message.contains("out of memory")
                    && job_type.eq_ignore_ascii_case("build")
                    && task_type.eq_ignore_ascii_case("compile")
            })
            .times(1)
            .returning(|_, _, _, _, _| {
                Ok(Some(ErrorCode::new(
                    "out of memory",
                    "ERR_OOM",
                    ErrorCodeAction::HardFailure,
                    0,
                )))
            });
        let harness = Harness::with(test_config(), Arc::new(error_codes)).await;
        harness.start_ant("A1", Duration::ZERO, failed("out of memory")).await;
        harness.add_job(job("build", vec![task("compile")])).await;

        let id = harness.submit(JobRequest::new(5, "", "build")).await.unwrap();
        let request = harness.wait_for_terminal(id).await;

        assert_eq!(request.job_state, RequestState::Failed);
        assert_eq!(request.error_code, "ERR_OOM");
        let execution = &harness.job_manager.job_executions().await[0];
        assert_eq!(execution.error_code, "ERR_OOM");
        assert_eq!(execution.get_task("compile").unwrap().error_code, "ERR_OOM");
    }

    #[tokio::test]
    async fn test_job_timeout_fails_running_task() {
        let harness = Harness::new().await;
        harness
            .start_ant("A1", Duration::from_secs(60), completed("0"))
            .await;
        let mut definition = job("build", vec![task("compile")]);
        definition.timeout_secs = 1;
        harness.add_job(definition).await;

        let id = harness.submit(JobRequest::new(6, "", "build")).await.unwrap();
        let request = harness.wait_for_terminal(id).await;

        assert_eq!(request.job_state, RequestState::Failed);
        assert_eq!(request.error_code, ERR_TASK_TIMED_OUT);
        harness.wait_for_release("A1").await;
    }

    #[tokio::test]
    async fn test_missing_reservation_reverts_request_to_pending() {
        let harness = Harness::new().await;
        harness.add_job(job("build", vec![task("compile")])).await;
        let request = JobRequest::new(7, "", "build");
        harness.job_manager.add_job_request(request.clone()).await;

        // 不预留资源直接创建作业执行
        let mut jsm = harness.state_machine(request);
        jsm.validate().await.unwrap();
        jsm.create_job_execution().await.unwrap();

        let request = harness
            .wait_for_request(7, |r| {
                r.job_state == RequestState::Pending && r.job_execution_id.is_empty()
            })
            .await;
        assert!(!request.error_message.is_empty());
        assert!(harness.job_manager.job_executions().await.is_empty());
        assert_eq!(harness.launcher.count_processing_jobs().await, 0);
    }

    #[tokio::test]
    async fn test_processing_jobs_are_tracked_until_done() {
        let harness = Harness::new().await;
        let ant = harness
            .start_ant("A1", Duration::from_millis(300), completed("0"))
            .await;
        harness.add_job(job("build", vec![task("compile")])).await;

        let id = harness.submit(JobRequest::new(8, "", "build")).await.unwrap();
        harness
            .wait_for_request(id, |r| r.job_state == RequestState::Executing)
            .await;
        assert_eq!(harness.launcher.count_processing_jobs().await, 1);
        assert!(harness.launcher.is_processing(id).await);

        harness.wait_for_terminal(id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.launcher.count_processing_jobs().await, 0);
        assert_eq!(ant.executed(), 1);
        assert_eq!(
            harness.job_manager.get_job_request(id).await.unwrap().job_state,
            RequestState::Completed
        );
    }

    #[tokio::test]
    async fn test_route_back_to_same_task_is_stopped_as_cycle() {
        let harness = Harness::new().await;
        let ant = harness.start_ant("A1", Duration::ZERO, completed("0")).await;
        harness
            .add_job(job(
                "spin",
                vec![task("start").on_completed("spin"), task("spin").on_completed("spin")],
            ))
            .await;

        let id = harness.submit(JobRequest::new(9, "", "spin")).await.unwrap();
        let request = harness.wait_for_terminal(id).await;

        assert_eq!(request.job_state, RequestState::Failed);
        assert_eq!(request.error_code, ERR_INVALID_NEXT_TASK);
        assert_eq!(ant.executed(), 2);
        harness.wait_for_release("A1").await;
    }

    #[tokio::test]
    async fn test_executing_exit_code_keeps_polling_past_hop_limit() {
        let harness = Harness::new().await;
        let ant = harness
            .start_ant("A1", Duration::ZERO, switch_after(3, completed("202"), completed("0")))
            .await;
        harness
            .add_job(job("poll", vec![task("wait").on_exit("202", "EXECUTING")]))
            .await;

        let id = harness.submit(JobRequest::new(10, "", "poll")).await.unwrap();
        let request = harness.wait_for_terminal(id).await;

        assert_eq!(request.job_state, RequestState::Completed);
        assert_eq!(ant.executed(), 4);
        let execution = &harness.job_manager.job_executions().await[0];
        assert_eq!(execution.tasks.len(), 1);
        assert_eq!(execution.get_task("wait").unwrap().exit_code, "0");
    }

    #[tokio::test]
    async fn test_executing_response_is_polled_without_counting_retries() {
        let harness = Harness::new().await;
        let executing: Script =
            Arc::new(|request: &TaskRequest| TaskResponse::for_request(request, RequestState::Executing, ""));
        let ant = harness
            .start_ant("A1", Duration::ZERO, switch_after(3, executing, completed("0")))
            .await;
        harness.add_job(job("build", vec![task("compile")])).await;

        let id = harness.submit(JobRequest::new(11, "", "build")).await.unwrap();
        let request = harness.wait_for_terminal(id).await;

        assert_eq!(request.job_state, RequestState::Completed);
        assert_eq!(ant.executed(), 4);
        let execution = &harness.job_manager.job_executions().await[0];
        let task = execution.get_task("compile").unwrap();
        assert_eq!(task.retried, 0);
        assert_eq!(task.task_state, RequestState::Completed);
    }

    #[tokio::test]
    async fn test_excepted_task_is_skipped_without_dispatch() {
        let harness = Harness::new().await;
        let ant = harness.start_ant("A1", Duration::ZERO, completed("0")).await;
        let mut deploy = task("deploy");
        deploy.except = "true".to_string();
        harness
            .add_job(job("release", vec![task("compile").on_completed("deploy"), deploy]))
            .await;

        let id = harness.submit(JobRequest::new(12, "", "release")).await.unwrap();
        let request = harness.wait_for_terminal(id).await;

        assert_eq!(request.job_state, RequestState::Completed);
        assert_eq!(ant.executed(), 1);
        let execution = &harness.job_manager.job_executions().await[0];
        let deploy = execution.get_task("deploy").unwrap();
        assert_eq!(deploy.task_state, RequestState::Completed);
        assert_eq!(deploy.exit_code, "SKIPPED");
    }

    #[tokio::test]
    async fn test_task_is_re_reserved_when_ant_stops_matching() {
        let harness = Harness::without_launcher().await;
        let first = harness.start_ant("A1", Duration::ZERO, completed("0")).await;
        harness.add_job(job("build", vec![task("compile")])).await;
        let id = harness.submit(JobRequest::new(13, "", "build")).await.unwrap();

        // 预留之后A1换了标签，只有A2还支持linux
        harness.reregister(&first, &["other"]).await;
        let second = harness.start_ant("A2", Duration::ZERO, completed("0")).await;
        harness.launcher.start().await.unwrap();

        let request = harness.wait_for_terminal(id).await;
        assert_eq!(request.job_state, RequestState::Completed);
        assert_eq!(first.executed(), 0);
        assert_eq!(second.executed(), 1);
        let execution = &harness.job_manager.job_executions().await[0];
        assert_eq!(execution.get_task("compile").unwrap().ant_id, "A2");
        harness.wait_for_release("A1").await;
        harness.wait_for_release("A2").await;
    }
}
