mod common;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use queen_core::models::{
        Artifact, ErrorCode, ErrorCodeAction, JobExecution, JobRequest, RequestState,
        TaskDefinition, TaskExecution, TaskMethod, ERR_VALIDATION,
    };
    use queen_core::traits::JobManager;
    use queen_core::QueenError;
    use queen_dispatcher::{ExecutionContext, ResourceManager, TaskSupervisor};

    use crate::common::{completed, job, task, Harness};

    #[tokio::test]
    async fn test_create_job_execution_twice_is_rejected() {
        let harness = Harness::without_launcher().await;
        harness.add_job(job("build", vec![task("compile")])).await;
        let request = JobRequest::new(21, "", "build");
        harness.job_manager.add_job_request(request.clone()).await;

        let mut jsm = harness.state_machine(request);
        jsm.validate().await.unwrap();
        let execution = jsm.create_job_execution().await.unwrap();
        assert_eq!(jsm.request.job_state, RequestState::Ready);

        let err = jsm.create_job_execution().await.unwrap_err();
        assert!(matches!(err, QueenError::JobExecutionExists(_)));
        assert_eq!(harness.job_manager.job_executions().await.len(), 1);

        let stored = harness.job_manager.get_job_request(21).await.unwrap();
        assert_eq!(stored.job_state, RequestState::Ready);
        assert_eq!(stored.job_execution_id, execution.id);
        assert_eq!(stored.schedule_attempts, 1);
    }

    #[tokio::test]
    async fn test_paused_execution_is_resumed_not_recreated() {
        let harness = Harness::without_launcher().await;
        harness.add_job(job("build", vec![task("compile")])).await;
        let mut request = JobRequest::new(22, "", "build");
        let mut paused = JobExecution::new(&request);
        paused.job_state = RequestState::Paused;
        harness.job_manager.save_job_execution(&paused).await.unwrap();
        request.job_state = RequestState::Paused;
        request.job_execution_id = paused.id.clone();
        harness.job_manager.add_job_request(request.clone()).await;

        let mut jsm = harness.state_machine(request);
        jsm.validate().await.unwrap();
        let execution = jsm.create_job_execution().await.unwrap();

        assert_eq!(execution.id, paused.id);
        assert_eq!(execution.job_state, RequestState::Ready);
        assert_eq!(harness.job_manager.job_executions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_previous_result_is_reused_without_dispatch() {
        let harness = Harness::without_launcher().await;
        let ant = harness.start_ant("A1", Duration::ZERO, completed("0")).await;
        let definition = harness.add_job(job("build", vec![task("compile")])).await;

        let mut request = JobRequest::new(23, "", "build");
        let mut previous = JobExecution::new(&request);
        previous.job_state = RequestState::Failed;
        let mut done = TaskExecution::new(&previous.id, definition.get_task("compile").unwrap(), 0);
        done.task_state = RequestState::Completed;
        done.exit_code = "0".to_string();
        done.add_context("Digest", json!("sha256:abc"));
        let mut report = Artifact::new("art-1", "report.txt");
        report.url = "s3://artifacts/report.txt".to_string();
        done.add_artifact(report);
        previous.upsert_task(done.clone());
        harness.job_manager.save_job_execution(&previous).await.unwrap();

        request.last_job_execution_id = previous.id.clone();
        harness.job_manager.add_job_request(request.clone()).await;
        let mut jsm = harness.state_machine(request);
        jsm.validate().await.unwrap();
        jsm.reserve_job_resources().await.unwrap();
        jsm.create_job_execution().await.unwrap();

        let ctx = ExecutionContext::new();
        let supervisor = TaskSupervisor::new();
        let task = supervisor.execute(&mut jsm, "compile", &ctx).await.unwrap();

        assert_eq!(ant.executed(), 0);
        assert_ne!(task.id, done.id);
        assert_eq!(task.task_state, RequestState::Completed);
        assert_eq!(task.exit_code, "0");
        assert_eq!(task.contexts.get("Digest"), Some(&json!("sha256:abc")));
        assert_eq!(
            task.contexts.get("ReusedPreviousResultFromTaskExecution"),
            Some(&json!(done.id))
        );
        assert_eq!(task.artifacts.len(), 1);
        assert_eq!(task.artifacts[0].id, "art-1");
        assert_eq!(task.artifacts[0].job_request_id, 23);
        assert_eq!(
            task.contexts.get("compile_ArtifactURL_1"),
            Some(&json!("s3://artifacts/report.txt"))
        );
        assert_eq!(harness.artifacts.count().await, 1);

        // 已完成的任务再次执行时原样返回
        let again = supervisor.execute(&mut jsm, "compile", &ctx).await.unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again, task);
        assert_eq!(ant.executed(), 0);
    }

    #[tokio::test]
    async fn test_full_restart_does_not_reuse_previous_result() {
        let harness = Harness::without_launcher().await;
        let ant = harness.start_ant("A1", Duration::ZERO, completed("0")).await;
        let mut definition = job("build", vec![task("compile")]);
        definition.hard_reset_after_retries = 1;
        let definition = harness.add_job(definition).await;

        let mut request = JobRequest::new(24, "", "build");
        let mut previous = JobExecution::new(&request);
        previous.job_state = RequestState::Failed;
        let mut done = TaskExecution::new(&previous.id, definition.get_task("compile").unwrap(), 0);
        done.task_state = RequestState::Completed;
        previous.upsert_task(done);
        harness.job_manager.save_job_execution(&previous).await.unwrap();

        request.last_job_execution_id = previous.id.clone();
        request.retried = 2;
        harness.job_manager.add_job_request(request.clone()).await;
        let mut jsm = harness.state_machine(request);
        jsm.validate().await.unwrap();
        assert!(jsm.does_require_full_restart());
        jsm.reserve_job_resources().await.unwrap();
        jsm.create_job_execution().await.unwrap();

        let task = TaskSupervisor::new()
            .execute(&mut jsm, "compile", &ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(task.task_state, RequestState::Completed);
        assert!(!task.contexts.contains_key("ReusedPreviousResultFromTaskExecution"));
        assert_eq!(ant.executed(), 1);
        assert_eq!(task.ant_id, "A1");
    }

    #[tokio::test]
    async fn test_missing_ant_fails_task_as_unavailable() {
        let harness = Harness::without_launcher().await;
        harness.add_job(job("build", vec![task("compile")])).await;
        let request = JobRequest::new(25, "", "build");
        harness.job_manager.add_job_request(request.clone()).await;

        let mut jsm = harness.state_machine(request);
        jsm.validate().await.unwrap();
        assert!(jsm.check_ant_resources_and_concurrency_for_job().await.unwrap_err().is_requeue());
        jsm.create_job_execution().await.unwrap();

        let task = TaskSupervisor::new()
            .execute(&mut jsm, "compile", &ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(task.task_state, RequestState::Failed);
        assert_eq!(task.error_code, "ERR_ANTS_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_job_gate_checks_each_task_on_its_own_ant() {
        let harness = Harness::without_launcher().await;
        harness
            .start_ant_with("gpu", vec![TaskMethod::Docker], &["gpu"], Duration::ZERO, completed("0"))
            .await;
        harness
            .start_ant_with("sh", vec![TaskMethod::Shell], &[], Duration::ZERO, completed("0"))
            .await;
        let train = TaskDefinition::new("train", TaskMethod::Docker)
            .with_tags(&["gpu"])
            .on_completed("report");
        let report = TaskDefinition::new("report", TaskMethod::Shell);
        harness.add_job(job("ml", vec![train, report])).await;
        let request = JobRequest::new(27, "", "ml");
        harness.job_manager.add_job_request(request.clone()).await;

        let mut jsm = harness.state_machine(request);
        jsm.validate().await.unwrap();
        jsm.check_ant_resources_and_concurrency_for_job().await.unwrap();

        let reservations = jsm.reserve_job_resources().await.unwrap();
        assert_eq!(reservations["train"].ant_id, "gpu");
        assert_eq!(reservations["report"].ant_id, "sh");
    }

    #[tokio::test]
    async fn test_launch_failure_releases_reservations() {
        let harness = Harness::without_launcher().await;
        harness.start_ant("A1", Duration::ZERO, completed("0")).await;
        harness.add_job(job("build", vec![task("compile")])).await;
        let request = JobRequest::new(26, "", "build");
        harness.job_manager.add_job_request(request.clone()).await;

        let mut jsm = harness.state_machine(request);
        jsm.validate().await.unwrap();
        jsm.reserve_job_resources().await.unwrap();
        jsm.create_job_execution().await.unwrap();
        assert_eq!(
            harness.resource_manager.registration("A1").await.unwrap().allocations.len(),
            1
        );

        jsm.launch_failed(&QueenError::validation("坏的启动事件")).await.unwrap();

        let stored = harness.job_manager.get_job_request(26).await.unwrap();
        assert_eq!(stored.job_state, RequestState::Failed);
        assert_eq!(stored.error_code, ERR_VALIDATION);
        assert!(jsm.reservations.is_empty());
        harness.wait_for_release("A1").await;
    }

    #[tokio::test]
    async fn test_job_retry_honours_retry_job_error_code() {
        let harness = Harness::without_launcher().await;
        harness.add_job(job("build", vec![task("compile")])).await;
        let request = JobRequest::new(27, "", "build");
        let mut jsm = harness.state_machine(request);
        jsm.validate().await.unwrap();

        jsm.request.incr_retried();
        assert!(!jsm.can_retry());

        jsm.last_error_code = Some(ErrorCode::new("disk", "ERR_DISK", ErrorCodeAction::RetryJob, 2));
        assert!(jsm.can_retry());
        jsm.request.incr_retried();
        jsm.request.incr_retried();
        assert!(!jsm.can_retry());
    }
}
