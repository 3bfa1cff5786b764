#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use queen_core::config::QueenConfig;
use queen_core::models::{
    AntRegistration, JobDefinition, JobRequest, PlainCipher, RequestState, TaskAction,
    TaskDefinition, TaskMethod, TaskRequest, TaskResponse,
};
use queen_core::traits::{
    message_handler, ErrorCodeRepository, JobManager, QueueClient, QueueMessage, SubscribeOptions,
};
use queen_core::QueenResult;
use queen_dispatcher::{Collaborators, JobExecutionStateMachine, JobLauncher, ResourceManager, ResourceManagerImpl};
use queen_infrastructure::{
    InMemoryArtifactManager, InMemoryErrorCodeRepository, InMemoryJobManager, InMemoryQueueClient,
    InMemoryQueueConfig, InMemoryUserManager, LocalEventBus,
};

/// Ant收到任务请求后返回的结果
pub type Script = Arc<dyn Fn(&TaskRequest) -> TaskResponse + Send + Sync>;

pub fn completed(exit_code: &'static str) -> Script {
    Arc::new(move |request| TaskResponse::for_request(request, RequestState::Completed, exit_code))
}

pub fn failed(message: &'static str) -> Script {
    Arc::new(move |request| {
        let mut response = TaskResponse::for_request(request, RequestState::Failed, "1");
        response.error_message = message.to_string();
        response
    })
}

pub fn test_config() -> QueenConfig {
    let mut config = QueenConfig::default();
    config.common.id = "queen-test".to_string();
    config.common.max_job_timeout_secs = 30;
    config.common.max_task_timeout_secs = 30;
    config.common.job_status_update_interval_secs = 1;
    config.queue.redelivery_delay_ms = 10;
    config
}

pub fn task(task_type: &str) -> TaskDefinition {
    let mut task = TaskDefinition::new(task_type, TaskMethod::Docker).with_tags(&["linux"]);
    task.delay_between_retries_ms = 10;
    task
}

pub fn job(job_type: &str, tasks: Vec<TaskDefinition>) -> JobDefinition {
    let mut definition = JobDefinition::new(job_type, tasks);
    definition.delay_between_retries_ms = 10;
    definition
}

/// 用队列订阅模拟的Ant
pub struct FakeAnt {
    pub ant_id: String,
    pub topic: String,
    executed: Arc<AtomicUsize>,
}

impl FakeAnt {
    /// 收到的执行请求数，不含LIST
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

/// 全部使用内存实现的编排环境
pub struct Harness {
    pub config: Arc<QueenConfig>,
    pub queue: Arc<InMemoryQueueClient>,
    pub job_manager: Arc<InMemoryJobManager>,
    pub artifacts: Arc<InMemoryArtifactManager>,
    pub users: Arc<InMemoryUserManager>,
    pub resource_manager: Arc<ResourceManagerImpl>,
    pub launcher: Arc<JobLauncher>,
    pub deps: Collaborators,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(test_config(), Arc::new(InMemoryErrorCodeRepository::new())).await
    }

    pub async fn with(config: QueenConfig, error_codes: Arc<dyn ErrorCodeRepository>) -> Self {
        let harness = Self::build(config, error_codes).await;
        harness.launcher.start().await.unwrap();
        harness
    }

    /// 不启动作业启动器，启动事件留在队列里
    pub async fn without_launcher() -> Self {
        Self::build(test_config(), Arc::new(InMemoryErrorCodeRepository::new())).await
    }

    async fn build(config: QueenConfig, error_codes: Arc<dyn ErrorCodeRepository>) -> Self {
        let config = Arc::new(config);
        let queue = Arc::new(InMemoryQueueClient::with_config(InMemoryQueueConfig::from(
            &config.queue,
        )));
        let job_manager = Arc::new(InMemoryJobManager::new());
        let artifacts = Arc::new(InMemoryArtifactManager::new());
        let users = Arc::new(InMemoryUserManager::new());
        let resource_manager = Arc::new(ResourceManagerImpl::new(
            &config,
            queue.clone(),
            Arc::new(PlainCipher),
        ));
        resource_manager.start_subscriptions().await.unwrap();

        let deps = Collaborators {
            config: config.clone(),
            job_manager: job_manager.clone(),
            artifact_manager: artifacts.clone(),
            user_manager: users.clone(),
            error_codes,
            resource_manager: resource_manager.clone(),
            queue: queue.clone(),
            cipher: Arc::new(PlainCipher),
        };
        let launcher = Arc::new(JobLauncher::new(deps.clone(), LocalEventBus::new(64)));

        Self {
            config,
            queue,
            job_manager,
            artifacts,
            users,
            resource_manager,
            launcher,
            deps,
        }
    }

    /// 注册一个支持Docker和linux标签的Ant，每个执行请求先等待 `delay` 再按脚本回复
    pub async fn start_ant(&self, ant_id: &str, delay: Duration, script: Script) -> FakeAnt {
        self.start_ant_with(ant_id, vec![TaskMethod::Docker], &["linux"], delay, script)
            .await
    }

    /// 按指定的执行方式和标签注册Ant
    pub async fn start_ant_with(
        &self,
        ant_id: &str,
        methods: Vec<TaskMethod>,
        tags: &[&str],
        delay: Duration,
        script: Script,
    ) -> FakeAnt {
        let topic = format!("ant-{ant_id}");
        let executed = Arc::new(AtomicUsize::new(0));
        let queue = self.queue.clone();
        let counter = executed.clone();
        self.queue
            .subscribe(
                SubscribeOptions::exclusive(&topic),
                message_handler(move |message: QueueMessage| {
                    let queue = queue.clone();
                    let script = script.clone();
                    let counter = counter.clone();
                    async move {
                        let request = TaskRequest::unmarshal(&PlainCipher, "", &message.payload)?;
                        let response = match request.action {
                            TaskAction::Execute => {
                                counter.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(delay).await;
                                script(&request)
                            }
                            _ => TaskResponse::default(),
                        };
                        let reply_topic = message.reply_topic().unwrap_or_default().to_string();
                        let payload = response.marshal(&PlainCipher, "")?;
                        queue.send(&reply_topic, message.reply(payload)).await
                    }
                }),
            )
            .await
            .unwrap();

        let registration = AntRegistration::new(ant_id, &topic, 10, methods).with_tags(tags);
        self.resource_manager.register(registration).await.unwrap();
        FakeAnt {
            ant_id: ant_id.to_string(),
            topic,
            executed,
        }
    }

    /// 以新的标签重新注册已有的Ant，保留原来的主题
    pub async fn reregister(&self, ant: &FakeAnt, tags: &[&str]) {
        let registration =
            AntRegistration::new(&ant.ant_id, &ant.topic, 10, vec![TaskMethod::Docker]).with_tags(tags);
        self.resource_manager.register(registration).await.unwrap();
    }

    pub async fn add_job(&self, definition: JobDefinition) -> JobDefinition {
        self.job_manager.add_job_definition(definition).await.unwrap()
    }

    pub fn state_machine(&self, request: JobRequest) -> JobExecutionStateMachine {
        JobExecutionStateMachine::new(self.deps.clone(), request)
    }

    /// 按调度器的顺序预留资源并创建作业执行，启动事件交给启动器
    pub async fn submit(&self, request: JobRequest) -> QueenResult<u64> {
        self.job_manager.add_job_request(request.clone()).await;
        let mut jsm = self.state_machine(request);
        jsm.validate().await?;
        jsm.reserve_job_resources().await?;
        jsm.create_job_execution().await?;
        Ok(jsm.request.id)
    }

    pub async fn wait_for_request<F>(&self, id: u64, done: F) -> JobRequest
    where
        F: Fn(&JobRequest) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let request = self.job_manager.get_job_request(id).await.unwrap();
            if done(&request) {
                return request;
            }
            assert!(
                Instant::now() < deadline,
                "等待作业请求 {} 超时，当前状态 {}",
                id,
                request.job_state
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_for_terminal(&self, id: u64) -> JobRequest {
        self.wait_for_request(id, |r| r.job_state.is_terminal()).await
    }

    /// 等待某个Ant上的分配全部释放
    pub async fn wait_for_release(&self, ant_id: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let registration = self.resource_manager.registration(ant_id).await.unwrap();
            if registration.allocations.is_empty() {
                return;
            }
            assert!(Instant::now() < deadline, "Ant {} 的分配没有释放", ant_id);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
