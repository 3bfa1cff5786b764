use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use queen_core::config::QueenConfig;
use queen_core::models::PlainCipher;
use queen_core::traits::QueueClient;
use queen_dispatcher::{Collaborators, JobLauncher, ResourceManagerImpl};
use queen_infrastructure::{
    InMemoryArtifactManager, InMemoryErrorCodeRepository, InMemoryJobManager, InMemoryQueueClient,
    InMemoryQueueConfig, InMemoryUserManager, LocalEventBus,
};

/// 关闭时等待作业退回PENDING的最长时间
const JOB_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);
const EVENT_BUS_CAPACITY: usize = 1024;

/// 编排服务器：把队列、存储、资源管理器和作业启动器组装在一起
pub struct Application {
    config: Arc<QueenConfig>,
    queue: Arc<InMemoryQueueClient>,
    job_manager: Arc<InMemoryJobManager>,
    artifact_manager: Arc<InMemoryArtifactManager>,
    user_manager: Arc<InMemoryUserManager>,
    error_codes: Arc<InMemoryErrorCodeRepository>,
    resource_manager: Arc<ResourceManagerImpl>,
    deps: Collaborators,
    launcher: Arc<JobLauncher>,
    reaper_shutdown: broadcast::Sender<()>,
    reapers: Mutex<Vec<JoinHandle<()>>>,
}

impl Application {
    pub fn new(config: QueenConfig) -> Result<Self> {
        config.validate().context("编排服务器配置无效")?;
        info!("初始化编排服务器 {}", config.common.id);

        let config = Arc::new(config);
        let queue = Arc::new(InMemoryQueueClient::with_config(InMemoryQueueConfig::from(
            &config.queue,
        )));
        let job_manager = Arc::new(InMemoryJobManager::new());
        let artifact_manager = Arc::new(InMemoryArtifactManager::new());
        let user_manager = Arc::new(InMemoryUserManager::new());
        let error_codes = Arc::new(InMemoryErrorCodeRepository::new());
        let resource_manager = Arc::new(ResourceManagerImpl::new(
            &config,
            queue.clone(),
            Arc::new(PlainCipher),
        ));

        let deps = Collaborators {
            config: config.clone(),
            job_manager: job_manager.clone(),
            artifact_manager: artifact_manager.clone(),
            user_manager: user_manager.clone(),
            error_codes: error_codes.clone(),
            resource_manager: resource_manager.clone(),
            queue: queue.clone(),
            cipher: Arc::new(PlainCipher),
        };
        let launcher = Arc::new(JobLauncher::new(
            deps.clone(),
            LocalEventBus::new(EVENT_BUS_CAPACITY),
        ));
        let (reaper_shutdown, _) = broadcast::channel(1);

        Ok(Self {
            config,
            queue,
            job_manager,
            artifact_manager,
            user_manager,
            error_codes,
            resource_manager,
            deps,
            launcher,
            reaper_shutdown,
            reapers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Arc<QueenConfig> {
        &self.config
    }

    pub fn queue(&self) -> &Arc<InMemoryQueueClient> {
        &self.queue
    }

    pub fn job_manager(&self) -> &Arc<InMemoryJobManager> {
        &self.job_manager
    }

    pub fn artifact_manager(&self) -> &Arc<InMemoryArtifactManager> {
        &self.artifact_manager
    }

    pub fn user_manager(&self) -> &Arc<InMemoryUserManager> {
        &self.user_manager
    }

    pub fn error_codes(&self) -> &Arc<InMemoryErrorCodeRepository> {
        &self.error_codes
    }

    pub fn resource_manager(&self) -> &Arc<ResourceManagerImpl> {
        &self.resource_manager
    }

    /// 作业状态机使用的协作者集合
    pub fn collaborators(&self) -> Collaborators {
        self.deps.clone()
    }

    pub fn launcher(&self) -> &Arc<JobLauncher> {
        &self.launcher
    }

    /// 启动资源管理器订阅、清理任务和作业启动器
    pub async fn start(&self) -> Result<()> {
        self.resource_manager
            .start_subscriptions()
            .await
            .context("启动资源管理器订阅失败")?;
        let handles = self.resource_manager.start_reapers(&self.reaper_shutdown);
        self.reapers.lock().await.extend(handles);
        self.launcher.start().await.context("启动作业启动器失败")?;
        info!("编排服务器 {} 已启动", self.config.common.id);
        Ok(())
    }

    /// 先停作业启动器，让运行中的作业退回PENDING，再停资源管理和队列
    pub async fn stop(&self) -> Result<()> {
        info!("停止编排服务器");
        self.launcher.stop(JOB_SHUTDOWN_TIMEOUT).await;
        self.resource_manager.stop().await;

        let _ = self.reaper_shutdown.send(());
        let reapers: Vec<JoinHandle<()>> = self.reapers.lock().await.drain(..).collect();
        for result in join_all(reapers).await {
            if let Err(e) = result {
                warn!("清理任务退出异常: {}", e);
            }
        }

        self.queue.close().await.context("关闭队列失败")?;
        info!("编排服务器已停止");
        Ok(())
    }

    /// 启动后一直运行到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.start().await?;
        let _ = shutdown_rx.recv().await;
        info!("收到关闭信号");
        self.stop().await
    }
}
