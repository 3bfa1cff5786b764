use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use queen_core::config::{QueenConfig, ResourcesConfig, TopicsConfig};
use queen_core::models::{
    AntRegistration, AntReservation, ContainerLifecycleEvent, JobExecutionLifecycleEvent,
    PayloadCipher, QueueEvent, RequestState, TaskExecutionLifecycleEvent, TaskMethod, TaskRequest,
    TaskResponse,
};
use queen_core::traits::{headers, message_handler, QueueClient, QueueMessage, SubscribeOptions};
use queen_core::{QueenError, QueenResult};

use super::reaper::{spawn_allocation_reaper, spawn_ant_reaper};
use super::state::ResourceState;
use super::ResourceManager;

/// 新Ant上线后查询其运行中容器的等待时间
const LIST_CONTAINERS_TIMEOUT: Duration = Duration::from_secs(15);

/// 基于内存注册表的资源管理器
pub struct ResourceManagerImpl {
    state: Arc<RwLock<ResourceState>>,
    queue: Arc<dyn QueueClient>,
    cipher: Arc<dyn PayloadCipher>,
    server_id: String,
    topics: TopicsConfig,
    resources: ResourcesConfig,
    subscriptions: RwLock<Vec<String>>,
}

impl ResourceManagerImpl {
    pub fn new(config: &QueenConfig, queue: Arc<dyn QueueClient>, cipher: Arc<dyn PayloadCipher>) -> Self {
        Self {
            state: Arc::new(RwLock::new(ResourceState::new(
                config.resources.alive_timeout(),
                config.resources.max_container_events,
            ))),
            queue,
            cipher,
            server_id: config.common.id.clone(),
            topics: config.topics.clone(),
            resources: config.resources.clone(),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// 订阅Ant注册、生命周期和容器事件
    pub async fn start_subscriptions(self: &Arc<Self>) -> QueenResult<()> {
        let manager = Arc::clone(self);
        let registration_id = self
            .queue
            .subscribe(
                SubscribeOptions::exclusive(&self.topics.registration),
                message_handler(move |message: QueueMessage| {
                    let manager = Arc::clone(&manager);
                    async move {
                        let registration = AntRegistration::decode(&message.payload)?;
                        manager.register(registration).await.map(|_| ())
                    }
                }),
            )
            .await?;

        let manager = Arc::clone(self);
        let job_lifecycle_id = self
            .queue
            .subscribe(
                SubscribeOptions::exclusive(&self.topics.job_lifecycle),
                message_handler(move |message: QueueMessage| {
                    let manager = Arc::clone(&manager);
                    async move {
                        let event = JobExecutionLifecycleEvent::decode(&message.payload)?;
                        if event.job_state.is_terminal() {
                            manager.release_job(event.job_request_id).await?;
                        }
                        Ok(())
                    }
                }),
            )
            .await?;

        let manager = Arc::clone(self);
        let task_lifecycle_id = self
            .queue
            .subscribe(
                SubscribeOptions::exclusive(&self.topics.task_lifecycle),
                message_handler(move |message: QueueMessage| {
                    let manager = Arc::clone(&manager);
                    async move {
                        let event = TaskExecutionLifecycleEvent::decode(&message.payload)?;
                        if event.task_state == RequestState::Completed && !event.ant_id.is_empty() {
                            manager
                                .release(event.job_request_id, &event.ant_id, &event.task_type)
                                .await?;
                        }
                        Ok(())
                    }
                }),
            )
            .await?;

        let state = Arc::clone(&self.state);
        let container_id = self
            .queue
            .subscribe(
                SubscribeOptions::exclusive(&self.topics.container_lifecycle),
                message_handler(move |message: QueueMessage| {
                    let state = Arc::clone(&state);
                    async move {
                        let event = ContainerLifecycleEvent::decode(&message.payload)?;
                        state.write().await.record_container_event(event);
                        Ok(())
                    }
                }),
            )
            .await?;

        self.subscriptions.write().await.extend([
            registration_id,
            job_lifecycle_id,
            task_lifecycle_id,
            container_id,
        ]);
        info!("资源管理器订阅已启动");
        Ok(())
    }

    /// 启动过期Ant和过期分配两个清理任务
    pub fn start_reapers(&self, shutdown_tx: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        vec![
            spawn_ant_reaper(
                Arc::clone(&self.state),
                self.resources.registration_reaper_interval(),
                shutdown_tx.subscribe(),
            ),
            spawn_allocation_reaper(
                Arc::clone(&self.state),
                self.resources.allocation_reaper_interval(),
                self.resources.reservation_timeout(),
                shutdown_tx.subscribe(),
            ),
        ]
    }

    pub async fn stop(&self) {
        let subscriptions: Vec<String> = self.subscriptions.write().await.drain(..).collect();
        for id in subscriptions {
            if let Err(e) = self.queue.unsubscribe(&id).await {
                warn!("取消订阅 {} 失败: {}", id, e);
            }
        }
        info!("资源管理器已停止");
    }
}

/// 向新上线的Ant查询正在运行的容器，返回记录的容器数
async fn list_containers(
    state: Arc<RwLock<ResourceState>>,
    queue: Arc<dyn QueueClient>,
    cipher: Arc<dyn PayloadCipher>,
    server_id: String,
    reply_topic: String,
    registration: AntRegistration,
) -> QueenResult<usize> {
    let request = TaskRequest::list(&registration.ant_id);
    let payload = request.marshal(cipher.as_ref(), &registration.encryption_key)?;
    let message = QueueMessage::new(payload).with_header(headers::SOURCE, &server_id);

    let reply = tokio::time::timeout(
        LIST_CONTAINERS_TIMEOUT,
        queue.send_receive(&registration.ant_topic, message, &reply_topic),
    )
    .await
    .map_err(|_| QueenError::Timeout(format!("查询Ant {} 的容器超时", registration.ant_id)))??;

    let response = TaskResponse::unmarshal(cipher.as_ref(), &registration.encryption_key, &reply.payload)?;
    let count = response.containers.len();
    let mut state = state.write().await;
    for container in response.containers {
        state.record_container_event(container);
    }
    Ok(count)
}

#[async_trait]
impl ResourceManager for ResourceManagerImpl {
    async fn register(&self, registration: AntRegistration) -> QueenResult<bool> {
        let ant_id = registration.ant_id.clone();
        let is_new = self
            .state
            .write()
            .await
            .register(registration.clone(), Utc::now())?;
        if is_new {
            info!(
                ant_id = %ant_id,
                methods = ?registration.methods,
                tags = ?registration.tags,
                capacity = registration.max_capacity,
                "新Ant已注册"
            );
            // 网络调用放在锁外的独立任务里
            let sync = list_containers(
                Arc::clone(&self.state),
                Arc::clone(&self.queue),
                Arc::clone(&self.cipher),
                self.server_id.clone(),
                self.topics.task_reply_topic(&self.server_id),
                registration,
            );
            tokio::spawn(async move {
                match sync.await {
                    Ok(count) => debug!(ant_id = %ant_id, count, "已同步Ant上的容器"),
                    Err(e) => warn!(ant_id = %ant_id, "查询Ant容器失败: {}", e),
                }
            });
        } else {
            debug!(ant_id = %ant_id, "Ant心跳已刷新");
        }
        Ok(is_new)
    }

    async fn registration(&self, ant_id: &str) -> Option<AntRegistration> {
        self.state.read().await.registration(ant_id).cloned()
    }

    async fn registrations(&self) -> Vec<AntRegistration> {
        self.state.read().await.registrations()
    }

    async fn has_ants_for_job_tags(
        &self,
        requirements: &[(TaskMethod, Vec<String>)],
    ) -> QueenResult<()> {
        self.state.read().await.has_ants_for_job_tags(requirements)
    }

    async fn reserve(
        &self,
        request_id: u64,
        task_type: &str,
        method: TaskMethod,
        tags: &[String],
        dry_run: bool,
    ) -> QueenResult<AntReservation> {
        let result = self
            .state
            .write()
            .await
            .reserve(request_id, task_type, method, tags, dry_run);
        match &result {
            Ok(reservation) => debug!(
                request_id,
                task_type,
                ant_id = %reservation.ant_id,
                dry_run,
                "已预留Ant: {}",
                reservation
            ),
            Err(e) => {
                crate::metrics::incr_counter(crate::metrics::RESERVATION_FAILED_TOTAL, 1);
                debug!(request_id, task_type, "预留Ant失败: {}", e);
            }
        }
        result
    }

    async fn release(&self, request_id: u64, ant_id: &str, task_type: &str) -> QueenResult<()> {
        let released = self
            .state
            .write()
            .await
            .release(request_id, ant_id, task_type);
        if released {
            debug!(request_id, ant_id, task_type, "已释放Ant分配");
        }
        Ok(())
    }

    async fn release_job(&self, request_id: u64) -> QueenResult<()> {
        let released = self.state.write().await.release_job(request_id);
        if released > 0 {
            debug!(request_id, released, "已释放作业的全部分配");
        }
        Ok(())
    }

    async fn container_events(&self, request_id: u64) -> Vec<ContainerLifecycleEvent> {
        self.state.read().await.container_events(request_id)
    }
}
