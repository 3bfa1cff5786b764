use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use queen_core::models::{JobExecutionLaunchEvent, JobExecutionLifecycleEvent, QueueEvent};
use queen_core::traits::{message_handler, QueueMessage, SubscribeOptions};
use queen_core::QueenResult;
use queen_infrastructure::LocalEventBus;

use crate::fsm::{Collaborators, JobExecutionStateMachine};
use crate::metrics::{incr_job_counter, LAUNCHER_FAILED_TOTAL, LAUNCHER_REQUEUED_TOTAL};
use crate::supervisor::{CancelReason, ExecutionContext, JobSupervisor};

/// 消费启动事件，为每个作业请求启动一个作业监督
pub struct JobLauncher {
    deps: Collaborators,
    supervisor: JobSupervisor,
    event_bus: LocalEventBus<JobExecutionLifecycleEvent>,
    /// 所有作业监督的根上下文，关闭时以Shutdown取消
    root: ExecutionContext,
    processing: Arc<RwLock<HashMap<u64, JoinHandle<()>>>>,
    subscriptions: RwLock<Vec<String>>,
}

impl JobLauncher {
    pub fn new(deps: Collaborators, event_bus: LocalEventBus<JobExecutionLifecycleEvent>) -> Self {
        let supervisor = JobSupervisor::new(event_bus.clone(), &deps.config.topics.job_lifecycle);
        Self {
            deps,
            supervisor,
            event_bus,
            root: ExecutionContext::new(),
            processing: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn event_bus(&self) -> &LocalEventBus<JobExecutionLifecycleEvent> {
        &self.event_bus
    }

    /// 订阅共享启动主题，并把队列上的作业生命周期事件转发到进程内总线
    pub async fn start(self: &Arc<Self>) -> QueenResult<()> {
        let topics = &self.deps.config.topics;

        let launcher = Arc::clone(self);
        let launch_id = self
            .deps
            .queue
            .subscribe(
                SubscribeOptions::shared(&topics.job_launch, &topics.job_launch_group),
                message_handler(move |message: QueueMessage| {
                    let launcher = Arc::clone(&launcher);
                    async move {
                        let event = JobExecutionLaunchEvent::decode(&message.payload)?;
                        launcher.launch(event).await
                    }
                }),
            )
            .await?;

        let event_bus = self.event_bus.clone();
        let lifecycle_topic = topics.job_lifecycle.clone();
        let lifecycle_id = self
            .deps
            .queue
            .subscribe(
                SubscribeOptions::exclusive(&topics.job_lifecycle),
                message_handler(move |message: QueueMessage| {
                    let event_bus = event_bus.clone();
                    let lifecycle_topic = lifecycle_topic.clone();
                    async move {
                        let event = JobExecutionLifecycleEvent::decode(&message.payload)?;
                        event_bus.publish(&lifecycle_topic, event).await;
                        Ok(())
                    }
                }),
            )
            .await?;

        self.subscriptions
            .write()
            .await
            .extend([launch_id, lifecycle_id]);
        info!("作业启动器已启动，启动主题 {}", topics.job_launch);
        Ok(())
    }

    /// 处理一个启动事件
    ///
    /// 预留不齐全时请求退回PENDING，其他启动错误直接把作业置为FAILED。
    /// 只有加载作业请求失败时返回错误，交给队列重新投递。
    pub async fn launch(&self, event: JobExecutionLaunchEvent) -> QueenResult<()> {
        let request_id = event.job_request_id;
        if self.is_processing(request_id).await {
            warn!(request_id, "作业已在执行中，忽略重复的启动事件");
            return Ok(());
        }

        let request = self.deps.job_manager.get_job_request(request_id).await?;
        let mut jsm = JobExecutionStateMachine::new(self.deps.clone(), request);
        let prepared = match jsm.validate().await {
            Ok(()) => {
                jsm.prepare_launch(&event.job_execution_id, event.reservations)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = prepared {
            if e.is_requeue() {
                warn!(request_id, "启动条件不满足，作业请求退回PENDING: {}", e);
                jsm.revert_request_to_pending(&e.to_string()).await?;
                incr_job_counter(LAUNCHER_REQUEUED_TOTAL, &event.job_type);
            } else {
                error!(request_id, "作业启动失败: {}", e);
                jsm.launch_failed(&e).await?;
                incr_job_counter(LAUNCHER_FAILED_TOTAL, &event.job_type);
            }
            return Ok(());
        }

        self.spawn_supervisor(jsm).await;
        Ok(())
    }

    async fn spawn_supervisor(&self, jsm: JobExecutionStateMachine) {
        let request_id = jsm.request.id;
        let supervisor = self.supervisor.clone();
        let ctx = self.root.child_with_timeout(None);
        let processing = Arc::clone(&self.processing);

        // 持有写锁直到登记完成，避免作业先结束再登记
        let mut running = self.processing.write().await;
        let handle = tokio::spawn(async move {
            match supervisor.run(jsm, &ctx).await {
                Ok(state) => info!(request_id, state = %state, "作业监督结束"),
                Err(e) => error!(request_id, "作业监督出错: {}", e),
            }
            processing.write().await.remove(&request_id);
        });
        running.insert(request_id, handle);
        debug!(request_id, "作业监督已启动");
    }

    pub async fn is_processing(&self, request_id: u64) -> bool {
        self.processing
            .read()
            .await
            .get(&request_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// 正在执行的作业数量
    pub async fn count_processing_jobs(&self) -> usize {
        self.processing
            .read()
            .await
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// 退订并以Shutdown取消所有作业，等待它们把请求退回PENDING
    pub async fn stop(&self, timeout: Duration) {
        for subscription_id in self.subscriptions.write().await.drain(..) {
            if let Err(e) = self.deps.queue.unsubscribe(&subscription_id).await {
                warn!("退订启动器主题失败: {}", e);
            }
        }

        self.root.cancel(CancelReason::Shutdown);
        let handles: Vec<JoinHandle<()>> = self
            .processing
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let count = handles.len();
        if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
            warn!("等待 {} 个作业结束超时", count);
        }
        info!("作业启动器已停止");
    }
}
