use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::state::ResourceState;
use crate::metrics::{incr_counter, ALLOCATIONS_REAPED_TOTAL, ANTS_REAPED_TOTAL};

/// 周期性移除心跳超时的Ant
pub fn spawn_ant_reaper(
    state: Arc<RwLock<ResourceState>>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("启动过期Ant清理任务，间隔 {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = state.write().await.reap_stale_ants(Utc::now());
                    if !reaped.is_empty() {
                        info!("清理了 {} 个过期Ant: {:?}", reaped.len(), reaped);
                        incr_counter(ANTS_REAPED_TOTAL, reaped.len() as u64);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("过期Ant清理任务收到关闭信号");
                    break;
                }
            }
        }
    })
}

/// 周期性强制释放超过预留超时的分配
///
/// 预留超时必须大于任务的实际运行时长，否则仍在运行的作业会失去资源。
pub fn spawn_allocation_reaper(
    state: Arc<RwLock<ResourceState>>,
    interval: Duration,
    reservation_timeout: chrono::Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("启动过期分配清理任务，间隔 {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = state
                        .write()
                        .await
                        .reap_stale_allocations(Utc::now(), reservation_timeout);
                    for allocation in &reaped {
                        warn!(
                            request_id = allocation.job_request_id,
                            ant_id = %allocation.ant_id,
                            task_types = ?allocation.task_types,
                            "分配超过预留超时，已强制释放"
                        );
                    }
                    if !reaped.is_empty() {
                        incr_counter(ALLOCATIONS_REAPED_TOTAL, reaped.len() as u64);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("过期分配清理任务收到关闭信号");
                    break;
                }
            }
        }
    })
}
