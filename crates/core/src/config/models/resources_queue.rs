use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 资源管理器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// 超过该时间没有心跳的Ant被清除
    pub ant_registration_alive_timeout_secs: u64,
    /// 超过该时间的分配会被强制释放，必须大于任务的实际运行时长
    pub ant_reservation_timeout_secs: u64,
    pub max_container_events: usize,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            ant_registration_alive_timeout_secs: 300,
            ant_reservation_timeout_secs: 3600,
            max_container_events: 500,
        }
    }
}

fn half_of(secs: u64) -> Duration {
    Duration::from_secs((secs / 2).max(1))
}

impl ResourcesConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ant_registration_alive_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Ant存活超时必须大于0"));
        }
        if self.ant_reservation_timeout_secs == 0 {
            return Err(anyhow::anyhow!("预留超时必须大于0"));
        }
        if self.max_container_events == 0 {
            return Err(anyhow::anyhow!("容器事件缓存大小必须大于0"));
        }
        Ok(())
    }

    pub fn alive_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ant_registration_alive_timeout_secs as i64)
    }

    pub fn reservation_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ant_reservation_timeout_secs as i64)
    }

    pub fn registration_reaper_interval(&self) -> Duration {
        half_of(self.ant_registration_alive_timeout_secs)
    }

    pub fn allocation_reaper_interval(&self) -> Duration {
        half_of(self.ant_reservation_timeout_secs)
    }
}

/// 内存队列客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 处理失败的消息最多重新投递的次数
    pub max_redeliveries: u32,
    pub redelivery_delay_ms: u64,
    pub channel_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: 3,
            redelivery_delay_ms: 100,
            channel_capacity: 1024,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channel_capacity == 0 {
            return Err(anyhow::anyhow!("队列通道容量必须大于0"));
        }
        Ok(())
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reaper_intervals_are_half_the_timeouts() {
        let config = ResourcesConfig {
            ant_registration_alive_timeout_secs: 60,
            ant_reservation_timeout_secs: 1,
            max_container_events: 10,
        };
        assert_eq!(config.registration_reaper_interval(), Duration::from_secs(30));
        assert_eq!(config.allocation_reaper_interval(), Duration::from_secs(1));
    }
}
