use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 服务器通用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    /// 服务器ID，默认取主机名
    pub id: String,
    pub max_job_timeout_secs: u64,
    pub max_task_timeout_secs: u64,
    pub subscription_quota_enabled: bool,
    /// 作业心跳（刷新时间戳、检查配额）的间隔
    pub job_status_update_interval_secs: u64,
}

pub(crate) fn default_server_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "queen-server".to_string())
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            id: default_server_id(),
            max_job_timeout_secs: 3600,
            max_task_timeout_secs: 1800,
            subscription_quota_enabled: false,
            job_status_update_interval_secs: 30,
        }
    }
}

impl CommonConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.trim().is_empty() {
            return Err(anyhow::anyhow!("服务器ID不能为空"));
        }
        if self.job_status_update_interval_secs == 0 {
            return Err(anyhow::anyhow!("作业状态更新间隔必须大于0"));
        }
        Ok(())
    }

    pub fn max_job_timeout(&self) -> Duration {
        Duration::from_secs(self.max_job_timeout_secs)
    }

    pub fn max_task_timeout(&self) -> Duration {
        Duration::from_secs(self.max_task_timeout_secs)
    }

    pub fn job_status_update_interval(&self) -> Duration {
        Duration::from_secs(self.job_status_update_interval_secs)
    }
}

/// 消息主题名称
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub registration: String,
    pub job_launch: String,
    /// 启动事件的共享订阅组，同组内只有一个启动器收到
    pub job_launch_group: String,
    pub job_lifecycle: String,
    pub task_lifecycle: String,
    pub container_lifecycle: String,
    pub task_reply_prefix: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            registration: "queen-ant-registration".to_string(),
            job_launch: "queen-job-launch".to_string(),
            job_launch_group: "queen-launchers".to_string(),
            job_lifecycle: "queen-job-lifecycle".to_string(),
            task_lifecycle: "queen-task-lifecycle".to_string(),
            container_lifecycle: "queen-container-lifecycle".to_string(),
            task_reply_prefix: "queen-task-reply".to_string(),
        }
    }
}

impl TopicsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let topics = [
            ("registration", &self.registration),
            ("job_launch", &self.job_launch),
            ("job_launch_group", &self.job_launch_group),
            ("job_lifecycle", &self.job_lifecycle),
            ("task_lifecycle", &self.task_lifecycle),
            ("container_lifecycle", &self.container_lifecycle),
            ("task_reply_prefix", &self.task_reply_prefix),
        ];
        for (name, topic) in topics {
            if topic.trim().is_empty() {
                return Err(anyhow::anyhow!("主题 {} 不能为空", name));
            }
        }
        Ok(())
    }

    /// 某个服务器接收任务响应的主题
    pub fn task_reply_topic(&self, server_id: &str) -> String {
        format!("{}-{}", self.task_reply_prefix, server_id)
    }
}
