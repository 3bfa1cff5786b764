use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::common_topics::{default_server_id, CommonConfig, TopicsConfig};
use super::observability::ObservabilityConfig;
use super::resources_queue::{QueueConfig, ResourcesConfig};

/// 编排服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QueenConfig {
    pub common: CommonConfig,
    pub topics: TopicsConfig,
    pub resources: ResourcesConfig,
    pub queue: QueueConfig,
    pub observability: ObservabilityConfig,
}

impl QueenConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 优先级从低到高：
    /// 1. 内置默认值
    /// 2. 配置文件（TOML）
    /// 3. 环境变量（前缀 `QUEEN_`，层级用 `__` 分隔，例如 `QUEEN_COMMON__ID`）
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = QueenConfig::default();
        let mut builder = ConfigBuilder::builder()
            .set_default("common.id", default_server_id())?
            .set_default(
                "common.max_job_timeout_secs",
                defaults.common.max_job_timeout_secs as i64,
            )?
            .set_default(
                "common.max_task_timeout_secs",
                defaults.common.max_task_timeout_secs as i64,
            )?
            .set_default(
                "common.subscription_quota_enabled",
                defaults.common.subscription_quota_enabled,
            )?
            .set_default(
                "common.job_status_update_interval_secs",
                defaults.common.job_status_update_interval_secs as i64,
            )?
            .set_default("topics.registration", defaults.topics.registration.clone())?
            .set_default("topics.job_launch", defaults.topics.job_launch.clone())?
            .set_default(
                "topics.job_launch_group",
                defaults.topics.job_launch_group.clone(),
            )?
            .set_default("topics.job_lifecycle", defaults.topics.job_lifecycle.clone())?
            .set_default("topics.task_lifecycle", defaults.topics.task_lifecycle.clone())?
            .set_default(
                "topics.container_lifecycle",
                defaults.topics.container_lifecycle.clone(),
            )?
            .set_default(
                "topics.task_reply_prefix",
                defaults.topics.task_reply_prefix.clone(),
            )?
            .set_default(
                "resources.ant_registration_alive_timeout_secs",
                defaults.resources.ant_registration_alive_timeout_secs as i64,
            )?
            .set_default(
                "resources.ant_reservation_timeout_secs",
                defaults.resources.ant_reservation_timeout_secs as i64,
            )?
            .set_default(
                "resources.max_container_events",
                defaults.resources.max_container_events as i64,
            )?
            .set_default(
                "queue.max_redeliveries",
                defaults.queue.max_redeliveries as i64,
            )?
            .set_default(
                "queue.redelivery_delay_ms",
                defaults.queue.redelivery_delay_ms as i64,
            )?
            .set_default(
                "queue.channel_capacity",
                defaults.queue.channel_capacity as i64,
            )?
            .set_default("observability.log_level", defaults.observability.log_level.clone())?
            .set_default(
                "observability.log_format",
                defaults.observability.log_format.clone(),
            )?
            .set_default(
                "observability.metrics_enabled",
                defaults.observability.metrics_enabled,
            )?
            .set_default(
                "observability.metrics_bind_address",
                defaults.observability.metrics_bind_address.clone(),
            )?;

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("QUEEN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: QueenConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: QueenConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.common.validate().context("通用配置验证失败")?;
        self.topics.validate().context("主题配置验证失败")?;
        self.resources.validate().context("资源配置验证失败")?;
        self.queue.validate().context("队列配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}
