use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::ant::TaskMethod;
use super::error_code::{ERR_FATAL, ERR_PAUSE_JOB, ERR_RESTART_JOB, ERR_RESTART_TASK};
use super::state::RequestState;
use super::template::render_template;
use crate::{QueenError, QueenResult};

/// 退出码路由中保留的目标，不指向具体任务
const RESERVED_TARGETS: [&str; 7] = [
    "FATAL",
    "RESTART_JOB",
    "PAUSE_JOB",
    "RESTART_TASK",
    "EXECUTING",
    "FAILED",
    "COMPLETED",
];

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_uppercase()
}

/// 任务模板：作业任务图中的一个节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskDefinition {
    pub task_type: String,
    #[serde(default)]
    pub method: TaskMethod,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub before_script: Vec<String>,
    #[serde(default)]
    pub script: Vec<String>,
    #[serde(default)]
    pub after_script: Vec<String>,
    #[serde(default)]
    pub container_image: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// 退出码或任务状态 -> 下一个任务类型或保留目标
    #[serde(default)]
    pub on_exit_code: HashMap<String, String>,
    #[serde(default)]
    pub on_completed: String,
    #[serde(default)]
    pub on_failed: String,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub always_run: bool,
    /// 渲染后包含 "true" 时跳过执行
    #[serde(default)]
    pub except: String,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub delay_between_retries_ms: u64,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub artifact_ids: Vec<String>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub fork_job_type: String,
    #[serde(default)]
    pub job_version: String,
}

impl TaskDefinition {
    pub fn new(task_type: &str, method: TaskMethod) -> Self {
        Self {
            task_type: task_type.to_string(),
            method,
            ..Default::default()
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_script(mut self, script: &[&str]) -> Self {
        self.script = script.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn on_completed(mut self, next: &str) -> Self {
        self.on_exit_code
            .insert(RequestState::Completed.as_str().to_string(), next.to_string());
        self
    }

    pub fn on_failed(mut self, next: &str) -> Self {
        self.on_exit_code
            .insert(RequestState::Failed.as_str().to_string(), next.to_string());
        self
    }

    pub fn on_exit(mut self, exit_code: &str, next: &str) -> Self {
        self.on_exit_code
            .insert(normalize_key(exit_code), next.to_string());
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn has_next(&self) -> bool {
        !self.on_exit_code.is_empty()
    }

    pub fn is_except(&self) -> bool {
        self.except.contains("true")
    }

    /// 退出码被路由到 FATAL 时视为致命错误
    pub fn is_fatal_error(&self, exit_code: &str) -> bool {
        self.on_exit_code
            .get(&normalize_key(exit_code))
            .map(|target| normalize_key(target) == RequestState::Fatal.as_str())
            .unwrap_or(false)
    }

    /// 未配置时在 1-2 秒之间随机取值
    pub fn delay_between_retries(&self) -> Duration {
        if self.delay_between_retries_ms > 0 {
            Duration::from_millis(self.delay_between_retries_ms)
        } else {
            Duration::from_secs(rand::rng().random_range(1..=2))
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// 任务类型的前8个字符中的字母，用于拼接容器名
    pub fn short_task_type(&self) -> String {
        self.task_type
            .chars()
            .take(8)
            .filter(|c| c.is_ascii_alphabetic())
            .collect()
    }

    /// 根据退出码映射表覆盖任务状态和错误码
    pub fn override_status_and_error_code(
        &self,
        exit_code: &str,
    ) -> Option<(RequestState, Option<String>)> {
        let target = self.on_exit_code.get(&normalize_key(exit_code))?;
        match normalize_key(target).as_str() {
            "FATAL" => Some((RequestState::Failed, Some(ERR_FATAL.to_string()))),
            "FAILED" => Some((RequestState::Failed, None)),
            "COMPLETED" => Some((RequestState::Completed, None)),
            "EXECUTING" => Some((RequestState::Executing, None)),
            "RESTART_JOB" => Some((RequestState::Failed, Some(ERR_RESTART_JOB.to_string()))),
            "PAUSE_JOB" => Some((RequestState::Paused, Some(ERR_PAUSE_JOB.to_string()))),
            "RESTART_TASK" => Some((RequestState::Failed, Some(ERR_RESTART_TASK.to_string()))),
            code if code.starts_with("ERR_") => Some((RequestState::Failed, Some(target.clone()))),
            _ => None,
        }
    }

    /// 用动态参数渲染脚本、环境变量和跳过条件
    pub fn resolve(&self, params: &HashMap<String, Value>) -> TaskDefinition {
        let render_all = |lines: &[String]| -> Vec<String> {
            lines.iter().map(|l| render_template(l, params)).collect()
        };
        let mut resolved = self.clone();
        resolved.before_script = render_all(&self.before_script);
        resolved.script = render_all(&self.script);
        resolved.after_script = render_all(&self.after_script);
        resolved.except = render_template(&self.except, params);
        resolved.container_image = render_template(&self.container_image, params);
        resolved.environment = self
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), render_template(v, params)))
            .collect();
        resolved
    }

    pub fn validate(&self) -> QueenResult<()> {
        if self.task_type.trim().is_empty() {
            return Err(QueenError::validation("任务类型不能为空"));
        }
        if self.dependencies.iter().any(|d| d == &self.task_type) {
            return Err(QueenError::validation(format!(
                "任务 {} 不能依赖自身",
                self.task_type
            )));
        }
        Ok(())
    }
}

/// 作业图遍历时的下一步
#[derive(Debug, Clone, PartialEq)]
pub enum NextTask<'a> {
    /// 继续执行该任务
    Task(&'a TaskDefinition),
    /// 退出码路由到 `EXECUTING`，同一个任务再跑一次
    Rerun(&'a TaskDefinition),
    /// 没有后继任务
    End,
}

/// 作业模板
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobDefinition {
    pub id: String,
    pub job_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub public_plugin: bool,
    #[serde(default)]
    pub platform: String,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub hard_reset_after_retries: u32,
    #[serde(default)]
    pub delay_between_retries_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub timeout_secs: u64,
    /// 渲染后等于 "true" 时不调度该作业
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub cron_trigger: String,
    #[serde(default)]
    pub configs: HashMap<String, Value>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

fn default_max_concurrency() -> usize {
    1
}

impl JobDefinition {
    pub fn new(job_type: &str, tasks: Vec<TaskDefinition>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            tasks,
            max_concurrency: default_max_concurrency(),
            ..Default::default()
        }
    }

    /// 校验并规范化退出码路由
    pub fn validate(&mut self) -> QueenResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(QueenError::validation("作业类型不能为空"));
        }
        if self.tasks.is_empty() {
            return Err(QueenError::validation(format!(
                "作业 {} 没有定义任务",
                self.job_type
            )));
        }
        if self.max_concurrency == 0 {
            self.max_concurrency = 1;
        }
        let mut seen = HashSet::new();
        for task in self.tasks.iter_mut() {
            task.validate()?;
            if !seen.insert(task.task_type.clone()) {
                return Err(QueenError::validation(format!(
                    "重复的任务类型: {}",
                    task.task_type
                )));
            }
            task.on_exit_code = task
                .on_exit_code
                .drain()
                .map(|(k, v)| (normalize_key(&k), v))
                .collect();
            if !task.on_completed.is_empty() {
                task.on_exit_code
                    .insert("COMPLETED".to_string(), task.on_completed.clone());
            }
            if !task.on_failed.is_empty() {
                task.on_exit_code
                    .insert("FAILED".to_string(), task.on_failed.clone());
            }
            // 允许失败的任务在失败后沿着成功路径继续
            if task.allow_failure && !task.on_exit_code.contains_key("FAILED") {
                if let Some(next) = task.on_exit_code.get("COMPLETED").cloned() {
                    task.on_exit_code.insert("FAILED".to_string(), next);
                }
            }
        }
        self.reachable_targets()?;
        Ok(())
    }

    pub fn get_task(&self, task_type: &str) -> Option<&TaskDefinition> {
        if task_type.is_empty() {
            return None;
        }
        self.tasks.iter().find(|t| t.task_type == task_type)
    }

    /// 每个任务需要的执行方式和标签组合（去重，保持顺序）
    ///
    /// 不同任务的标签不会同时使用，背压检查按任务逐个匹配，不能合并成并集。
    pub fn task_requirements(&self) -> Vec<(TaskMethod, Vec<String>)> {
        let mut requirements: Vec<(TaskMethod, Vec<String>)> = Vec::new();
        for task in &self.tasks {
            let mut tags: Vec<String> = task
                .tags
                .iter()
                .filter(|t| !t.trim().is_empty())
                .cloned()
                .collect();
            tags.sort();
            tags.dedup();
            let requirement = (task.method, tags);
            if !requirements.contains(&requirement) {
                requirements.push(requirement);
            }
        }
        requirements
    }

    pub fn always_run_tasks(&self) -> Vec<&TaskDefinition> {
        self.tasks.iter().filter(|t| t.always_run).collect()
    }

    /// 未配置时在 5-14 秒之间随机取值
    pub fn delay_between_retries(&self) -> Duration {
        if self.delay_between_retries_ms > 0 {
            Duration::from_millis(self.delay_between_retries_ms)
        } else {
            Duration::from_secs(rand::rng().random_range(5..15))
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// 渲染过滤条件，结果为 "true" 时作业应被过滤
    pub fn filtered(&self, params: &HashMap<String, Value>) -> bool {
        if self.filter.trim().is_empty() {
            return false;
        }
        render_template(&self.filter, params).trim() == "true"
    }

    /// 收集所有被退出码路由引用的任务类型
    fn reachable_targets(&self) -> QueenResult<HashSet<String>> {
        let mut targets = HashSet::new();
        for task in &self.tasks {
            for next in task.on_exit_code.values() {
                if next.trim().is_empty() {
                    return Err(QueenError::validation(format!(
                        "任务 {} 的退出码路由目标为空",
                        task.task_type
                    )));
                }
                let upper = normalize_key(next);
                if upper.starts_with("ERR_") || RESERVED_TARGETS.contains(&upper.as_str()) {
                    continue;
                }
                if self.get_task(next).is_none() {
                    return Err(QueenError::validation(format!(
                        "任务 {} 的退出码路由指向未定义的任务 {}",
                        task.task_type, next
                    )));
                }
                targets.insert(next.clone());
            }
        }
        Ok(targets)
    }

    /// 第一个任务：唯一一个不被任何路由引用的任务（always_run 任务除外）
    pub fn first_task(&self) -> QueenResult<&TaskDefinition> {
        let targets = self.reachable_targets()?;
        let mut first: Option<&TaskDefinition> = None;
        for task in &self.tasks {
            if targets.contains(&task.task_type) {
                continue;
            }
            if first.is_none() && (self.tasks.len() == 1 || task.has_next()) {
                first = Some(task);
            } else if !task.always_run {
                return Err(QueenError::validation(format!(
                    "任务 {} 不可达，作业 {}",
                    task.task_type, self.job_type
                )));
            }
        }
        first.ok_or_else(|| {
            QueenError::validation(format!("作业 {} 找不到第一个任务", self.job_type))
        })
    }

    /// 根据退出码和任务状态计算后继任务
    pub fn next_task<'a>(
        &'a self,
        task: &'a TaskDefinition,
        state: RequestState,
        exit_code: &str,
    ) -> NextTask<'a> {
        if task.on_exit_code.is_empty() {
            return NextTask::End;
        }
        let lookup = |key: &str| -> String {
            task.on_exit_code
                .get(key)
                .cloned()
                .unwrap_or_default()
        };

        let mut next_name = lookup(&normalize_key(exit_code));
        match normalize_key(&next_name).as_str() {
            "EXECUTING" if !state.is_failed() => return NextTask::Rerun(task),
            "PAUSE_JOB" | "PAUSED" => next_name = lookup("PAUSE_JOB"),
            "COMPLETED" => next_name = lookup("COMPLETED"),
            "FAILED" | "FATAL" => next_name = lookup("FAILED"),
            _ => {}
        }
        if let Some(next) = self.get_task(&next_name) {
            return NextTask::Task(next);
        }
        if let Some(next) = self.get_task(&lookup(state.as_str())) {
            return NextTask::Task(next);
        }
        if task.allow_failure {
            if let Some(next) = self.get_task(&lookup("COMPLETED")) {
                return NextTask::Task(next);
            }
        }
        NextTask::End
    }
}
