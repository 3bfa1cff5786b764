use serde_json::{json, Value};
use std::collections::HashMap;

use queen_core::models::{JobDefinition, JobExecution, JobRequest, Organization, TaskDefinition};

pub const PARAM_JOB_ID: &str = "JobID";
pub const PARAM_JOB_TYPE: &str = "JobType";
pub const PARAM_JOB_RETRY: &str = "JobRetry";
pub const PARAM_JOB_ELAPSED_SECS: &str = "JobElapsedSecs";

/// 合并渲染任务与过滤条件所用的动态参数
///
/// 优先级从低到高：组织配置、作业模板配置、固定标识、作业模板变量、
/// 任务变量、请求参数、之前任务累积的执行上下文。
pub fn build_dynamic_params(
    organization: Option<&Organization>,
    definition: &JobDefinition,
    request: &JobRequest,
    execution: Option<&JobExecution>,
    task: Option<&TaskDefinition>,
) -> HashMap<String, Value> {
    let mut params = HashMap::new();
    if let Some(organization) = organization {
        params.extend(organization.configs.clone());
    }
    params.extend(definition.configs.clone());

    params.insert(PARAM_JOB_ID.to_string(), json!(request.id));
    params.insert(PARAM_JOB_TYPE.to_string(), json!(request.job_type));
    params.insert(PARAM_JOB_RETRY.to_string(), json!(request.retried));
    params.insert(
        PARAM_JOB_ELAPSED_SECS.to_string(),
        json!(execution.map(|e| e.elapsed_secs()).unwrap_or(0)),
    );

    params.extend(definition.variables.clone());
    if let Some(task) = task {
        params.extend(task.variables.clone());
    }
    params.extend(request.params.clone());
    if let Some(execution) = execution {
        params.extend(execution.contexts.clone());
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use queen_core::models::TaskMethod;

    #[test]
    fn test_later_sources_override_earlier() {
        let mut organization = Organization::default();
        organization.configs.insert("Region".into(), json!("org"));
        organization.configs.insert("Registry".into(), json!("org-registry"));

        let mut task = TaskDefinition::new("compile", TaskMethod::Docker);
        task.variables.insert("Target".into(), json!("task"));
        let mut definition = JobDefinition::new("build", vec![task.clone()]);
        definition.configs.insert("Region".into(), json!("definition"));
        definition.variables.insert("Target".into(), json!("definition"));
        definition.variables.insert("JobType".into(), json!("overridden"));

        let request = JobRequest::new(42, &definition.id, "build").with_param("Target", json!("request"));
        let mut execution = JobExecution::new(&request);
        execution.add_context("Target", json!("context"));

        let without_context = build_dynamic_params(
            Some(&organization),
            &definition,
            &request,
            None,
            Some(&task),
        );
        assert_eq!(without_context["Region"], json!("definition"));
        assert_eq!(without_context["Registry"], json!("org-registry"));
        assert_eq!(without_context["Target"], json!("request"));
        assert_eq!(without_context["JobID"], json!(42));
        assert_eq!(without_context["JobType"], json!("overridden"));

        let with_context = build_dynamic_params(
            Some(&organization),
            &definition,
            &request,
            Some(&execution),
            Some(&task),
        );
        assert_eq!(with_context["Target"], json!("context"));
    }
}
