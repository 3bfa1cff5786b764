//! 编排引擎的指标名称与记录函数

pub const JOB_COMPLETED_TOTAL: &str = "job_completed_total";
pub const JOB_FAILED_TOTAL: &str = "job_failed_total";
pub const JOB_CANCELLED_TOTAL: &str = "job_cancelled_total";
pub const JOB_PAUSED_TOTAL: &str = "job_paused_total";
pub const JOB_REVERTED_TO_PENDING_TOTAL: &str = "job_reverted_to_pending_total";
pub const JOB_RESTARTED_TOTAL: &str = "job_restarted_total";
pub const JOB_COMPLETED_SECS: &str = "job_completed_secs";
pub const TASK_COMPLETED_TOTAL: &str = "task_completed_total";
pub const TASK_FAILED_TOTAL: &str = "task_failed_total";
pub const LAUNCHER_REQUEUED_TOTAL: &str = "launcher_requeued_total";
pub const LAUNCHER_FAILED_TOTAL: &str = "launcher_failed_total";
pub const ANTS_REAPED_TOTAL: &str = "ants_reaped_total";
pub const ALLOCATIONS_REAPED_TOTAL: &str = "allocations_reaped_total";
pub const RESERVATION_FAILED_TOTAL: &str = "reservation_failed_total";

/// 注册指标说明，导出器安装后调用一次
pub fn describe_metrics() {
    metrics::describe_counter!(JOB_COMPLETED_TOTAL, "成功完成的作业数");
    metrics::describe_counter!(JOB_FAILED_TOTAL, "失败的作业数");
    metrics::describe_counter!(JOB_CANCELLED_TOTAL, "被取消的作业数");
    metrics::describe_counter!(JOB_PAUSED_TOTAL, "被暂停的作业数");
    metrics::describe_counter!(JOB_REVERTED_TO_PENDING_TOTAL, "启动前退回PENDING的作业数");
    metrics::describe_counter!(JOB_RESTARTED_TOTAL, "因重启信号退回PENDING的作业数");
    metrics::describe_gauge!(JOB_COMPLETED_SECS, "最近完成的作业耗时（秒）");
    metrics::describe_counter!(TASK_COMPLETED_TOTAL, "成功完成的任务数");
    metrics::describe_counter!(TASK_FAILED_TOTAL, "失败的任务数");
    metrics::describe_counter!(LAUNCHER_REQUEUED_TOTAL, "启动器重新排队的作业数");
    metrics::describe_counter!(LAUNCHER_FAILED_TOTAL, "启动失败的作业数");
    metrics::describe_counter!(ANTS_REAPED_TOTAL, "被清理的过期Ant数");
    metrics::describe_counter!(ALLOCATIONS_REAPED_TOTAL, "被强制释放的过期分配数");
    metrics::describe_counter!(RESERVATION_FAILED_TOTAL, "预留失败次数");
}

pub fn incr_job_counter(name: &'static str, job_type: &str) {
    metrics::counter!(name, "job_type" => job_type.to_string()).increment(1);
}

pub fn incr_counter(name: &'static str, value: u64) {
    metrics::counter!(name).increment(value);
}

pub fn record_job_completed_secs(job_type: &str, secs: f64) {
    metrics::gauge!(JOB_COMPLETED_SECS, "job_type" => job_type.to_string()).set(secs);
}
