use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

use queen_core::models::{
    AntAllocation, AntRegistration, AntReservation, ContainerLifecycleEvent, RequestState,
    TaskMethod,
};
use queen_core::{QueenError, QueenResult};

/// 被强制释放的一条分配记录
#[derive(Debug, Clone, PartialEq)]
pub struct ReapedAllocation {
    pub ant_id: String,
    pub job_request_id: u64,
    pub task_types: Vec<String>,
}

/// Ant注册表以及所有派生索引
///
/// 所有映射只能通过这里的方法修改，调用方持有同一把锁，
/// 注册与索引更新因此总是一起生效。
#[derive(Debug)]
pub struct ResourceState {
    registrations: HashMap<String, AntRegistration>,
    ants_by_tag: HashMap<String, HashSet<String>>,
    ants_by_method: HashMap<TaskMethod, HashSet<String>>,
    ants_by_request: HashMap<u64, HashSet<String>>,
    container_events: HashMap<String, ContainerLifecycleEvent>,
    container_order: VecDeque<String>,
    max_container_events: usize,
    alive_timeout: Duration,
}

/// Ant当前负载：正在占用它的不同作业请求数
fn load(registration: &AntRegistration) -> usize {
    registration.allocations.len()
}

fn normalized_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

impl ResourceState {
    pub fn new(alive_timeout: Duration, max_container_events: usize) -> Self {
        Self {
            registrations: HashMap::new(),
            ants_by_tag: HashMap::new(),
            ants_by_method: HashMap::new(),
            ants_by_request: HashMap::new(),
            container_events: HashMap::new(),
            container_order: VecDeque::new(),
            max_container_events: max_container_events.max(1),
            alive_timeout,
        }
    }

    /// 注册或刷新Ant，返回是否为新Ant
    ///
    /// 本地已有的分配优先，心跳中携带而本地没有的分配会被合并进来。
    pub fn register(&mut self, mut registration: AntRegistration, now: DateTime<Utc>) -> QueenResult<bool> {
        registration.validate()?;
        registration.received_at = now;

        let is_new = match self.registrations.remove(&registration.ant_id) {
            Some(existing) => {
                self.unindex(&existing);
                for (request_id, allocation) in existing.allocations {
                    match registration.allocations.get_mut(&request_id) {
                        Some(reported) => {
                            for (task_type, state) in allocation.task_types {
                                reported.task_types.entry(task_type).or_insert(state);
                            }
                            reported.allocated_at = allocation.allocated_at.min(reported.allocated_at);
                        }
                        None => {
                            registration.allocations.insert(request_id, allocation);
                        }
                    }
                }
                registration.total_executed = registration.total_executed.max(existing.total_executed);
                registration.created_at = existing.created_at;
                false
            }
            None => true,
        };

        registration.current_load = load(&registration) as i32;
        self.index(&registration);
        self.registrations
            .insert(registration.ant_id.clone(), registration);
        Ok(is_new)
    }

    /// 移除Ant以及它在所有索引中的条目
    pub fn unregister(&mut self, ant_id: &str) -> Option<AntRegistration> {
        let registration = self.registrations.remove(ant_id)?;
        self.unindex(&registration);
        Some(registration)
    }

    fn index(&mut self, registration: &AntRegistration) {
        let ant_id = &registration.ant_id;
        for tag in normalized_tags(&registration.tags) {
            self.ants_by_tag.entry(tag).or_default().insert(ant_id.clone());
        }
        for method in &registration.methods {
            self.ants_by_method
                .entry(*method)
                .or_default()
                .insert(ant_id.clone());
        }
        for request_id in registration.allocations.keys() {
            self.ants_by_request
                .entry(*request_id)
                .or_default()
                .insert(ant_id.clone());
        }
    }

    fn unindex(&mut self, registration: &AntRegistration) {
        let ant_id = &registration.ant_id;
        for tag in normalized_tags(&registration.tags) {
            remove_from_index(&mut self.ants_by_tag, &tag, ant_id);
        }
        for method in &registration.methods {
            remove_from_index(&mut self.ants_by_method, method, ant_id);
        }
        for request_id in registration.allocations.keys() {
            remove_from_index(&mut self.ants_by_request, request_id, ant_id);
        }
    }

    /// 按负载升序返回同时满足执行方式和全部标签的Ant
    fn candidates(&self, method: TaskMethod, tags: &[String]) -> QueenResult<Vec<&AntRegistration>> {
        let by_method = self
            .ants_by_method
            .get(&method)
            .filter(|ants| !ants.is_empty())
            .ok_or_else(|| QueenError::ants_unavailable(format!("没有Ant支持执行方式 {method}")))?;

        let tags = normalized_tags(tags);
        let mut candidates: HashSet<&String> = by_method.iter().collect();
        let mut by_tag_counts = Vec::with_capacity(tags.len());
        for tag in &tags {
            let by_tag = self
                .ants_by_tag
                .get(tag)
                .filter(|ants| !ants.is_empty())
                .ok_or_else(|| QueenError::ants_unavailable(format!("没有Ant带有标签 {tag}")))?;
            by_tag_counts.push(format!("{}={}", tag, by_tag.len()));
            candidates.retain(|ant_id| by_tag.contains(*ant_id));
        }

        let mut matched: Vec<&AntRegistration> = candidates
            .into_iter()
            .filter_map(|ant_id| self.registrations.get(ant_id))
            .filter(|r| r.supports(method, &tags, self.alive_timeout))
            .collect();
        if matched.is_empty() {
            return Err(QueenError::ants_unavailable(format!(
                "没有同时满足执行方式 {} 和标签 {:?} 的Ant（按方式可用 {} 个，按标签可用 [{}]）",
                method,
                tags,
                by_method.len(),
                by_tag_counts.join(", ")
            )));
        }
        matched.sort_by(|a, b| load(a).cmp(&load(b)).then_with(|| a.ant_id.cmp(&b.ant_id)));
        Ok(matched)
    }

    /// 作业启动前的背压检查，不做预留
    ///
    /// 每个任务的执行方式和标签单独匹配，至少有一个匹配的Ant还有空闲容量。
    pub fn has_ants_for_job_tags(&self, requirements: &[(TaskMethod, Vec<String>)]) -> QueenResult<()> {
        for (method, tags) in requirements {
            let candidates = self.candidates(*method, tags)?;
            let has_capacity = candidates
                .iter()
                .any(|r| (load(r) as i64) < r.max_capacity as i64);
            if !has_capacity {
                return Err(QueenError::ants_unavailable(format!(
                    "支持执行方式 {} 和标签 {:?} 的 {} 个Ant都已满载",
                    method,
                    tags,
                    candidates.len()
                )));
            }
        }
        Ok(())
    }

    /// 选择负载最低的Ant；`dry_run` 为真时不记录分配
    pub fn reserve(
        &mut self,
        request_id: u64,
        task_type: &str,
        method: TaskMethod,
        tags: &[String],
        dry_run: bool,
    ) -> QueenResult<AntReservation> {
        let (ant_id, current_load, total) = {
            let candidates = self.candidates(method, tags)?;
            let best = candidates[0];
            (best.ant_id.clone(), load(best), candidates.len())
        };
        let registration = self
            .registrations
            .get_mut(&ant_id)
            .ok_or_else(|| QueenError::internal(format!("候选Ant {ant_id} 不在注册表中")))?;

        let mut reservation = AntReservation::new(
            &registration.ant_id,
            &registration.ant_topic,
            request_id,
            task_type,
            current_load as i32,
            total as i32,
        );
        reservation.encryption_key = registration.encryption_key.clone();
        if dry_run {
            return Ok(reservation);
        }

        let now = Utc::now();
        registration
            .allocations
            .entry(request_id)
            .and_modify(|allocation| {
                allocation
                    .task_types
                    .insert(task_type.to_string(), RequestState::Reserved);
                allocation.updated_at = now;
            })
            .or_insert_with(|| {
                AntAllocation::new(&ant_id, &reservation.ant_topic, request_id, task_type)
            });
        registration.current_load = load(registration) as i32;
        self.ants_by_request
            .entry(request_id)
            .or_default()
            .insert(ant_id);
        Ok(reservation)
    }

    /// 释放一个任务类型的分配，未知的Ant或分配不做任何事
    pub fn release(&mut self, request_id: u64, ant_id: &str, task_type: &str) -> bool {
        let Some(registration) = self.registrations.get_mut(ant_id) else {
            debug!(request_id, ant_id, task_type, "释放时找不到Ant，忽略");
            return false;
        };
        let Some(allocation) = registration.allocations.get_mut(&request_id) else {
            return false;
        };
        if allocation.task_types.remove(task_type).is_none() {
            return false;
        }
        if allocation.task_types.is_empty() {
            registration.allocations.remove(&request_id);
            remove_from_index(&mut self.ants_by_request, &request_id, ant_id);
        }
        registration.current_load = load(registration) as i32;
        registration.total_executed += 1;
        true
    }

    /// 释放作业请求在所有Ant上的分配，返回释放的任务类型数量
    pub fn release_job(&mut self, request_id: u64) -> usize {
        let mut released = 0;
        if let Some(ant_ids) = self.ants_by_request.remove(&request_id) {
            for ant_id in ant_ids {
                if let Some(registration) = self.registrations.get_mut(&ant_id) {
                    if let Some(allocation) = registration.allocations.remove(&request_id) {
                        released += allocation.task_types.len();
                    }
                    registration.current_load = load(registration) as i32;
                }
            }
        }
        self.clear_container_events(request_id);
        released
    }

    /// 移除心跳超时的Ant，返回被移除的Ant ID
    pub fn reap_stale_ants(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .registrations
            .values()
            .filter(|r| !r.is_alive(self.alive_timeout, now))
            .map(|r| r.ant_id.clone())
            .collect();
        for ant_id in &stale {
            if let Some(registration) = self.unregister(ant_id) {
                warn!(
                    ant_id = %ant_id,
                    allocations = registration.allocations.len(),
                    "Ant心跳超时，已移除"
                );
            }
        }
        stale
    }

    /// 强制释放超过预留超时的分配
    pub fn reap_stale_allocations(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<ReapedAllocation> {
        let mut reaped = Vec::new();
        for registration in self.registrations.values_mut() {
            let expired: Vec<u64> = registration
                .allocations
                .values()
                .filter(|a| now.signed_duration_since(a.allocated_at) > timeout)
                .map(|a| a.job_request_id)
                .collect();
            for request_id in expired {
                if let Some(allocation) = registration.allocations.remove(&request_id) {
                    reaped.push(ReapedAllocation {
                        ant_id: registration.ant_id.clone(),
                        job_request_id: request_id,
                        task_types: allocation.task_types.into_keys().collect(),
                    });
                }
            }
            registration.current_load = load(registration) as i32;
        }
        for allocation in &reaped {
            remove_from_index(
                &mut self.ants_by_request,
                &allocation.job_request_id,
                &allocation.ant_id,
            );
        }
        reaped
    }

    /// 按容器名缓存事件，超出容量时淘汰最早的
    pub fn record_container_event(&mut self, event: ContainerLifecycleEvent) {
        let name = event.container_name.clone();
        if self.container_events.insert(name.clone(), event).is_none() {
            self.container_order.push_back(name);
        }
        while self.container_order.len() > self.max_container_events {
            if let Some(oldest) = self.container_order.pop_front() {
                self.container_events.remove(&oldest);
            }
        }
    }

    fn clear_container_events(&mut self, request_id: u64) {
        self.container_events
            .retain(|_, e| e.request_id() != Some(request_id));
        let events = &self.container_events;
        self.container_order.retain(|name| events.contains_key(name));
    }

    pub fn container_events(&self, request_id: u64) -> Vec<ContainerLifecycleEvent> {
        self.container_order
            .iter()
            .filter_map(|name| self.container_events.get(name))
            .filter(|e| e.request_id() == Some(request_id))
            .cloned()
            .collect()
    }

    pub fn registration(&self, ant_id: &str) -> Option<&AntRegistration> {
        self.registrations.get(ant_id)
    }

    pub fn registrations(&self) -> Vec<AntRegistration> {
        self.registrations.values().cloned().collect()
    }

    pub fn ants_for_tag(&self, tag: &str) -> usize {
        self.ants_by_tag.get(tag).map(|s| s.len()).unwrap_or(0)
    }

    pub fn ants_for_method(&self, method: TaskMethod) -> usize {
        self.ants_by_method.get(&method).map(|s| s.len()).unwrap_or(0)
    }

    pub fn ants_for_request(&self, request_id: u64) -> Vec<String> {
        let mut ants: Vec<String> = self
            .ants_by_request
            .get(&request_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        ants.sort();
        ants
    }

    pub fn allocation_count(&self, ant_id: &str) -> usize {
        self.registrations.get(ant_id).map(load).unwrap_or(0)
    }

    pub fn container_event_count(&self) -> usize {
        self.container_events.len()
    }
}

fn remove_from_index<K>(index: &mut HashMap<K, HashSet<String>>, key: &K, ant_id: &str)
where
    K: std::hash::Hash + Eq,
{
    if let Some(ants) = index.get_mut(key) {
        ants.remove(ant_id);
        if ants.is_empty() {
            index.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queen_core::models::LABEL_REQUEST_ID;

    fn state() -> ResourceState {
        ResourceState::new(Duration::seconds(300), 3)
    }

    fn ant(id: &str, capacity: i32, tags: &[&str]) -> AntRegistration {
        AntRegistration::new(id, &format!("{id}-topic"), capacity, vec![TaskMethod::Docker])
            .with_tags(tags)
    }

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|t| t.to_string()).collect()
    }

    fn container(name: &str, request_id: u64) -> ContainerLifecycleEvent {
        let mut labels = HashMap::new();
        labels.insert(LABEL_REQUEST_ID.to_string(), request_id.to_string());
        ContainerLifecycleEvent {
            ant_id: "a1".into(),
            method: TaskMethod::Docker,
            container_name: name.into(),
            container_id: String::new(),
            container_state: RequestState::Executing,
            labels,
            started_at: Utc::now(),
            ended_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_capacity_backpressure() {
        let mut state = state();
        state.register(ant("a1", 10, &["x"]), Utc::now()).unwrap();
        let x = tags(&["x"]);

        let mut reservations = Vec::new();
        for request_id in 1..=10 {
            reservations.push(
                state
                    .reserve(request_id, "build", TaskMethod::Docker, &x, false)
                    .unwrap(),
            );
        }
        assert!(state.has_ants_for_job_tags(&[(TaskMethod::Docker, x.clone())]).is_err());

        let released = &reservations[4];
        assert!(state.release(released.job_request_id, &released.ant_id, &released.task_type));
        assert!(state.has_ants_for_job_tags(&[(TaskMethod::Docker, x.clone())]).is_ok());
    }

    #[test]
    fn test_tags_are_conjunctive() {
        let mut state = state();
        state.register(ant("a1", 5, &["x"]), Utc::now()).unwrap();
        state.register(ant("a2", 5, &["y"]), Utc::now()).unwrap();

        let both = tags(&["x", "y"]);
        assert!(state.reserve(1, "build", TaskMethod::Docker, &both, false).is_err());
        assert!(state.has_ants_for_job_tags(&[(TaskMethod::Docker, both.clone())]).is_err());
        assert!(state
            .reserve(1, "build", TaskMethod::Docker, &tags(&["z"]), false)
            .is_err());
        assert!(state.reserve(1, "build", TaskMethod::Shell, &[], false).is_err());
        assert_eq!(state.allocation_count("a1") + state.allocation_count("a2"), 0);
    }

    #[test]
    fn test_job_gate_matches_each_task_separately() {
        let mut state = state();
        state.register(ant("gpu", 1, &["gpu"]), Utc::now()).unwrap();
        state
            .register(
                AntRegistration::new("sh", "sh-topic", 1, vec![TaskMethod::Shell]),
                Utc::now(),
            )
            .unwrap();

        let requirements = vec![
            (TaskMethod::Docker, tags(&["gpu"])),
            (TaskMethod::Shell, Vec::new()),
        ];
        assert!(state.has_ants_for_job_tags(&requirements).is_ok());

        state.reserve(1, "report", TaskMethod::Shell, &[], false).unwrap();
        assert!(state.has_ants_for_job_tags(&requirements).is_err());
        assert!(state
            .has_ants_for_job_tags(&[(TaskMethod::Docker, tags(&["gpu"]))])
            .is_ok());
    }

    #[test]
    fn test_least_loaded_ant_is_selected() {
        let mut state = state();
        state.register(ant("a1", 10, &[]), Utc::now()).unwrap();
        state.register(ant("a2", 10, &[]), Utc::now()).unwrap();
        state.register(ant("a3", 10, &[]), Utc::now()).unwrap();
        state.reserve(1, "t", TaskMethod::Docker, &[], false).unwrap();
        state.reserve(2, "t", TaskMethod::Docker, &[], false).unwrap();

        let third = state.reserve(3, "t", TaskMethod::Docker, &[], false).unwrap();
        assert_eq!(third.current_load, 0);
        assert_eq!(third.total_reservations, 3);
        let mut loads: Vec<usize> = ["a1", "a2", "a3"]
            .iter()
            .map(|a| state.allocation_count(a))
            .collect();
        loads.sort();
        assert_eq!(loads, vec![1, 1, 1]);

        let fourth = state.reserve(4, "t", TaskMethod::Docker, &[], false).unwrap();
        assert_eq!(fourth.current_load, 1);
    }

    #[test]
    fn test_same_request_counts_once_for_load() {
        let mut state = state();
        state.register(ant("a1", 10, &[]), Utc::now()).unwrap();
        state.reserve(1, "checkout", TaskMethod::Docker, &[], false).unwrap();
        state.reserve(1, "compile", TaskMethod::Docker, &[], false).unwrap();
        assert_eq!(state.allocation_count("a1"), 1);
        assert_eq!(state.ants_for_request(1), vec!["a1".to_string()]);
    }

    #[test]
    fn test_dry_run_does_not_allocate() {
        let mut state = state();
        state.register(ant("a1", 1, &[]), Utc::now()).unwrap();
        let reservation = state.reserve(1, "t", TaskMethod::Docker, &[], true).unwrap();
        assert_eq!(reservation.ant_id, "a1");
        assert_eq!(state.allocation_count("a1"), 0);
        assert!(state.ants_for_request(1).is_empty());
    }

    #[test]
    fn test_release_balance_and_idempotence() {
        let mut state = state();
        state.register(ant("a1", 10, &[]), Utc::now()).unwrap();
        let before = state.allocation_count("a1");
        let reservation = state.reserve(7, "t", TaskMethod::Docker, &[], false).unwrap();
        assert_eq!(state.allocation_count("a1"), before + 1);

        assert!(state.release(7, &reservation.ant_id, "t"));
        assert_eq!(state.allocation_count("a1"), before);
        assert!(!state.release(7, &reservation.ant_id, "t"));
        assert!(!state.release(7, "unknown-ant", "t"));
        assert_eq!(state.registration("a1").unwrap().total_executed, 1);
        assert!(state.ants_for_request(7).is_empty());
    }

    #[test]
    fn test_release_job_clears_everything() {
        let mut state = state();
        state.register(ant("a1", 10, &[]), Utc::now()).unwrap();
        state.register(ant("a2", 10, &[]), Utc::now()).unwrap();
        state.reserve(9, "a", TaskMethod::Docker, &[], false).unwrap();
        state.reserve(9, "b", TaskMethod::Docker, &[], false).unwrap();
        state.record_container_event(container("c-9", 9));
        state.record_container_event(container("c-10", 10));

        assert_eq!(state.release_job(9), 2);
        assert_eq!(state.allocation_count("a1") + state.allocation_count("a2"), 0);
        assert!(state.container_events(9).is_empty());
        assert_eq!(state.container_events(10).len(), 1);
        assert_eq!(state.release_job(9), 0);
    }

    #[test]
    fn test_register_merges_heartbeat_allocations() {
        let mut state = state();
        state.register(ant("a1", 10, &["x"]), Utc::now()).unwrap();
        state.reserve(1, "t", TaskMethod::Docker, &[], false).unwrap();

        let mut heartbeat = ant("a1", 10, &["y"]);
        heartbeat
            .allocations
            .insert(2, AntAllocation::new("a1", "a1-topic", 2, "other"));
        assert!(!state.register(heartbeat, Utc::now()).unwrap());

        assert_eq!(state.allocation_count("a1"), 2);
        assert_eq!(state.ants_for_tag("x"), 0);
        assert_eq!(state.ants_for_tag("y"), 1);
        assert_eq!(state.ants_for_request(2), vec!["a1".to_string()]);
    }

    #[test]
    fn test_reap_stale_ants_removes_indexes() {
        let mut state = state();
        let now = Utc::now();
        state.register(ant("old", 10, &["x"]), now - Duration::seconds(600)).unwrap();
        state.register(ant("fresh", 10, &["y"]), now).unwrap();
        state.reserve(3, "t", TaskMethod::Docker, &tags(&["x"]), false).ok();

        let reaped = state.reap_stale_ants(now);
        assert_eq!(reaped, vec!["old".to_string()]);
        assert!(state.registration("old").is_none());
        assert_eq!(state.ants_for_tag("x"), 0);
        assert_eq!(state.ants_for_method(TaskMethod::Docker), 1);
        assert!(state.ants_for_request(3).is_empty());
    }

    #[test]
    fn test_stale_registration_is_not_a_candidate() {
        let mut state = state();
        state
            .register(ant("old", 10, &[]), Utc::now() - Duration::seconds(600))
            .unwrap();
        assert!(state.reserve(1, "t", TaskMethod::Docker, &[], false).is_err());
    }

    #[test]
    fn test_reap_stale_allocations_releases_once() {
        let mut state = state();
        state.register(ant("a1", 10, &[]), Utc::now()).unwrap();
        state.reserve(1, "t", TaskMethod::Docker, &[], false).unwrap();
        state.reserve(2, "t", TaskMethod::Docker, &[], false).unwrap();

        let later = Utc::now() + Duration::seconds(120);
        let reaped = state.reap_stale_allocations(later, Duration::seconds(60));
        assert_eq!(reaped.len(), 2);
        assert_eq!(state.allocation_count("a1"), 0);
        assert!(state.reap_stale_allocations(later, Duration::seconds(60)).is_empty());
        assert!(!state.release(1, "a1", "t"));
    }

    #[test]
    fn test_container_cache_is_bounded() {
        let mut state = state();
        for i in 0..5 {
            state.record_container_event(container(&format!("c-{i}"), 1));
        }
        assert_eq!(state.container_event_count(), 3);
        let names: Vec<String> = state
            .container_events(1)
            .into_iter()
            .map(|e| e.container_name)
            .collect();
        assert_eq!(names, vec!["c-2", "c-3", "c-4"]);
    }
}
