//! Coordinator: composition root implementing the agent-facing tool
//! surface (§6.3) by wiring together the Graph, Inferer, Lease Manager,
//! Matcher, Context Builder, and Event Bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use marcus_db::capability::{Board, Oracle, TaskPatch};
use marcus_db::ledger::AssignmentLedger;
use marcus_db::model::{Agent, AssignmentStatus, Task, TaskStatus};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::context::{ContextBuilder, ContextPayload};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, EventTopic};
use crate::graph::TaskGraph;
use crate::infer::DependencyInferer;
use crate::lease::LeaseManager;
use crate::matcher::{match_task, MatchInput};

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub assignment_capacity_per_agent: u32,
    pub board_timeout: Duration,
    pub oracle_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            assignment_capacity_per_agent: 1,
            board_timeout: Duration::from_secs(10),
            oracle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterAgentOutput {
    pub ok: bool,
    pub capacity: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestNextTaskOutput {
    pub task: Option<Task>,
    pub instructions: Option<ContextPayload>,
    pub reason_if_none: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OkOutput {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportBlockerOutput {
    pub ok: bool,
    pub suggestions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingOutput {
    pub status: &'static str,
    pub level: String,
    pub registered_agents: Option<usize>,
    pub active_leases: Option<usize>,
    pub dropped_events: Option<u64>,
}

pub struct Coordinator {
    board: Arc<dyn Board>,
    oracle: Option<Arc<dyn Oracle>>,
    ledger: Arc<AssignmentLedger>,
    lease_manager: LeaseManager,
    events: Arc<EventBus>,
    graph: RwLock<TaskGraph>,
    agents: Mutex<HashMap<String, Agent>>,
    assignment_mutex: Mutex<()>,
    inferer: DependencyInferer,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        board: Arc<dyn Board>,
        oracle: Option<Arc<dyn Oracle>>,
        ledger: Arc<AssignmentLedger>,
        lease_manager: LeaseManager,
        events: Arc<EventBus>,
        inferer: DependencyInferer,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            board,
            oracle,
            ledger,
            lease_manager,
            events,
            graph: RwLock::new(TaskGraph::new()),
            agents: Mutex::new(HashMap::new()),
            assignment_mutex: Mutex::new(()),
            inferer,
            config,
        }
    }

    async fn fetch_board_snapshot(&self) -> CoreResult<Vec<Task>> {
        match tokio::time::timeout(self.config.board_timeout, self.board.list_tasks()).await {
            Ok(Ok(tasks)) => Ok(tasks),
            Ok(Err(e)) => Err(CoreError::BoardUnavailable(e.to_string())),
            Err(_) => Err(CoreError::BoardUnavailable("timed out".to_string())),
        }
    }

    async fn refresh_graph(&self) -> CoreResult<()> {
        let tasks = self.fetch_board_snapshot().await?;
        let mut graph = self.graph.write().await;
        for task in tasks {
            graph.upsert(task);
        }
        Ok(())
    }

    pub async fn register_agent(&self, agent_id: &str, name: &str, role: &str, skills: Vec<String>) -> CoreResult<RegisterAgentOutput> {
        if agent_id.trim().is_empty() {
            return Err(CoreError::InvalidInput("agent_id must not be empty".to_string()));
        }
        let mut agents = self.agents.lock().await;
        let agent = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Agent::new(agent_id, name, role, skills.clone()));
        agent.name = name.to_string();
        agent.role = role.to_string();
        agent.skills = skills;
        agent.capacity = self.config.assignment_capacity_per_agent;
        agent.last_seen = chrono::Utc::now();
        Ok(RegisterAgentOutput { ok: true, capacity: agent.capacity })
    }

    /// §4.3-§4.5: the full acquire sequence, serialized by the global
    /// assignment mutex (§5). The Oracle is only ever consulted during
    /// Matcher scoring, before the critical section closes over the
    /// Board update and ledger save.
    pub async fn request_next_task(&self, agent_id: &str) -> CoreResult<RequestNextTaskOutput> {
        {
            let agents = self.agents.lock().await;
            if !agents.contains_key(agent_id) {
                return Err(CoreError::NotRegistered(agent_id.to_string()));
            }
        }

        self.refresh_graph().await?;

        let _guard = self.assignment_mutex.lock().await;

        let agent = {
            let agents = self.agents.lock().await;
            agents.get(agent_id).cloned().ok_or_else(|| CoreError::NotRegistered(agent_id.to_string()))?
        };

        let actively_leased: std::collections::HashSet<String> = self
            .ledger
            .load()
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .into_values()
            .filter(|a| a.status == AssignmentStatus::Active)
            .map(|a| a.task_id)
            .collect();

        let graph = self.graph.read().await;
        let candidates: Vec<Task> = graph
            .topological_order()
            .unwrap_or_default()
            .iter()
            .filter_map(|id| graph.get(id))
            .filter(|t| t.status == TaskStatus::Todo)
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Ok(RequestNextTaskOutput { task: None, instructions: None, reason_if_none: Some("no_match".to_string()) });
        }

        let oracle_ref: Option<&dyn Oracle> = self.oracle.as_deref();
        let input = MatchInput {
            agent: &agent,
            candidates: &candidates,
            graph: &graph,
            oracle: oracle_ref,
            in_flight: &std::collections::HashSet::new(),
            actively_leased: &actively_leased,
        };
        let Some((task, _explanation)) = match_task(input).await else {
            return Ok(RequestNextTaskOutput { task: None, instructions: None, reason_if_none: Some("all_blocked".to_string()) });
        };
        drop(graph);

        let Some(pending) = self.lease_manager.pending_lease(&task.task_id, agent_id).await? else {
            return Ok(RequestNextTaskOutput { task: None, instructions: None, reason_if_none: Some("no_match".to_string()) });
        };

        let patch = TaskPatch {
            status: Some(TaskStatus::InProgress),
            assigned_to: Some(Some(agent_id.to_string())),
            comment: None,
        };
        let board_result = tokio::time::timeout(self.config.board_timeout, self.board.update_task(&task.task_id, patch)).await;
        match board_result {
            Ok(Ok(())) => {}
            _ => {
                // Lease was never persisted; nothing to roll back.
                return Err(CoreError::BoardUnavailable(format!("failed to update board for task {}", task.task_id)));
            }
        }

        if let Err(e) = self.lease_manager.persist_lease(pending).await {
            // Board update succeeded but the ledger write failed: roll
            // the Board back and surface the failure (§5 ordering).
            let rollback = TaskPatch { status: Some(TaskStatus::Todo), assigned_to: Some(None), comment: None };
            let _ = self.board.update_task(&task.task_id, rollback).await;
            return Err(e);
        }

        {
            let mut graph = self.graph.write().await;
            let mut updated = task.clone();
            updated.status = TaskStatus::InProgress;
            updated.assigned_to = Some(agent_id.to_string());
            graph.upsert(updated);
        }

        self.events
            .publish(EventTopic::TaskStarted, serde_json::json!({"task_id": task.task_id, "agent_id": agent_id}))
            .await;

        let graph = self.graph.read().await;
        let context = ContextBuilder::new(self.board.as_ref(), self.oracle.as_deref()).build(&agent, &task, &graph).await;

        Ok(RequestNextTaskOutput { task: Some(task), instructions: Some(context), reason_if_none: None })
    }

    async fn assignment_for(&self, agent_id: &str, task_id: &str) -> CoreResult<marcus_db::model::Assignment> {
        let assignment = self
            .ledger
            .load_by_task(task_id)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .ok_or_else(|| CoreError::NotAssigned { agent_id: agent_id.to_string(), task_id: task_id.to_string() })?;
        if assignment.agent_id != agent_id || assignment.status != AssignmentStatus::Active {
            return Err(CoreError::NotAssigned { agent_id: agent_id.to_string(), task_id: task_id.to_string() });
        }
        if assignment.lease_expires_at <= chrono::Utc::now() {
            return Err(CoreError::LeaseExpired { task_id: task_id.to_string() });
        }
        Ok(assignment)
    }

    pub async fn report_task_progress(
        &self,
        agent_id: &str,
        task_id: &str,
        status: &str,
        progress: u8,
        message: Option<String>,
    ) -> CoreResult<OkOutput> {
        self.assignment_for(agent_id, task_id).await?;

        let (board_status, event_topic) = match status {
            "in_progress" => (TaskStatus::InProgress, EventTopic::TaskProgress),
            "completed" => (TaskStatus::Done, EventTopic::TaskCompleted),
            "blocked" => (TaskStatus::Blocked, EventTopic::TaskBlocked),
            other => return Err(CoreError::InvalidInput(format!("unknown status: {other}"))),
        };

        let patch = TaskPatch { status: Some(board_status), assigned_to: None, comment: message.clone() };
        tokio::time::timeout(self.config.board_timeout, self.board.update_task(task_id, patch))
            .await
            .map_err(|_| CoreError::BoardUnavailable("timed out".to_string()))?
            .map_err(|e| CoreError::BoardUnavailable(e.to_string()))?;

        if status == "completed" {
            self.lease_manager.release(task_id, agent_id).await?;
        } else {
            self.lease_manager.heartbeat(task_id, agent_id).await?;
        }

        self.events
            .publish(event_topic, serde_json::json!({"task_id": task_id, "agent_id": agent_id, "progress": progress, "message": message}))
            .await;

        Ok(OkOutput { ok: true })
    }

    pub async fn report_blocker(&self, agent_id: &str, task_id: &str, description: &str, severity: &str) -> CoreResult<ReportBlockerOutput> {
        self.assignment_for(agent_id, task_id).await?;

        let _ = self
            .board
            .add_comment(task_id, &format!("[blocker:{severity}] {description}"))
            .await;

        self.events
            .publish(
                EventTopic::TaskBlocked,
                serde_json::json!({"task_id": task_id, "agent_id": agent_id, "description": description, "severity": severity}),
            )
            .await;

        let suggestions = if severity == "critical" {
            Some(vec!["Consider escalating to a human reviewer immediately.".to_string()])
        } else {
            None
        };
        Ok(ReportBlockerOutput { ok: true, suggestions })
    }

    pub async fn get_task_context(&self, task_id: &str) -> CoreResult<ContextPayload> {
        let graph = self.graph.read().await;
        let task = graph
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown task: {task_id}")))?;

        let agent = if let Some(assignment) = self.ledger.load_by_task(task_id).await.map_err(|e| CoreError::Internal(e.to_string()))? {
            self.agents.lock().await.get(&assignment.agent_id).cloned()
        } else {
            None
        };
        let agent = agent.unwrap_or_else(|| Agent::new("unassigned", "unassigned", "unassigned", vec![]));

        Ok(ContextBuilder::new(self.board.as_ref(), self.oracle.as_deref()).build(&agent, &task, &graph).await)
    }

    pub async fn release_task(&self, agent_id: &str, task_id: &str) -> CoreResult<OkOutput> {
        self.lease_manager.release(task_id, agent_id).await?;
        let patch = TaskPatch { status: Some(TaskStatus::Todo), assigned_to: Some(None), comment: None };
        let _ = self.board.update_task(task_id, patch).await;
        Ok(OkOutput { ok: true })
    }

    pub async fn ping(&self, level: &str) -> PingOutput {
        match level {
            "diagnostic" | "detailed" => {
                let agents = self.agents.lock().await.len();
                let active_leases = self.ledger.load().await.map(|m| m.len()).unwrap_or(0);
                PingOutput {
                    status: "ok",
                    level: level.to_string(),
                    registered_agents: Some(agents),
                    active_leases: Some(active_leases),
                    dropped_events: Some(self.events.dropped_count()),
                }
            }
            _ => PingOutput { status: "ok", level: level.to_string(), registered_agents: None, active_leases: None, dropped_events: None },
        }
    }

    /// Trigger dependency inference over the current Board snapshot and
    /// update the graph with the resulting edges.
    pub async fn run_inference(&self) -> CoreResult<()> {
        let tasks = self.fetch_board_snapshot().await?;
        let edges = self.inferer.infer(&tasks).await?;

        let mut by_dependent: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &edges {
            by_dependent.entry(edge.dependent_task_id.as_str()).or_default().push(edge.dependency_task_id.as_str());
        }

        let mut graph = self.graph.write().await;
        for mut task in tasks {
            if let Some(deps) = by_dependent.get(task.task_id.as_str()) {
                task.dependencies = deps.iter().map(|s| s.to_string()).collect();
            }
            graph.upsert(task);
        }

        self.events
            .publish(EventTopic::DependencyInferred, serde_json::json!({"edge_count": edges.len()}))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer::InferConfig;
    use marcus_db::cache::DependencyCache;
    use marcus_db::model::Priority;
    use marcus_test_utils::FakeBoard;

    fn task(id: &str, status: TaskStatus, deps: &[&str]) -> Task {
        let now = chrono::Utc::now();
        Task {
            task_id: id.to_string(),
            name: format!("Task {id}"),
            description: String::new(),
            status,
            priority: Priority::Medium,
            assigned_to: None,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            labels: vec![],
            estimated_hours: 1.0,
            created_at: now,
            updated_at: now,
        }
    }

    async fn coordinator(tasks: Vec<Task>) -> (Coordinator, Arc<FakeBoard>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let board = Arc::new(FakeBoard::new(tasks));
        let ledger = Arc::new(AssignmentLedger::open(dir.path(), false));
        let events = Arc::new(EventBus::new(100));
        let lease_manager = LeaseManager::new(ledger.clone(), events.clone(), crate::lease::LeaseConfig::default());
        let cache = Arc::new(DependencyCache::open(dir.path(), false));
        let inferer = DependencyInferer::new(InferConfig::default(), None, cache);
        let coordinator = Coordinator::new(board.clone(), None, ledger, lease_manager, events, inferer, CoordinatorConfig::default());
        (coordinator, board, dir)
    }

    #[tokio::test]
    async fn simple_happy_path_assigns_and_blocks_dependent() {
        let (coordinator, board, _dir) = coordinator(vec![task("t1", TaskStatus::Todo, &[]), task("t2", TaskStatus::Todo, &["t1"])]).await;
        coordinator.register_agent("agent-a", "Agent A", "engineer", vec![]).await.unwrap();

        let result = coordinator.request_next_task("agent-a").await.unwrap();
        let assigned = result.task.unwrap();
        assert_eq!(assigned.task_id, "t1");
        assert_eq!(board.get_task("t1").unwrap().status, TaskStatus::InProgress);

        coordinator.register_agent("agent-b", "Agent B", "engineer", vec![]).await.unwrap();
        let second = coordinator.request_next_task("agent-b").await.unwrap();
        assert!(second.task.is_none(), "t2 must stay blocked while t1 is incomplete");
    }

    #[tokio::test]
    async fn completing_a_task_unblocks_its_dependent() {
        let (coordinator, board, _dir) = coordinator(vec![task("t1", TaskStatus::Todo, &[]), task("t2", TaskStatus::Todo, &["t1"])]).await;
        coordinator.register_agent("agent-a", "Agent A", "engineer", vec![]).await.unwrap();
        coordinator.request_next_task("agent-a").await.unwrap();
        coordinator.report_task_progress("agent-a", "t1", "completed", 100, None).await.unwrap();
        assert_eq!(board.get_task("t1").unwrap().status, TaskStatus::Done);

        coordinator.register_agent("agent-b", "Agent B", "engineer", vec![]).await.unwrap();
        let result = coordinator.request_next_task("agent-b").await.unwrap();
        assert_eq!(result.task.unwrap().task_id, "t2");
    }

    #[tokio::test]
    async fn request_next_task_requires_registration() {
        let (coordinator, _board, _dir) = coordinator(vec![task("t1", TaskStatus::Todo, &[])]).await;
        let err = coordinator.request_next_task("ghost").await.unwrap_err();
        assert!(matches!(err, CoreError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn release_task_is_idempotent() {
        let (coordinator, _board, _dir) = coordinator(vec![task("t1", TaskStatus::Todo, &[])]).await;
        coordinator.register_agent("agent-a", "Agent A", "engineer", vec![]).await.unwrap();
        coordinator.request_next_task("agent-a").await.unwrap();

        coordinator.release_task("agent-a", "t1").await.unwrap();
        let second = coordinator.release_task("agent-a", "t1").await.unwrap();
        assert!(second.ok);
    }

    #[tokio::test]
    async fn concurrent_requests_never_double_assign() {
        let tasks: Vec<Task> = (0..5).map(|i| task(&format!("t{i}"), TaskStatus::Todo, &[])).collect();
        let (coordinator, _board, _dir) = coordinator(tasks).await;
        let coordinator = Arc::new(coordinator);

        for i in 0..10 {
            coordinator.register_agent(&format!("agent-{i}"), "A", "engineer", vec![]).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..10 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move { coordinator.request_next_task(&format!("agent-{i}")).await.unwrap() }));
        }

        let mut assigned_ids = std::collections::HashSet::new();
        let mut none_count = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            match result.task {
                Some(task) => {
                    assert!(assigned_ids.insert(task.task_id), "no task should be double-assigned");
                }
                None => none_count += 1,
            }
        }
        assert_eq!(assigned_ids.len(), 5);
        assert_eq!(none_count, 5);
    }
}
