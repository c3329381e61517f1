//! Reconciler / Monitor (C6, §4.6): startup reconciliation against the
//! Board plus a steady-state reversion-detection loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use marcus_db::capability::{Board, TaskPatch};
use marcus_db::ledger::AssignmentLedger;
use marcus_db::model::{Assignment, AssignmentStatus, TaskStatus};
use tokio::sync::Mutex;

use crate::events::{EventBus, EventTopic};

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReconciliationReport {
    pub removed: u32,
    pub restored: u32,
    pub verified: u32,
    pub errors: u32,
}

/// In-memory reversion counter keyed by task_id (§3.1: authoritative
/// in-memory counter; `reversion_counts.json` in §6.4 is an optional,
/// non-authoritative snapshot for restart visibility only).
#[derive(Default)]
pub struct ReversionCounts {
    counts: Mutex<HashMap<String, u32>>,
}

impl ReversionCounts {
    pub fn new() -> Self {
        Self::default()
    }

    async fn increment(&self, task_id: &str) -> u32 {
        let mut counts = self.counts.lock().await;
        let entry = counts.entry(task_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub async fn snapshot(&self) -> HashMap<String, u32> {
        self.counts.lock().await.clone()
    }
}

pub struct Reconciler {
    board: Arc<dyn Board>,
    ledger: Arc<AssignmentLedger>,
    events: Arc<EventBus>,
    reversions: Arc<ReversionCounts>,
    check_interval: StdDuration,
}

impl Reconciler {
    pub fn new(
        board: Arc<dyn Board>,
        ledger: Arc<AssignmentLedger>,
        events: Arc<EventBus>,
        reversions: Arc<ReversionCounts>,
        check_interval_seconds: u64,
    ) -> Self {
        Self {
            board,
            ledger,
            events,
            reversions,
            check_interval: StdDuration::from_secs(check_interval_seconds),
        }
    }

    /// One-shot startup reconciliation (§4.6): cross-check every
    /// persisted assignment against the Board, remove inconsistent
    /// entries, and restore orphaned IN_PROGRESS-on-Board assignments
    /// that have no ledger entry.
    pub async fn reconcile_on_startup(&self) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();

        let tasks = match self.board.list_tasks().await {
            Ok(tasks) => tasks,
            Err(_) => {
                report.errors += 1;
                return report;
            }
        };
        let by_id: HashMap<&str, &marcus_db::model::Task> = tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();

        let assignments = match self.ledger.load().await {
            Ok(a) => a,
            Err(_) => {
                report.errors += 1;
                return report;
            }
        };

        for (agent_id, assignment) in &assignments {
            match by_id.get(assignment.task_id.as_str()) {
                Some(task) if task.status == TaskStatus::InProgress && task.assigned_to.as_deref() == Some(agent_id.as_str()) => {
                    report.verified += 1;
                }
                _ => {
                    if self.ledger.remove(agent_id).await.is_err() {
                        report.errors += 1;
                    } else {
                        report.removed += 1;
                    }
                }
            }
        }

        let claimed_task_ids: std::collections::HashSet<&str> =
            assignments.values().map(|a| a.task_id.as_str()).collect();
        for task in &tasks {
            if task.status == TaskStatus::InProgress && !claimed_task_ids.contains(task.task_id.as_str()) {
                if let Some(agent_id) = &task.assigned_to {
                    let now = chrono::Utc::now();
                    let restored = Assignment {
                        agent_id: agent_id.clone(),
                        task_id: task.task_id.clone(),
                        assigned_at: now,
                        lease_expires_at: now + chrono::Duration::minutes(30),
                        last_heartbeat: now,
                        renewal_count: 0,
                        status: AssignmentStatus::Active,
                        metadata: serde_json::json!({"restored_by_reconciler": true}),
                    };
                    if self.ledger.save(agent_id, restored).await.is_err() {
                        report.errors += 1;
                    } else {
                        report.restored += 1;
                    }
                }
            }
        }

        self.events
            .publish(EventTopic::ReconcilerReport, serde_json::to_value(&report).unwrap_or_default())
            .await;
        report
    }

    /// Run the steady-state monitor loop until `shutdown` resolves.
    /// Board read failure: skip this cycle and retry on the next tick.
    pub async fn run_monitor(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.monitor_cycle().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// A single pass of §4.6.1 reversion detection over every ledger entry.
    pub async fn monitor_cycle(&self) {
        let tasks = match self.board.list_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(error = %e, "board read failed during monitor cycle, retrying next cycle");
                return;
            }
        };
        let by_id: HashMap<&str, &marcus_db::model::Task> = tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();

        let assignments = match self.ledger.load().await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "ledger read failed during monitor cycle, retrying next cycle");
                return;
            }
        };

        for (agent_id, assignment) in assignments {
            let verdict = match by_id.get(assignment.task_id.as_str()) {
                None => Some("task no longer exists on the board"),
                Some(task) if task.status == TaskStatus::Todo => Some("reverted to todo"),
                Some(task) if task.status == TaskStatus::InProgress && task.assigned_to.as_deref() != Some(agent_id.as_str()) => {
                    Some("reassigned out of band")
                }
                Some(task) if task.status == TaskStatus::Done && task.assigned_to.as_deref() != Some(agent_id.as_str()) => {
                    Some("completed by another agent")
                }
                Some(task) if task.status == TaskStatus::Blocked && task.assigned_to.is_none() => Some("blocked and unassigned"),
                _ => None,
            };

            let Some(reason) = verdict else { continue };

            if let Err(e) = self.ledger.remove(&agent_id).await {
                tracing::error!(error = %e, task_id = %assignment.task_id, "failed to remove reverted assignment, leaving for next cycle");
                continue;
            }

            let topic = if reason == "reverted to todo" { EventTopic::AssignmentReverted } else { EventTopic::LeaseForcedRelease };
            self.events
                .publish(topic, serde_json::json!({"task_id": assignment.task_id, "agent_id": agent_id, "reason": reason}))
                .await;

            let count = self.reversions.increment(&assignment.task_id).await;
            if count >= 3 {
                self.events
                    .publish(EventTopic::ProblemTask, serde_json::json!({"task_id": assignment.task_id, "count": count}))
                    .await;
            }
        }
    }

    /// Leave a breadcrumb on the Board for a lease expired without an
    /// agent heartbeat, reverting it to TODO; if the Board update fails
    /// the next monitor cycle will heal the inconsistency.
    pub async fn heal_expired_lease(&self, task_id: &str) {
        let patch = TaskPatch {
            status: Some(TaskStatus::Todo),
            assigned_to: Some(None),
            comment: Some("lease expired without heartbeat; returned to the pool".to_string()),
        };
        if let Err(e) = self.board.update_task(task_id, patch).await {
            tracing::warn!(error = %e, task_id, "failed to revert board task after lease expiry, monitor will heal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marcus_db::model::{Priority, Task};
    use marcus_test_utils::FakeBoard;

    fn task(id: &str, status: TaskStatus, assigned_to: Option<&str>) -> Task {
        let now = chrono::Utc::now();
        Task {
            task_id: id.to_string(),
            name: "Do work".to_string(),
            description: String::new(),
            status,
            priority: Priority::Medium,
            assigned_to: assigned_to.map(|s| s.to_string()),
            dependencies: vec![],
            labels: vec![],
            estimated_hours: 1.0,
            created_at: now,
            updated_at: now,
        }
    }

    fn assignment(agent_id: &str, task_id: &str) -> Assignment {
        let now = chrono::Utc::now();
        Assignment {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            assigned_at: now,
            lease_expires_at: now + chrono::Duration::minutes(30),
            last_heartbeat: now,
            renewal_count: 0,
            status: AssignmentStatus::Active,
            metadata: serde_json::json!({}),
        }
    }

    fn setup() -> (Reconciler, Arc<FakeBoard>, Arc<AssignmentLedger>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let board = Arc::new(FakeBoard::new(vec![]));
        let ledger = Arc::new(AssignmentLedger::open(dir.path(), false));
        let events = Arc::new(EventBus::new(100));
        let reversions = Arc::new(ReversionCounts::new());
        let reconciler = Reconciler::new(board.clone(), ledger.clone(), events, reversions, 30);
        (reconciler, board, ledger, dir)
    }

    #[tokio::test]
    async fn startup_restores_orphaned_in_progress_assignment() {
        let (reconciler, board, ledger, _dir) = setup();
        board.set_task(task("t1", TaskStatus::InProgress, Some("agent-1")));

        let report = reconciler.reconcile_on_startup().await;
        assert_eq!(report.restored, 1);
        assert!(ledger.load_by_task("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn startup_removes_assignment_inconsistent_with_board() {
        let (reconciler, board, ledger, _dir) = setup();
        board.set_task(task("t1", TaskStatus::Done, Some("agent-2")));
        ledger.save("agent-1", assignment("agent-1", "t1")).await.unwrap();

        let report = reconciler.reconcile_on_startup().await;
        assert_eq!(report.removed, 1);
        assert!(ledger.load_by_task("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn startup_verifies_consistent_assignment() {
        let (reconciler, board, ledger, _dir) = setup();
        board.set_task(task("t1", TaskStatus::InProgress, Some("agent-1")));
        ledger.save("agent-1", assignment("agent-1", "t1")).await.unwrap();

        let report = reconciler.reconcile_on_startup().await;
        assert_eq!(report.verified, 1);
        assert_eq!(report.removed, 0);
    }

    #[tokio::test]
    async fn monitor_detects_reversion_to_todo_and_increments_count() {
        let (reconciler, board, ledger, _dir) = setup();
        board.set_task(task("t1", TaskStatus::Todo, None));
        ledger.save("agent-1", assignment("agent-1", "t1")).await.unwrap();

        reconciler.monitor_cycle().await;
        assert!(ledger.load_by_task("t1").await.unwrap().is_none());
        assert_eq!(reconciler.reversions.snapshot().await.get("t1"), Some(&1));
    }

    #[tokio::test]
    async fn three_reversions_trigger_problem_task_event() {
        let (reconciler, board, ledger, _dir) = setup();
        let mut sub = reconciler.events.subscribe();

        for _ in 0..3 {
            board.set_task(task("t1", TaskStatus::Todo, None));
            ledger.save("agent-1", assignment("agent-1", "t1")).await.unwrap();
            reconciler.monitor_cycle().await;
        }

        let mut saw_problem_task = false;
        while let Ok(Some(event)) = tokio::time::timeout(StdDuration::from_millis(50), sub.recv()).await {
            if event.topic == EventTopic::ProblemTask {
                saw_problem_task = true;
            }
        }
        assert!(saw_problem_task);
    }

    #[tokio::test]
    async fn monitor_removes_assignment_for_vanished_task() {
        let (reconciler, _board, ledger, _dir) = setup();
        ledger.save("agent-1", assignment("agent-1", "ghost")).await.unwrap();

        reconciler.monitor_cycle().await;
        assert!(ledger.load_by_task("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn monitor_skips_cycle_on_board_failure() {
        let (reconciler, board, ledger, _dir) = setup();
        board.set_task(task("t1", TaskStatus::InProgress, Some("agent-1")));
        ledger.save("agent-1", assignment("agent-1", "t1")).await.unwrap();
        board.set_unavailable(true);

        reconciler.monitor_cycle().await;
        assert!(ledger.load_by_task("t1").await.unwrap().is_some());
    }
}
