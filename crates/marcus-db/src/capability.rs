//! Capability interfaces for the core's external collaborators (§6.1, §6.2).
//!
//! The core never talks to a concrete kanban provider or inference
//! service directly; it depends only on these traits. Both are
//! object-safe so they can be stored as `Arc<dyn Board>` / `Arc<dyn Oracle>`
//! in the composition root.

use async_trait::async_trait;

use crate::model::Task;

/// A single implementation-history entry for a completed dependency,
/// surfaced to the Context Builder (§4.7 layer 2).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ImplementationEntry {
    pub task_id: String,
    pub summary: String,
}

/// Direction of an inferred pairwise dependency (§4.2 Oracle pass).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PairDirection {
    AToB,
    BToA,
    None,
}

/// Result of asking the Oracle to resolve one ambiguous pair.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PairInference {
    pub direction: PairDirection,
    pub confidence: f64,
    pub reasoning: String,
}

/// Result of asking the Oracle to score a task for an agent (§4.5 Phase I).
#[derive(Debug, Clone, Copy)]
pub struct TaskScore {
    pub success_prob: f64,
    pub risk: f64,
    pub expected_hours: f64,
}

/// Minimal agent profile passed to the Oracle for scoring.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub agent_id: String,
    pub skills: Vec<String>,
    pub performance_score: f64,
    pub completed: u64,
    pub failed: u64,
}

/// External kanban provider (§6.1).
///
/// Implementations must return a consistent snapshot from [`Board::list_tasks`];
/// the Reconciler (C6) tolerates interleaved updates across calls but the
/// core never assumes partial consistency within one call.
#[async_trait]
pub trait Board: Send + Sync {
    /// Full snapshot of all tasks known to the provider.
    async fn list_tasks(&self) -> anyhow::Result<Vec<Task>>;

    /// Apply a patch to a task: any of `status`, `assigned_to`, `comment`.
    async fn update_task(&self, task_id: &str, patch: TaskPatch) -> anyhow::Result<()>;

    /// Append a comment to a task's activity log.
    async fn add_comment(&self, task_id: &str, text: &str) -> anyhow::Result<()>;

    /// Optional: prior implementation summaries for a completed task.
    /// Default implementation reports none available.
    async fn get_implementation_history(&self, _task_id: &str) -> anyhow::Result<Vec<ImplementationEntry>> {
        Ok(Vec::new())
    }
}

/// A patch applied via [`Board::update_task`]. Every field is optional;
/// `None` means "leave unchanged".
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<crate::model::TaskStatus>,
    pub assigned_to: Option<Option<String>>,
    pub comment: Option<String>,
}

/// External AI inference service (§6.2). Optional: every caller must
/// degrade gracefully when no Oracle is configured or a call fails.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Resolve a batch of ambiguous task-name pairs.
    async fn infer_pairs(&self, batch: &[(String, String)]) -> anyhow::Result<Vec<PairInference>>;

    /// Score a task for a candidate agent.
    async fn score_task_for_agent(&self, agent: &AgentProfile, task: &Task) -> anyhow::Result<TaskScore>;
}

// Compile-time assertions: both capability traits must be object-safe.
const _: () = {
    fn _assert_board_object_safe(_: &dyn Board) {}
    fn _assert_oracle_object_safe(_: &dyn Oracle) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, Task, TaskStatus};
    use chrono::Utc;

    struct NoopBoard;

    #[async_trait]
    impl Board for NoopBoard {
        async fn list_tasks(&self) -> anyhow::Result<Vec<Task>> {
            Ok(Vec::new())
        }

        async fn update_task(&self, _task_id: &str, _patch: TaskPatch) -> anyhow::Result<()> {
            Ok(())
        }

        async fn add_comment(&self, _task_id: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoopOracle;

    #[async_trait]
    impl Oracle for NoopOracle {
        async fn infer_pairs(&self, _batch: &[(String, String)]) -> anyhow::Result<Vec<PairInference>> {
            Ok(Vec::new())
        }

        async fn score_task_for_agent(&self, _agent: &AgentProfile, _task: &Task) -> anyhow::Result<TaskScore> {
            Ok(TaskScore {
                success_prob: 0.5,
                risk: 0.5,
                expected_hours: 1.0,
            })
        }
    }

    #[test]
    fn board_and_oracle_are_object_safe() {
        let board: Box<dyn Board> = Box::new(NoopBoard);
        let oracle: Box<dyn Oracle> = Box::new(NoopOracle);
        let _ = (board, oracle);
    }

    #[tokio::test]
    async fn noop_board_returns_empty_snapshot() {
        let board = NoopBoard;
        assert!(board.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn noop_oracle_has_neutral_defaults() {
        let oracle = NoopOracle;
        let agent = AgentProfile {
            agent_id: "a1".into(),
            skills: vec![],
            performance_score: 0.5,
            completed: 0,
            failed: 0,
        };
        let task = Task {
            task_id: "t1".into(),
            name: "n".into(),
            description: "d".into(),
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            assigned_to: None,
            dependencies: vec![],
            labels: vec![],
            estimated_hours: 1.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let score = oracle.score_task_for_agent(&agent, &task).await.unwrap();
        assert_eq!(score.success_prob, 0.5);
        assert_eq!(score.risk, 0.5);
    }
}
