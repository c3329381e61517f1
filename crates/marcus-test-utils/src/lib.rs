//! In-memory `Board` and `Oracle` test doubles plus ledger fixtures.
//!
//! There is no database to spin up for this system, so unlike the
//! teacher's shared-Postgres-container test utilities, everything here
//! is process-local: a `Mutex`-guarded `HashMap` standing in for the
//! Board, and a scriptable `Oracle` double. Tests drive out-of-band
//! board changes (for reconciliation/reversion scenarios) by calling
//! `FakeBoard::set_task`/`remove_task` directly, simulating a human or
//! another process editing the kanban board between core polls.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use marcus_db::capability::{AgentProfile, Board, ImplementationEntry, Oracle, PairDirection, PairInference, TaskPatch, TaskScore};
use marcus_db::model::Task;

/// An in-memory Board double. Tasks are mutated directly by tests to
/// model out-of-band board changes; [`Board::update_task`] mutates the
/// same map, exactly as a real provider would reflect the core's writes.
#[derive(Default)]
pub struct FakeBoard {
    state: Mutex<BoardState>,
}

#[derive(Default)]
struct BoardState {
    tasks: HashMap<String, Task>,
    comments: Vec<(String, String)>,
    history: HashMap<String, Vec<ImplementationEntry>>,
    /// When `true`, calls return an error to simulate `BoardUnavailable`.
    unavailable: bool,
}

impl FakeBoard {
    pub fn new(tasks: Vec<Task>) -> Self {
        let state = BoardState {
            tasks: tasks.into_iter().map(|t| (t.task_id.clone(), t)).collect(),
            ..Default::default()
        };
        Self { state: Mutex::new(state) }
    }

    pub fn set_task(&self, task: Task) {
        self.state.lock().unwrap().tasks.insert(task.task_id.clone(), task);
    }

    pub fn remove_task(&self, task_id: &str) {
        self.state.lock().unwrap().tasks.remove(task_id);
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.state.lock().unwrap().tasks.get(task_id).cloned()
    }

    pub fn comments_for(&self, task_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .comments
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn set_history(&self, task_id: &str, entries: Vec<ImplementationEntry>) {
        self.state.lock().unwrap().history.insert(task_id.to_string(), entries);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }
}

#[async_trait]
impl Board for FakeBoard {
    async fn list_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            anyhow::bail!("board unavailable");
        }
        Ok(state.tasks.values().cloned().collect())
    }

    async fn update_task(&self, task_id: &str, patch: TaskPatch) -> anyhow::Result<()> {
        let (comment, unavailable) = {
            let mut state = self.state.lock().unwrap();
            if state.unavailable {
                anyhow::bail!("board unavailable");
            }
            let Some(task) = state.tasks.get_mut(task_id) else {
                anyhow::bail!("unknown task: {task_id}");
            };
            if let Some(status) = patch.status {
                task.status = status;
            }
            if let Some(assigned_to) = patch.assigned_to {
                task.assigned_to = assigned_to;
            }
            task.updated_at = chrono::Utc::now();
            (patch.comment, state.unavailable)
        };
        if let Some(comment) = comment {
            if !unavailable {
                self.add_comment(task_id, &comment).await?;
            }
        }
        Ok(())
    }

    async fn add_comment(&self, task_id: &str, text: &str) -> anyhow::Result<()> {
        self.state.lock().unwrap().comments.push((task_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn get_implementation_history(&self, task_id: &str) -> anyhow::Result<Vec<ImplementationEntry>> {
        Ok(self.state.lock().unwrap().history.get(task_id).cloned().unwrap_or_default())
    }
}

/// A scriptable Oracle double. Defaults to neutral 0.5/0.5 scores and
/// `none` direction for every pair unless a canned response was staged.
#[derive(Default)]
pub struct FakeOracle {
    state: Mutex<OracleState>,
}

#[derive(Default)]
struct OracleState {
    pair_responses: HashMap<(String, String), PairInference>,
    score_responses: HashMap<String, TaskScore>,
    unavailable: bool,
}

impl FakeOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage_pair(&self, a: &str, b: &str, inference: PairInference) {
        self.state.lock().unwrap().pair_responses.insert((a.to_string(), b.to_string()), inference);
    }

    pub fn stage_score(&self, task_id: &str, score: TaskScore) {
        self.state.lock().unwrap().score_responses.insert(task_id.to_string(), score);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }
}

#[async_trait]
impl Oracle for FakeOracle {
    async fn infer_pairs(&self, batch: &[(String, String)]) -> anyhow::Result<Vec<PairInference>> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            anyhow::bail!("oracle unavailable");
        }
        Ok(batch
            .iter()
            .map(|(a, b)| {
                state
                    .pair_responses
                    .get(&(a.clone(), b.clone()))
                    .cloned()
                    .unwrap_or(PairInference {
                        direction: PairDirection::None,
                        confidence: 0.0,
                        reasoning: "no staged response".to_string(),
                    })
            })
            .collect())
    }

    async fn score_task_for_agent(&self, _agent: &AgentProfile, task: &Task) -> anyhow::Result<TaskScore> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            anyhow::bail!("oracle unavailable");
        }
        Ok(state.score_responses.get(&task.task_id).copied().unwrap_or(TaskScore {
            success_prob: 0.5,
            risk: 0.5,
            expected_hours: 1.0,
        }))
    }
}
