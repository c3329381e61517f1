//! Context Builder (C7, §4.7): deterministic, layered instruction
//! payload handed to an agent alongside an assigned task.

use marcus_db::capability::{Board, Oracle};
use marcus_db::model::{Agent, Task};
use serde::Serialize;

use crate::graph::TaskGraph;

#[derive(Debug, Clone, Serialize)]
pub struct PreviousImplementation {
    pub dependency_task_id: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependentTask {
    pub task_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Predictions {
    pub success_prob: f64,
    pub expected_hours: f64,
    pub risk: f64,
    pub top_blockers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextPayload {
    pub task_id: String,
    pub task_name: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub previous_implementations: Vec<PreviousImplementation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<DependentTask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_logging_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predictions: Option<Predictions>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub label_guidance: Vec<String>,
}

fn acceptance_criteria_for(task: &Task) -> Vec<String> {
    let mut criteria = vec![format!("\"{}\" is complete and verifiably working.", task.name)];
    for label in &task.labels {
        criteria.push(match label.as_str() {
            "api" => "All new/changed endpoints are documented and return well-formed error responses.".to_string(),
            "frontend" => "The UI change is reachable from the relevant screen and handles loading/error states.".to_string(),
            "database" => "Schema changes are backward compatible or shipped with a migration.".to_string(),
            "security" => "No secrets, tokens, or credentials are introduced in logs or responses.".to_string(),
            "deployment" => "The change is deployable via the existing pipeline without manual steps.".to_string(),
            other => format!("Satisfies the `{other}` label's implicit requirements."),
        });
    }
    criteria
}

const LABEL_GUIDANCE: &[(&str, &str)] = &[
    ("api", "API checklist: version the contract, validate inputs, document error codes."),
    ("frontend", "Frontend checklist: handle loading/empty/error states, check accessibility of new controls."),
    ("database", "Database checklist: write a reversible migration, avoid blocking locks on large tables."),
    ("security", "Security checklist: least privilege, no secrets in logs, validate all external input."),
    ("deployment", "Deployment checklist: confirm rollback path, verify health checks before declaring success."),
];

pub struct ContextBuilder<'a> {
    board: &'a dyn Board,
    oracle: Option<&'a dyn Oracle>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(board: &'a dyn Board, oracle: Option<&'a dyn Oracle>) -> Self {
        Self { board, oracle }
    }

    /// Build the layered payload for `task` (§4.7). Each layer is
    /// included only if its precondition holds; the result is
    /// byte-identical for byte-identical inputs because the only
    /// non-deterministic sources (the Board and the Oracle) are called
    /// exactly once and their results folded directly into the output.
    pub async fn build(&self, agent: &Agent, task: &Task, graph: &TaskGraph) -> ContextPayload {
        let mut payload = ContextPayload {
            task_id: task.task_id.clone(),
            task_name: task.name.clone(),
            description: task.description.clone(),
            acceptance_criteria: acceptance_criteria_for(task),
            previous_implementations: Vec::new(),
            dependents: Vec::new(),
            decision_logging_prompt: None,
            predictions: None,
            label_guidance: Vec::new(),
        };

        // Layer 2: previous implementations of completed dependencies.
        for dep_id in &task.dependencies {
            let Some(dep) = graph.get(dep_id) else { continue };
            if dep.status != marcus_db::model::TaskStatus::Done {
                continue;
            }
            if let Ok(history) = self.board.get_implementation_history(dep_id).await {
                for entry in history {
                    payload.previous_implementations.push(PreviousImplementation {
                        dependency_task_id: dep_id.clone(),
                        summary: entry.summary,
                    });
                }
            }
        }

        // Layer 3: dependency awareness.
        let dependent_ids = graph.dependents_of(&task.task_id);
        let mut dependents: Vec<DependentTask> = dependent_ids
            .iter()
            .filter_map(|id| graph.get(id))
            .map(|t| DependentTask { task_id: t.task_id.clone(), name: t.name.clone() })
            .collect();
        dependents.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        let dependent_count = dependents.len();
        payload.dependents = dependents;

        // Layer 4: decision logging, gated on fan-out or critical path.
        let on_critical_path = graph.critical_path().iter().any(|id| id == &task.task_id);
        if dependent_count >= 3 || on_critical_path {
            payload.decision_logging_prompt = Some(
                "This task has significant downstream impact. Record any architectural decisions \
                 and the reasoning behind them in your final report."
                    .to_string(),
            );
        }

        // Layer 5: predictions, only if an Oracle is configured.
        if let Some(oracle) = self.oracle {
            let profile = marcus_db::capability::AgentProfile {
                agent_id: agent.agent_id.clone(),
                skills: agent.skills.clone(),
                performance_score: agent.performance_score,
                completed: agent.completed,
                failed: agent.failed,
            };
            if let Ok(score) = oracle.score_task_for_agent(&profile, task).await {
                let top_blockers: Vec<String> = task
                    .dependencies
                    .iter()
                    .filter(|id| graph.get(id).map(|d| d.status != marcus_db::model::TaskStatus::Done).unwrap_or(false))
                    .cloned()
                    .collect();
                payload.predictions = Some(Predictions {
                    success_prob: score.success_prob,
                    expected_hours: score.expected_hours,
                    risk: score.risk,
                    top_blockers,
                });
            }
        }

        // Layer 6: label-specific guidance, in a fixed order.
        for (label, guidance) in LABEL_GUIDANCE {
            if task.labels.iter().any(|l| l == label) {
                payload.label_guidance.push(guidance.to_string());
            }
        }

        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marcus_db::capability::{ImplementationEntry, TaskScore};
    use marcus_db::model::{Priority, TaskStatus};
    use marcus_test_utils::{FakeBoard, FakeOracle};

    fn task(id: &str, deps: &[&str], labels: &[&str], hours: f64) -> Task {
        let now = chrono::Utc::now();
        Task {
            task_id: id.to_string(),
            name: format!("Task {id}"),
            description: "do the thing".to_string(),
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            assigned_to: None,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            estimated_hours: hours,
            created_at: now,
            updated_at: now,
        }
    }

    fn agent() -> Agent {
        Agent::new("agent-1", "Agent One", "engineer", vec![])
    }

    #[tokio::test]
    async fn base_layer_always_present() {
        let board = FakeBoard::new(vec![]);
        let builder = ContextBuilder::new(&board, None);
        let graph = TaskGraph::new();
        let t = task("t1", &[], &[], 1.0);
        let payload = builder.build(&agent(), &t, &graph).await;
        assert_eq!(payload.task_id, "t1");
        assert!(!payload.acceptance_criteria.is_empty());
        assert!(payload.predictions.is_none());
    }

    #[tokio::test]
    async fn previous_implementations_included_for_done_dependency() {
        let board = FakeBoard::new(vec![]);
        board.set_history("dep", vec![ImplementationEntry { task_id: "dep".into(), summary: "used postgres".into() }]);
        let builder = ContextBuilder::new(&board, None);

        let mut graph = TaskGraph::new();
        let mut dep = task("dep", &[], &[], 1.0);
        dep.status = TaskStatus::Done;
        graph.upsert(dep);
        let t = task("t1", &["dep"], &[], 1.0);
        graph.upsert(t.clone());

        let payload = builder.build(&agent(), &t, &graph).await;
        assert_eq!(payload.previous_implementations.len(), 1);
        assert_eq!(payload.previous_implementations[0].summary, "used postgres");
    }

    #[tokio::test]
    async fn decision_logging_prompt_appears_with_three_or_more_dependents() {
        let board = FakeBoard::new(vec![]);
        let builder = ContextBuilder::new(&board, None);
        let mut graph = TaskGraph::new();
        let t = task("core", &[], &[], 1.0);
        graph.upsert(t.clone());
        for i in 0..3 {
            graph.upsert(task(&format!("d{i}"), &["core"], &[], 1.0));
        }

        let payload = builder.build(&agent(), &t, &graph).await;
        assert!(payload.decision_logging_prompt.is_some());
        assert_eq!(payload.dependents.len(), 3);
    }

    #[tokio::test]
    async fn predictions_present_when_oracle_available() {
        let board = FakeBoard::new(vec![]);
        let oracle = FakeOracle::new();
        oracle.stage_score("t1", TaskScore { success_prob: 0.8, risk: 0.1, expected_hours: 3.0 });
        let builder = ContextBuilder::new(&board, Some(&oracle));

        let mut graph = TaskGraph::new();
        let t = task("t1", &[], &[], 1.0);
        graph.upsert(t.clone());

        let payload = builder.build(&agent(), &t, &graph).await;
        let predictions = payload.predictions.unwrap();
        assert_eq!(predictions.success_prob, 0.8);
    }

    #[tokio::test]
    async fn label_guidance_follows_fixed_label_order() {
        let board = FakeBoard::new(vec![]);
        let builder = ContextBuilder::new(&board, None);
        let mut graph = TaskGraph::new();
        let t = task("t1", &[], &["security", "api"], 1.0);
        graph.upsert(t.clone());

        let payload = builder.build(&agent(), &t, &graph).await;
        assert_eq!(payload.label_guidance.len(), 2);
        assert!(payload.label_guidance[0].starts_with("API checklist"));
        assert!(payload.label_guidance[1].starts_with("Security checklist"));
    }
}
