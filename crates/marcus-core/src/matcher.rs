//! Task Matcher (C5, §4.5): multi-phase scorer selecting the best task
//! for an agent among a safety-filtered candidate set.

use std::collections::{HashSet, VecDeque};

use marcus_db::capability::{AgentProfile, Oracle};
use marcus_db::model::{Agent, Task, TaskStatus};

use crate::graph::{classify, TaskGraph};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScoringExplanation {
    pub task_id: String,
    pub skill_score: f64,
    pub priority_score: f64,
    pub dependency_score: f64,
    pub success_prob: f64,
    pub risk: f64,
    pub total_score: f64,
    pub used_oracle: bool,
}

pub struct MatchInput<'a> {
    pub agent: &'a Agent,
    pub candidates: &'a [Task],
    pub graph: &'a TaskGraph,
    pub oracle: Option<&'a dyn Oracle>,
    /// Tasks currently under the global assignment mutex's "being
    /// offered" decision (§4.5 Phase S.c).
    pub in_flight: &'a HashSet<String>,
    /// Tasks that currently have an ACTIVE lease (§4.5 Phase S.d).
    pub actively_leased: &'a HashSet<String>,
}

/// §4.5 Phase S: drop ineligible candidates.
fn safety_filter(input: &MatchInput<'_>) -> Vec<&Task> {
    input
        .candidates
        .iter()
        .filter(|task| {
            if input.in_flight.contains(&task.task_id) || input.actively_leased.contains(&task.task_id) {
                return false;
            }
            if has_unmet_dependency(input.graph, task) {
                return false;
            }
            let class = classify(&task.name);
            if matches!(class, marcus_db::model::TaskClass::Deployment | marcus_db::model::TaskClass::Testing)
                && has_unfinished_implementation_ancestor(input.graph, task)
            {
                return false;
            }
            true
        })
        .collect()
}

fn has_unmet_dependency(graph: &TaskGraph, task: &Task) -> bool {
    task.dependencies.iter().any(|dep_id| {
        graph.get(dep_id).map(|dep| dep.status != TaskStatus::Done).unwrap_or(true)
    })
}

/// BFS over the transitive dependency closure, true if any ancestor
/// classifies as `implementation` and is not yet DONE.
fn has_unfinished_implementation_ancestor(graph: &TaskGraph, task: &Task) -> bool {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = task.dependencies.iter().cloned().collect();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let Some(dep_task) = graph.get(&id) else { continue };
        if classify(&dep_task.name) == marcus_db::model::TaskClass::Implementation && dep_task.status != TaskStatus::Done {
            return true;
        }
        for next in &dep_task.dependencies {
            queue.push_back(next.clone());
        }
    }
    false
}

/// §4.5 Phase D: fraction of dependents this task alone would unblock.
fn dependency_score(graph: &TaskGraph, task: &Task) -> f64 {
    let dependents = graph.dependents_of(&task.task_id);
    let unblock_count = dependents
        .iter()
        .filter(|dependent_id| {
            let Some(dependent) = graph.get(dependent_id) else { return false };
            let remaining_blockers = dependent
                .dependencies
                .iter()
                .filter(|dep_id| graph.get(dep_id).map(|d| d.status != TaskStatus::Done).unwrap_or(true))
                .count();
            remaining_blockers == 1 && dependent.dependencies.iter().any(|d| d == &task.task_id)
        })
        .count();
    (unblock_count as f64 / 5.0).min(1.0)
}

fn skill_score(agent: &Agent, task: &Task) -> f64 {
    if task.labels.is_empty() {
        return 0.0;
    }
    let agent_skills: HashSet<&str> = agent.skills.iter().map(|s| s.as_str()).collect();
    let overlap = task.labels.iter().filter(|l| agent_skills.contains(l.as_str())).count();
    overlap as f64 / task.labels.len().max(1) as f64
}

fn tie_break_key(task: &Task) -> (std::cmp::Reverse<u8>, chrono::DateTime<chrono::Utc>, String) {
    let priority_rank = match task.priority {
        marcus_db::model::Priority::Critical => 3,
        marcus_db::model::Priority::High => 2,
        marcus_db::model::Priority::Medium => 1,
        marcus_db::model::Priority::Low => 0,
    };
    (std::cmp::Reverse(priority_rank), task.created_at, task.task_id.clone())
}

/// Run the full matcher (§4.5) and return the chosen task with its
/// scoring explanation, or `None` if no candidate survives Phase S.
pub async fn match_task(input: MatchInput<'_>) -> Option<(Task, ScoringExplanation)> {
    let survivors = safety_filter(&input);
    if survivors.is_empty() {
        return None;
    }

    let mut scored: Vec<(Task, ScoringExplanation)> = Vec::with_capacity(survivors.len());
    for task in survivors {
        let skill = skill_score(input.agent, task);
        let priority = task.priority.score();
        let dep_score = dependency_score(input.graph, task);

        let (success_prob, risk, used_oracle, total) = if let Some(oracle) = input.oracle {
            let profile = AgentProfile {
                agent_id: input.agent.agent_id.clone(),
                skills: input.agent.skills.clone(),
                performance_score: input.agent.performance_score,
                completed: input.agent.completed,
                failed: input.agent.failed,
            };
            match oracle.score_task_for_agent(&profile, task).await {
                Ok(score) => {
                    let total =
                        0.15 * skill + 0.15 * priority + 0.25 * dep_score + 0.30 * score.success_prob + 0.15 * (1.0 - score.risk);
                    (score.success_prob, score.risk, true, total)
                }
                Err(_) => {
                    let total = 0.30 * skill + 0.30 * priority + 0.40 * dep_score;
                    (0.5, 0.5, false, total)
                }
            }
        } else {
            let total = 0.30 * skill + 0.30 * priority + 0.40 * dep_score;
            (0.5, 0.5, false, total)
        };

        scored.push((
            task.clone(),
            ScoringExplanation {
                task_id: task.task_id.clone(),
                skill_score: skill,
                priority_score: priority,
                dependency_score: dep_score,
                success_prob,
                risk,
                total_score: total,
                used_oracle,
            },
        ));
    }

    scored.sort_by(|(task_a, exp_a), (task_b, exp_b)| {
        exp_b
            .total_score
            .partial_cmp(&exp_a.total_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| tie_break_key(task_a).cmp(&tie_break_key(task_b)))
    });

    scored.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use marcus_db::model::Priority;
    use marcus_test_utils::FakeOracle;

    fn task(id: &str, name: &str, status: TaskStatus, priority: Priority, deps: &[&str], labels: &[&str]) -> Task {
        let now = Utc::now();
        Task {
            task_id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            status,
            priority,
            assigned_to: None,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            estimated_hours: 1.0,
            created_at: now,
            updated_at: now,
        }
    }

    fn agent(skills: &[&str]) -> Agent {
        Agent::new("agent-1", "Agent One", "engineer", skills.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn unmet_dependency_is_filtered_out() {
        let mut graph = TaskGraph::new();
        graph.upsert(task("dep", "Design schema", TaskStatus::Todo, Priority::Medium, &[], &[]));
        let t = task("t1", "Implement schema", TaskStatus::Todo, Priority::Medium, &["dep"], &[]);
        graph.upsert(t.clone());

        let input = MatchInput {
            agent: &agent(&[]),
            candidates: &[t],
            graph: &graph,
            oracle: None,
            in_flight: &HashSet::new(),
            actively_leased: &HashSet::new(),
        };
        assert!(match_task(input).await.is_none());
    }

    #[tokio::test]
    async fn deployment_task_blocked_by_unfinished_implementation_ancestor() {
        let mut graph = TaskGraph::new();
        graph.upsert(task("impl", "Implement service", TaskStatus::Todo, Priority::Medium, &[], &[]));
        let deploy = task("deploy", "Deploy service", TaskStatus::Todo, Priority::Medium, &["impl"], &[]);
        graph.upsert(deploy.clone());

        let input = MatchInput {
            agent: &agent(&[]),
            candidates: &[deploy],
            graph: &graph,
            oracle: None,
            in_flight: &HashSet::new(),
            actively_leased: &HashSet::new(),
        };
        assert!(match_task(input).await.is_none());
    }

    #[tokio::test]
    async fn picks_highest_scoring_candidate_without_oracle() {
        let mut graph = TaskGraph::new();
        let low = task("low", "Write docs", TaskStatus::Todo, Priority::Low, &[], &[]);
        let high = task("high", "Fix critical bug", TaskStatus::Todo, Priority::Critical, &[], &[]);
        graph.upsert(low.clone());
        graph.upsert(high.clone());

        let input = MatchInput {
            agent: &agent(&[]),
            candidates: &[low, high.clone()],
            graph: &graph,
            oracle: None,
            in_flight: &HashSet::new(),
            actively_leased: &HashSet::new(),
        };
        let (chosen, explanation) = match_task(input).await.unwrap();
        assert_eq!(chosen.task_id, "high");
        assert!(!explanation.used_oracle);
    }

    #[tokio::test]
    async fn in_flight_and_actively_leased_tasks_are_excluded() {
        let mut graph = TaskGraph::new();
        let t = task("t1", "Do work", TaskStatus::Todo, Priority::Medium, &[], &[]);
        graph.upsert(t.clone());

        let mut in_flight = HashSet::new();
        in_flight.insert("t1".to_string());

        let input = MatchInput {
            agent: &agent(&[]),
            candidates: &[t],
            graph: &graph,
            oracle: None,
            in_flight: &in_flight,
            actively_leased: &HashSet::new(),
        };
        assert!(match_task(input).await.is_none());
    }

    #[tokio::test]
    async fn oracle_failure_falls_back_to_no_oracle_weights() {
        let mut graph = TaskGraph::new();
        let t = task("t1", "Do work", TaskStatus::Todo, Priority::Medium, &[], &[]);
        graph.upsert(t.clone());
        let oracle = FakeOracle::new();
        oracle.set_unavailable(true);

        let input = MatchInput {
            agent: &agent(&[]),
            candidates: &[t],
            graph: &graph,
            oracle: Some(&oracle),
            in_flight: &HashSet::new(),
            actively_leased: &HashSet::new(),
        };
        let (_, explanation) = match_task(input).await.unwrap();
        assert!(!explanation.used_oracle);
        assert_eq!(explanation.success_prob, 0.5);
    }

    #[test]
    fn skill_score_is_overlap_over_label_count() {
        let a = agent(&["rust", "api"]);
        let t = task("t1", "Build API", TaskStatus::Todo, Priority::Medium, &[], &["api", "database"]);
        assert_eq!(skill_score(&a, &t), 0.5);
    }
}
