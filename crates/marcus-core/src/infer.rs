//! Dependency Inferer (C2, §4.2): hybrid pattern + Oracle dependency
//! inference, producing a validated, acyclic edge set with confidences.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use marcus_db::cache::DependencyCache;
use marcus_db::capability::{Oracle, PairDirection};
use marcus_db::model::{DependencyEdge, DependencyOrigin, Task, TaskStatus};

use crate::error::{CoreError, CoreResult};
use crate::graph::classify;

/// Named threshold profiles (§4.2 "Configuration presets"). `PatternOnly`
/// disables the Oracle pass entirely regardless of whether an Oracle is
/// configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferPreset {
    Conservative,
    Balanced,
    Aggressive,
    CostOptimized,
    PatternOnly,
}

impl Default for InferPreset {
    fn default() -> Self {
        Self::Balanced
    }
}

/// Resolved inference thresholds, either taken directly from a preset or
/// overridden individually (§6.5).
#[derive(Debug, Clone, Copy)]
pub struct InferConfig {
    pub preset: InferPreset,
    pub pattern_confidence_threshold: f64,
    pub ai_confidence_threshold: f64,
    pub combined_confidence_boost: f64,
    pub max_ai_pairs_per_batch: usize,
    pub cache_ttl_hours: i64,
}

impl InferConfig {
    pub fn from_preset(preset: InferPreset) -> Self {
        let (pattern_confidence_threshold, ai_confidence_threshold, max_ai_pairs_per_batch) = match preset {
            InferPreset::Conservative => (0.9, 0.85, 10),
            InferPreset::Balanced => (0.8, 0.7, 20),
            InferPreset::Aggressive => (0.6, 0.55, 40),
            InferPreset::CostOptimized => (0.85, 0.75, 50),
            InferPreset::PatternOnly => (0.8, 1.1, 20), // ai threshold > 1.0 is unreachable; oracle pass is skipped anyway
        };
        Self {
            preset,
            pattern_confidence_threshold,
            ai_confidence_threshold,
            combined_confidence_boost: 0.15,
            max_ai_pairs_per_batch,
            cache_ttl_hours: 24,
        }
    }
}

impl Default for InferConfig {
    fn default() -> Self {
        Self::from_preset(InferPreset::default())
    }
}

struct Pattern {
    name: &'static str,
    cond_words: &'static [&'static str],
    dep_words: &'static [&'static str],
    confidence: f64,
    mandatory: bool,
    component_scoped: bool,
}

/// The five canonical safety patterns from §4.2. "Infrastructure before
/// features" and "backend before frontend" are not `TaskClass` categories,
/// so their keyword lists are defined here directly (an implementation
/// choice recorded in DESIGN.md, since the spec names the patterns but
/// does not enumerate literal keyword lists for them).
fn patterns() -> &'static [Pattern] {
    const PATTERNS: &[Pattern] = &[
        Pattern {
            name: "infrastructure before features",
            cond_words: &["infrastructure", "infra", "setup", "scaffold", "environment", "pipeline", "provision"],
            dep_words: &["feature", "endpoint"],
            confidence: 0.95,
            mandatory: true,
            component_scoped: false,
        },
        Pattern {
            name: "design before implementation",
            cond_words: &["design", "plan", "architect", "wireframe", "spec", "research", "analyze"],
            dep_words: &["implement", "build", "create", "develop", "code", "write"],
            confidence: 0.95,
            mandatory: true,
            component_scoped: false,
        },
        Pattern {
            name: "implementation before testing",
            cond_words: &["implement", "build", "create", "develop", "code", "write"],
            dep_words: &["test", "qa", "quality", "verify", "validation", "check"],
            confidence: 0.95,
            mandatory: true,
            component_scoped: false,
        },
        Pattern {
            name: "testing before deployment",
            cond_words: &["test", "qa", "quality", "verify", "validation", "check"],
            dep_words: &["deploy", "release", "launch", "production", "publish"],
            confidence: 0.95,
            mandatory: true,
            component_scoped: false,
        },
        Pattern {
            name: "backend before frontend",
            cond_words: &["backend", "api", "server"],
            dep_words: &["frontend", "ui", "client"],
            confidence: 0.85,
            mandatory: false,
            component_scoped: true,
        },
    ];
    PATTERNS
}

const STOPWORDS: &[&str] = &["the", "a", "an", "of", "for", "to", "and", "or", "in", "on", "with", "is", "are"];
const TECH_KEYWORDS: &[&str] = &["api", "database", "frontend", "backend", "auth", "user", "admin"];

fn name_has_any(name: &str, words: &[&str]) -> bool {
    let lower = name.to_lowercase();
    words.iter().any(|w| {
        lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|token| token == *w)
    })
}

fn tokens(name: &str) -> HashSet<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Apply the §4.2 logical predicate to a candidate `dependency -> dependent`
/// edge. Returns `true` if the edge is valid.
fn logical_predicate_holds(dependency: &Task, dependent: &Task, check_class_order: bool) -> bool {
    if check_class_order {
        let dep_class = classify(&dependency.name);
        let dependent_class = classify(&dependent.name);
        if !(dep_class.order() < dependent_class.order()) {
            return false;
        }
    }
    // (b): a dependency that is already DONE should not be retroactively
    // attached to a brand-new (TODO) dependent task.
    if dependency.status == TaskStatus::Done && dependent.status == TaskStatus::Todo {
        return false;
    }
    true
}

/// Run the pattern pass over every ordered pair, returning validated
/// pattern edges plus the set of pairs that did not get a confident hit
/// (candidates for the ambiguity/Oracle pass).
fn pattern_pass(tasks: &[Task]) -> (Vec<DependencyEdge>, Vec<(usize, usize)>) {
    let mut edges = Vec::new();
    let mut undecided = Vec::new();

    for (i, a) in tasks.iter().enumerate() {
        for (j, b) in tasks.iter().enumerate() {
            if i == j {
                continue;
            }
            let mut matched = false;
            for pattern in patterns() {
                if pattern.component_scoped {
                    let shared = tokens(&a.name).intersection(&tokens(&b.name)).count();
                    if shared == 0 {
                        continue;
                    }
                }
                if name_has_any(&a.name, pattern.cond_words) && name_has_any(&b.name, pattern.dep_words) {
                    let check_class_order = !pattern.component_scoped && pattern.name != "infrastructure before features";
                    if logical_predicate_holds(a, b, check_class_order) {
                        edges.push(DependencyEdge {
                            dependency_task_id: a.task_id.clone(),
                            dependent_task_id: b.task_id.clone(),
                            confidence: pattern.confidence,
                            mandatory: pattern.mandatory,
                            origin: DependencyOrigin::Pattern,
                            reasoning: format!("pattern: {}", pattern.name),
                        });
                        matched = true;
                        break;
                    }
                }
            }
            if !matched {
                undecided.push((i, j));
            }
        }
    }
    (edges, undecided)
}

/// §4.2 step 2: is this pair ambiguous enough to send to the Oracle?
fn is_ambiguous(a: &Task, b: &Task, pattern_edges: &[DependencyEdge]) -> bool {
    let has_high_confidence_hit = pattern_edges.iter().any(|e| {
        (e.dependency_task_id == a.task_id && e.dependent_task_id == b.task_id) && e.confidence >= 0.9
    });
    if has_high_confidence_hit {
        return false;
    }
    let shared_tokens = tokens(&a.name).intersection(&tokens(&b.name)).count();
    let shares_tech_keyword = TECH_KEYWORDS.iter().any(|kw| name_has_any(&a.name, &[kw]) && name_has_any(&b.name, &[kw]));
    shared_tokens >= 2 || shares_tech_keyword
}

pub struct DependencyInferer {
    config: InferConfig,
    oracle: Option<Arc<dyn Oracle>>,
    cache: Arc<DependencyCache>,
}

impl DependencyInferer {
    pub fn new(config: InferConfig, oracle: Option<Arc<dyn Oracle>>, cache: Arc<DependencyCache>) -> Self {
        Self { config, oracle, cache }
    }

    /// Run the full inference algorithm (§4.2 steps 1-6) and return a
    /// validated, acyclic edge set.
    pub async fn infer(&self, tasks: &[Task]) -> CoreResult<Vec<DependencyEdge>> {
        let (pattern_edges, undecided) = pattern_pass(tasks);

        let ambiguous_pairs: Vec<(usize, usize)> = undecided
            .into_iter()
            .filter(|&(i, j)| is_ambiguous(&tasks[i], &tasks[j], &pattern_edges))
            .collect();

        let cache_key_tasks: Vec<(&str, &str, &str)> =
            tasks.iter().map(|t| (t.task_id.as_str(), t.name.as_str(), t.description.as_str())).collect();
        let cache_key_pairs: Vec<(String, String)> = ambiguous_pairs
            .iter()
            .map(|&(i, j)| (tasks[i].task_id.clone(), tasks[j].task_id.clone()))
            .collect();
        let cache_key = DependencyCache::key(&cache_key_tasks, &cache_key_pairs);

        let oracle_edges = if self.config.preset == InferPreset::PatternOnly || self.oracle.is_none() || ambiguous_pairs.is_empty() {
            Vec::new()
        } else if let Ok(Some(fresh)) = self.cache.get_fresh(&cache_key, self.config.cache_ttl_hours).await {
            tracing::debug!(cache_key = %cache_key, "dependency cache hit");
            fresh
        } else {
            match self.run_oracle_pass(tasks, &ambiguous_pairs).await {
                Ok(edges) => {
                    let _ = self.cache.put(&cache_key, edges.clone()).await;
                    edges
                }
                Err(e) => {
                    tracing::warn!(error = %e, "oracle pass failed, falling back");
                    match self.cache.get_stale(&cache_key).await {
                        Ok(Some(stale)) => stale,
                        _ => Vec::new(),
                    }
                }
            }
        };

        let merged = self.merge(pattern_edges, oracle_edges);
        self.break_cycles(tasks, merged)
    }

    async fn run_oracle_pass(&self, tasks: &[Task], pairs: &[(usize, usize)]) -> anyhow::Result<Vec<DependencyEdge>> {
        let oracle = self.oracle.as_ref().expect("checked by caller");
        let mut edges = Vec::new();
        for batch in pairs.chunks(self.config.max_ai_pairs_per_batch) {
            let batch_ids: Vec<(String, String)> =
                batch.iter().map(|&(i, j)| (tasks[i].task_id.clone(), tasks[j].task_id.clone())).collect();
            let results = oracle.infer_pairs(&batch_ids).await?;
            for (&(i, j), result) in batch.iter().zip(results) {
                if result.confidence < self.config.ai_confidence_threshold {
                    continue;
                }
                let (dep, dependent) = match result.direction {
                    PairDirection::AToB => (&tasks[i], &tasks[j]),
                    PairDirection::BToA => (&tasks[j], &tasks[i]),
                    PairDirection::None => continue,
                };
                edges.push(DependencyEdge {
                    dependency_task_id: dep.task_id.clone(),
                    dependent_task_id: dependent.task_id.clone(),
                    confidence: result.confidence,
                    mandatory: false,
                    origin: DependencyOrigin::Oracle,
                    reasoning: result.reasoning,
                });
            }
        }
        Ok(edges)
    }

    /// §4.2 step 4: merge pattern and oracle edges, boosting agreement
    /// and preferring the mandatory side on disagreement.
    fn merge(&self, pattern_edges: Vec<DependencyEdge>, oracle_edges: Vec<DependencyEdge>) -> Vec<DependencyEdge> {
        let mut by_pair: HashMap<(String, String), DependencyEdge> = HashMap::new();

        for edge in pattern_edges {
            by_pair.insert((edge.dependency_task_id.clone(), edge.dependent_task_id.clone()), edge);
        }

        for oracle_edge in oracle_edges {
            let key = (oracle_edge.dependency_task_id.clone(), oracle_edge.dependent_task_id.clone());
            let reverse_key = (oracle_edge.dependent_task_id.clone(), oracle_edge.dependency_task_id.clone());

            if let Some(existing) = by_pair.remove(&key) {
                // Same direction: agreement, boost confidence.
                let boosted = (existing.confidence + self.config.combined_confidence_boost).min(1.0);
                by_pair.insert(
                    key,
                    DependencyEdge {
                        confidence: boosted,
                        origin: DependencyOrigin::Both,
                        mandatory: existing.mandatory,
                        reasoning: format!("{}; confirmed by oracle", existing.reasoning),
                        ..existing
                    },
                );
            } else if let Some(existing) = by_pair.get(&reverse_key).cloned() {
                // Opposite direction: disagreement. Prefer the mandatory
                // side, else the higher-confidence side.
                if !existing.mandatory && oracle_edge.confidence > existing.confidence {
                    by_pair.remove(&reverse_key);
                    by_pair.insert(key, oracle_edge);
                }
                // else: keep the existing (mandatory or higher-confidence) edge.
            } else {
                by_pair.insert(key, oracle_edge);
            }
        }

        by_pair.into_values().collect()
    }

    /// §4.2 step 5: detect cycles and drop the lowest-confidence
    /// non-mandatory edge in each until acyclic, or fail fatally if a
    /// cycle is entirely mandatory.
    fn break_cycles(&self, tasks: &[Task], mut edges: Vec<DependencyEdge>) -> CoreResult<Vec<DependencyEdge>> {
        let task_ids: HashSet<String> = tasks.iter().map(|t| t.task_id.clone()).collect();

        loop {
            let Some(cycle) = find_cycle(&task_ids, &edges) else {
                return Ok(edges);
            };
            let droppable = cycle
                .iter()
                .filter(|e| !e.mandatory)
                .min_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal));

            match droppable {
                Some(to_drop) => {
                    let to_drop = to_drop.clone();
                    tracing::warn!(
                        dependency = %to_drop.dependency_task_id,
                        dependent = %to_drop.dependent_task_id,
                        confidence = to_drop.confidence,
                        "breaking cycle by dropping lowest-confidence edge"
                    );
                    edges.retain(|e| {
                        !(e.dependency_task_id == to_drop.dependency_task_id && e.dependent_task_id == to_drop.dependent_task_id)
                    });
                }
                None => {
                    return Err(CoreError::CircularDependencyError(format!(
                        "cycle consists entirely of mandatory edges: {:?}",
                        cycle.iter().map(|e| format!("{}->{}", e.dependency_task_id, e.dependent_task_id)).collect::<Vec<_>>()
                    )));
                }
            }
        }
    }
}

/// Find one cycle in the edge set, if any, returning the edges along it.
fn find_cycle(task_ids: &HashSet<String>, edges: &[DependencyEdge]) -> Option<Vec<DependencyEdge>> {
    let mut adjacency: HashMap<&str, Vec<&DependencyEdge>> = HashMap::new();
    for edge in edges {
        adjacency.entry(edge.dependency_task_id.as_str()).or_default().push(edge);
    }

    #[derive(PartialEq, Clone, Copy)]
    enum Color {
        White,
        Gray,
        Black,
    }
    let mut color: HashMap<&str, Color> = task_ids.iter().map(|id| (id.as_str(), Color::White)).collect();

    for start in task_ids {
        if color[start.as_str()] != Color::White {
            continue;
        }
        let mut path: Vec<&DependencyEdge> = Vec::new();
        let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        color.insert(start.as_str(), Color::Gray);

        while let Some(&(node, idx)) = stack.last() {
            let out_edges = adjacency.get(node).cloned().unwrap_or_default();
            if idx >= out_edges.len() {
                color.insert(node, Color::Black);
                stack.pop();
                if let Some(last) = path.last() {
                    if last.dependency_task_id == node {
                        path.pop();
                    }
                }
                continue;
            }
            stack.last_mut().unwrap().1 += 1;
            let edge = out_edges[idx];
            let next = edge.dependent_task_id.as_str();
            match color.get(next).copied() {
                Some(Color::Gray) => {
                    path.push(edge);
                    let cycle_start = path.iter().position(|e| e.dependency_task_id == next).unwrap_or(0);
                    return Some(path[cycle_start..].iter().map(|e| (*e).clone()).collect());
                }
                Some(Color::White) => {
                    path.push(edge);
                    color.insert(next, Color::Gray);
                    stack.push((next, 0));
                }
                _ => {}
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use marcus_db::model::Priority;
    use marcus_test_utils::FakeOracle;

    fn task(id: &str, name: &str, status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            task_id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            status,
            priority: Priority::Medium,
            assigned_to: None,
            dependencies: vec![],
            labels: vec![],
            estimated_hours: 1.0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn pattern_only_infers_design_before_implementation() {
        let tasks = vec![task("t1", "Design the schema", TaskStatus::Todo), task("t2", "Implement the schema", TaskStatus::Todo)];
        let dir = tempfile::TempDir::new().unwrap();
        let cache = Arc::new(DependencyCache::open(dir.path(), false));
        let inferer = DependencyInferer::new(InferConfig::from_preset(InferPreset::PatternOnly), None, cache);

        let edges = inferer.infer(&tasks).await.unwrap();
        assert!(edges.iter().any(|e| e.dependency_task_id == "t1" && e.dependent_task_id == "t2"));
    }

    #[tokio::test]
    async fn cycle_of_non_mandatory_edges_drops_lowest_confidence() {
        // Three component-scoped "backend before frontend" matches would
        // not naturally cycle; instead synthesize a merge result directly
        // via the Oracle for a cyclic triple sharing an unambiguous token.
        let tasks = vec![
            task("x", "x widget", TaskStatus::Todo),
            task("y", "y widget", TaskStatus::Todo),
            task("z", "z widget", TaskStatus::Todo),
        ];
        let dir = tempfile::TempDir::new().unwrap();
        let cache = Arc::new(DependencyCache::open(dir.path(), false));
        let oracle = Arc::new(FakeOracle::new());
        oracle.stage_pair(
            "x",
            "y",
            marcus_db::capability::PairInference { direction: PairDirection::AToB, confidence: 0.9, reasoning: "r".into() },
        );
        oracle.stage_pair(
            "y",
            "z",
            marcus_db::capability::PairInference { direction: PairDirection::AToB, confidence: 0.8, reasoning: "r".into() },
        );
        oracle.stage_pair(
            "z",
            "x",
            marcus_db::capability::PairInference { direction: PairDirection::AToB, confidence: 0.7, reasoning: "r".into() },
        );

        let inferer = DependencyInferer::new(InferConfig::from_preset(InferPreset::Aggressive), Some(oracle), cache);
        let edges = inferer.infer(&tasks).await.unwrap();
        assert!(!edges.iter().any(|e| e.dependency_task_id == "z" && e.dependent_task_id == "x"));

        let mut graph = crate::graph::TaskGraph::new();
        for mut t in tasks {
            t.dependencies = edges
                .iter()
                .filter(|e| e.dependent_task_id == t.task_id)
                .map(|e| e.dependency_task_id.clone())
                .collect();
            graph.upsert(t);
        }
        assert!(!graph.has_cycle());
    }

    #[test]
    fn logical_predicate_rejects_done_dependency_for_fresh_dependent() {
        let done_dep = task("a", "design thing", TaskStatus::Done);
        let fresh_dependent = task("b", "implement thing", TaskStatus::Todo);
        assert!(!logical_predicate_holds(&done_dep, &fresh_dependent, false));
    }

    #[test]
    fn is_ambiguous_true_when_sharing_tech_keyword_without_pattern_hit() {
        let a = task("a", "Improve admin dashboard", TaskStatus::Todo);
        let b = task("b", "Polish admin styling", TaskStatus::Todo);
        assert!(is_ambiguous(&a, &b, &[]));
    }
}
