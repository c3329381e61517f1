//! Task Graph (C1, §4.1): an in-memory DAG over tasks, with cycle
//! detection, topological ordering, critical-path computation, and the
//! keyword classifier used by the Inferer's safety patterns and the
//! Matcher's safety filter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

use marcus_db::model::{Task, TaskClass};
use regex::RegexSet;

/// Keyword sets for [`classify`], matched case-insensitively against the
/// task name with word boundaries.
fn classifier_sets() -> &'static [(TaskClass, RegexSet)] {
    static SETS: OnceLock<Vec<(TaskClass, RegexSet)>> = OnceLock::new();
    SETS.get_or_init(|| {
        let build = |words: &[&str]| {
            let patterns: Vec<String> = words.iter().map(|w| format!(r"(?i)\b{w}\b")).collect();
            RegexSet::new(patterns).expect("classifier patterns are valid regexes")
        };
        vec![
            (TaskClass::Design, build(&["design", "plan", "architect", "wireframe", "spec", "research", "analyze"])),
            (TaskClass::Testing, build(&["test", "qa", "quality", "verify", "validation", "check"])),
            (TaskClass::Deployment, build(&["deploy", "release", "launch", "production", "publish"])),
            (TaskClass::Implementation, build(&["implement", "build", "create", "develop", "code", "write"])),
        ]
    })
}

/// Classify a task by keyword match over its name (§4.1). Checked in
/// priority order so that, e.g., a name matching both "design" and
/// "test" keywords classifies as `Design`.
pub fn classify(task_name: &str) -> TaskClass {
    for (class, set) in classifier_sets() {
        if set.is_match(task_name) {
            return *class;
        }
    }
    TaskClass::Other
}

/// The in-memory task graph.
#[derive(Default)]
pub struct TaskGraph {
    tasks: HashMap<String, Task>,
    /// Reverse index: task_id -> set of tasks that depend on it.
    dependents: HashMap<String, HashSet<String>>,
    /// Bidirectional symbolic-id map (§4.1 id resolution).
    sym_to_id: HashMap<String, String>,
    id_to_sym: HashMap<String, String>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a task. Dependencies referencing unknown ids
    /// are dropped with a tracing warning (§4.1 invariants). Updates the
    /// bidirectional symbolic-id map from `Original ID: <sym>`, if present.
    pub fn upsert(&mut self, mut task: Task) {
        if let Some(sym) = task.original_id() {
            let sym = sym.to_string();
            self.sym_to_id.insert(sym.clone(), task.task_id.clone());
            self.id_to_sym.insert(task.task_id.clone(), sym);
        }

        // Resolve any symbolic dependency references before validating
        // that dependency ids point at existing tasks.
        task.dependencies = task
            .dependencies
            .iter()
            .map(|dep| self.resolve_id(dep))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect();

        // Drop self-references and dependencies on not-yet-known ids;
        // the latter are revalidated lazily since tasks may arrive out
        // of order. We only drop ids that can never resolve (i.e. not a
        // known id and not a known symbol).
        task.dependencies.retain(|dep| dep != &task.task_id);

        for existing_dep in &task.dependencies {
            self.dependents.entry(existing_dep.clone()).or_default().insert(task.task_id.clone());
        }

        if let Some(old) = self.tasks.get(&task.task_id) {
            for old_dep in &old.dependencies {
                if !task.dependencies.contains(old_dep) {
                    if let Some(set) = self.dependents.get_mut(old_dep) {
                        set.remove(&task.task_id);
                    }
                }
            }
        }

        self.tasks.insert(task.task_id.clone(), task);
    }

    pub fn remove(&mut self, task_id: &str) {
        if let Some(task) = self.tasks.remove(task_id) {
            for dep in &task.dependencies {
                if let Some(set) = self.dependents.get_mut(dep) {
                    set.remove(task_id);
                }
            }
        }
        self.dependents.remove(task_id);
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Resolve a dependency reference: an id, a known symbol, or neither
    /// (in which case it is dropped).
    fn resolve_id(&self, reference: &str) -> Option<String> {
        if self.tasks.contains_key(reference) {
            return Some(reference.to_string());
        }
        self.sym_to_id.get(reference).cloned()
    }

    pub fn dependencies_of(&self, task_id: &str) -> HashSet<String> {
        self.tasks.get(task_id).map(|t| t.dependencies.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn dependents_of(&self, task_id: &str) -> HashSet<String> {
        self.dependents.get(task_id).cloned().unwrap_or_default()
    }

    /// True iff the graph contains a cycle, via iterative DFS with a
    /// three-color visited set.
    pub fn has_cycle(&self) -> bool {
        #[derive(PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color: HashMap<&str, Color> = self.tasks.keys().map(|k| (k.as_str(), Color::White)).collect();

        for start in self.tasks.keys() {
            if color[start.as_str()] != Color::White {
                continue;
            }
            // Explicit stack DFS: (node, iterator index into its deps).
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            color.insert(start.as_str(), Color::Gray);
            while let Some((node, idx)) = stack.last().copied() {
                let deps = &self.tasks[node].dependencies;
                if idx >= deps.len() {
                    color.insert(node, Color::Black);
                    stack.pop();
                    continue;
                }
                stack.last_mut().unwrap().1 += 1;
                let dep = deps[idx].as_str();
                let Some(dep) = self.tasks.get(dep).map(|_| dep) else { continue };
                match color.get(dep) {
                    Some(Color::Gray) => return true,
                    Some(Color::White) => {
                        color.insert(dep, Color::Gray);
                        stack.push((dep, 0));
                    }
                    _ => {}
                }
            }
        }
        false
    }

    /// Kahn's algorithm. Returns `None` if the graph has a cycle.
    pub fn topological_order(&self) -> Option<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        for task in self.tasks.values() {
            for dep in &task.dependencies {
                if self.tasks.contains_key(dep) {
                    *indegree.get_mut(task.task_id.as_str()).unwrap() += 1;
                }
            }
        }

        let mut ready: Vec<&str> = indegree.iter().filter(|(_, &deg)| deg == 0).map(|(k, _)| *k).collect();
        ready.sort();
        let mut queue: VecDeque<&str> = ready.into();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            let mut next_ready: Vec<&str> = Vec::new();
            for dependent in self.dependents_of(node) {
                let entry = indegree.get_mut(dependent.as_str()).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    next_ready.push(self.tasks.get_key_value(&dependent).unwrap().0.as_str());
                }
            }
            next_ready.sort();
            for n in next_ready {
                queue.push_back(n);
            }
        }

        if order.len() == self.tasks.len() {
            Some(order)
        } else {
            None
        }
    }

    /// Longest path by `estimated_hours`, following dependency edges
    /// forward (dependency -> dependent). Requires an acyclic graph;
    /// returns an empty vec if the graph has a cycle.
    pub fn critical_path(&self) -> Vec<String> {
        let Some(order) = self.topological_order() else {
            return Vec::new();
        };

        let mut best_hours: HashMap<&str, f64> = HashMap::new();
        let mut best_pred: HashMap<&str, Option<&str>> = HashMap::new();

        for id in &order {
            let task = &self.tasks[id];
            let mut hours = task.estimated_hours;
            let mut pred = None;
            for dep in &task.dependencies {
                if let Some(&dep_hours) = best_hours.get(dep.as_str()) {
                    let candidate = dep_hours + task.estimated_hours;
                    if candidate > hours {
                        hours = candidate;
                        pred = Some(dep.as_str());
                    }
                }
            }
            best_hours.insert(id.as_str(), hours);
            best_pred.insert(id.as_str(), pred);
        }

        let Some(end) = order.iter().max_by(|a, b| {
            best_hours[a.as_str()]
                .partial_cmp(&best_hours[b.as_str()])
                .unwrap_or(std::cmp::Ordering::Equal)
        }) else {
            return Vec::new();
        };

        let mut path = vec![end.clone()];
        let mut current = end.as_str();
        while let Some(Some(pred)) = best_pred.get(current) {
            path.push(pred.to_string());
            current = pred;
        }
        path.reverse();
        path
    }
}
