//! Domain model: tasks, agents, dependency edges, assignments.
//!
//! Enums follow the same `Display` / `FromStr` / dedicated parse-error
//! shape throughout, so every status value round-trips through JSON and
//! through plain strings (CLI flags, log fields) identically.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Status of a task, as tracked on the Board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Blocked,
    Done,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "done" => Ok(Self::Done),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Task priority, as carried on the Board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Score used by the Matcher's Phase M (§4.5).
    pub fn score(self) -> f64 {
        match self {
            Self::Low => 0.25,
            Self::Medium => 0.5,
            Self::High => 0.75,
            Self::Critical => 1.0,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------
// TaskClass (classifier output, §4.1)
// ---------------------------------------------------------------------------

/// Coarse classification of a task's kind, used by the Inferer's safety
/// patterns and the Matcher's safety filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    Design,
    Implementation,
    Testing,
    Deployment,
    Other,
}

impl TaskClass {
    /// Ordering used for "dependency must have strictly lower priority
    /// than dependent" validation in §4.2. `Other` sits between
    /// `Implementation` and `Testing`.
    pub fn order(self) -> f64 {
        match self {
            Self::Design => 1.0,
            Self::Implementation => 2.0,
            Self::Other => 2.5,
            Self::Testing => 3.0,
            Self::Deployment => 4.0,
        }
    }
}

impl fmt::Display for TaskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Design => "design",
            Self::Implementation => "implementation",
            Self::Testing => "testing",
            Self::Deployment => "deployment",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// DependencyOrigin
// ---------------------------------------------------------------------------

/// Provenance of an inferred dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyOrigin {
    Pattern,
    Oracle,
    Both,
    Manual,
}

impl fmt::Display for DependencyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pattern => "pattern",
            Self::Oracle => "oracle",
            Self::Both => "both",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

impl FromStr for DependencyOrigin {
    type Err = DependencyOriginParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pattern" => Ok(Self::Pattern),
            "oracle" => Ok(Self::Oracle),
            "both" => Ok(Self::Both),
            "manual" => Ok(Self::Manual),
            other => Err(DependencyOriginParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DependencyOriginParseError(pub String);

impl fmt::Display for DependencyOriginParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid dependency origin: {:?}", self.0)
    }
}

impl std::error::Error for DependencyOriginParseError {}

// ---------------------------------------------------------------------------
// AssignmentStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of an [`Assignment`] (§3.3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Expired,
    Released,
    ForceReleased,
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Released => "released",
            Self::ForceReleased => "force_released",
        };
        f.write_str(s)
    }
}

impl FromStr for AssignmentStatus {
    type Err = AssignmentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "released" => Ok(Self::Released),
            "force_released" => Ok(Self::ForceReleased),
            other => Err(AssignmentStatusParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssignmentStatusParseError(pub String);

impl fmt::Display for AssignmentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid assignment status: {:?}", self.0)
    }
}

impl std::error::Error for AssignmentStatusParseError {}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A task as tracked by the Board (§3.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assigned_to: Option<String>,
    pub dependencies: Vec<String>,
    pub labels: Vec<String>,
    pub estimated_hours: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Extract the `Original ID: <sym>` line from the description, if
    /// present (§4.1 id resolution).
    pub fn original_id(&self) -> Option<&str> {
        self.description.lines().find_map(|line| {
            line.strip_prefix("Original ID:")
                .map(|rest| rest.trim())
                .filter(|s| !s.is_empty())
        })
    }
}

/// An agent registered with the core (§3.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub name: String,
    pub role: String,
    pub skills: Vec<String>,
    pub capacity: u32,
    pub performance_score: f64,
    pub completed: u64,
    pub failed: u64,
    pub blocked: u64,
    pub last_seen: DateTime<Utc>,
}

impl Agent {
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>, role: impl Into<String>, skills: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            role: role.into(),
            skills,
            capacity: 1,
            performance_score: 0.5,
            completed: 0,
            failed: 0,
            blocked: 0,
            last_seen: now,
        }
    }
}

/// A directed dependency edge: `dependency_task_id -> dependent_task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub dependency_task_id: String,
    pub dependent_task_id: String,
    pub confidence: f64,
    pub mandatory: bool,
    pub origin: DependencyOrigin,
    pub reasoning: String,
}

/// A durable assignment record (§3.1, §4.3, §4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub agent_id: String,
    pub task_id: String,
    pub assigned_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub renewal_count: u32,
    pub status: AssignmentStatus,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_roundtrip() {
        for s in [TaskStatus::Todo, TaskStatus::InProgress, TaskStatus::Blocked, TaskStatus::Done] {
            let parsed: TaskStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn task_status_rejects_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn priority_roundtrip() {
        for p in [Priority::Low, Priority::Medium, Priority::High, Priority::Critical] {
            let parsed: Priority = p.to_string().parse().unwrap();
            assert_eq!(parsed, p);
        }
    }

    #[test]
    fn priority_scores_are_monotonic() {
        assert!(Priority::Low.score() < Priority::Medium.score());
        assert!(Priority::Medium.score() < Priority::High.score());
        assert!(Priority::High.score() < Priority::Critical.score());
    }

    #[test]
    fn dependency_origin_roundtrip() {
        for o in [DependencyOrigin::Pattern, DependencyOrigin::Oracle, DependencyOrigin::Both, DependencyOrigin::Manual] {
            let parsed: DependencyOrigin = o.to_string().parse().unwrap();
            assert_eq!(parsed, o);
        }
    }

    #[test]
    fn assignment_status_roundtrip() {
        for s in [
            AssignmentStatus::Active,
            AssignmentStatus::Expired,
            AssignmentStatus::Released,
            AssignmentStatus::ForceReleased,
        ] {
            let parsed: AssignmentStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn task_class_order_matches_spec() {
        assert!(TaskClass::Design.order() < TaskClass::Implementation.order());
        assert!(TaskClass::Implementation.order() < TaskClass::Other.order());
        assert!(TaskClass::Other.order() < TaskClass::Testing.order());
        assert!(TaskClass::Testing.order() < TaskClass::Deployment.order());
    }

    #[test]
    fn original_id_extracted_from_description() {
        let mut task = sample_task();
        task.description = "Does a thing.\nOriginal ID: sym-42\n".to_string();
        assert_eq!(task.original_id(), Some("sym-42"));
    }

    #[test]
    fn original_id_absent_when_no_line() {
        let task = sample_task();
        assert_eq!(task.original_id(), None);
    }

    fn sample_task() -> Task {
        let now = Utc::now();
        Task {
            task_id: "t1".into(),
            name: "Build API".into(),
            description: "desc".into(),
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            assigned_to: None,
            dependencies: vec![],
            labels: vec![],
            estimated_hours: 1.0,
            created_at: now,
            updated_at: now,
        }
    }
}
