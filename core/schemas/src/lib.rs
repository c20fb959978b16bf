use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ID Types
// ============================================================================

/// Row id of an asset, location, log, plan or task.
pub type RecordId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CycleId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationId(pub i64);

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returned when a stored or submitted token names no known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownToken {
    pub expected: &'static str,
    pub found: String,
}

impl fmt::Display for UnknownToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.expected, self.found)
    }
}

impl std::error::Error for UnknownToken {}

// ============================================================================
// Entity Kinds & Mentions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "asset")]
    Asset,
    #[serde(rename = "location")]
    Location,
    #[serde(rename = "task")]
    Task,
    #[serde(rename = "plan")]
    Plan,
    #[serde(rename = "log")]
    Log,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Asset,
        EntityKind::Location,
        EntityKind::Task,
        EntityKind::Plan,
        EntityKind::Log,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Asset => "asset",
            EntityKind::Location => "location",
            EntityKind::Task => "task",
            EntityKind::Plan => "plan",
            EntityKind::Log => "log",
        }
    }

    /// Table holding rows of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Asset => "assets",
            EntityKind::Location => "locations",
            EntityKind::Task => "tasks",
            EntityKind::Plan => "plans",
            EntityKind::Log => "logs",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = UnknownToken;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "asset" => Ok(EntityKind::Asset),
            "location" => Ok(EntityKind::Location),
            "task" => Ok(EntityKind::Task),
            "plan" => Ok(EntityKind::Plan),
            "log" => Ok(EntityKind::Log),
            other => Err(UnknownToken {
                expected: "entity kind",
                found: other.to_string(),
            }),
        }
    }
}

/// A reference to another record found inside a rich-text field.
/// Never persisted; only the edges derived from it are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mention {
    pub target_type: EntityKind,
    pub target_id: RecordId,
}

impl Mention {
    pub fn new(target_type: EntityKind, target_id: RecordId) -> Self {
        Self {
            target_type,
            target_id,
        }
    }
}

/// Any record addressed by kind and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: RecordId,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: RecordId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Role column on asset/location ↔ log edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeRole {
    #[serde(rename = "related")]
    Related,
    #[serde(rename = "moved")]
    Moved,
}

impl EdgeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeRole::Related => "related",
            EdgeRole::Moved => "moved",
        }
    }
}

// ============================================================================
// Work Tracking
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "backlog")]
    Backlog,
    #[serde(rename = "todo")]
    Todo,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl TaskState {
    pub const ACTIVE: [TaskState; 3] = [TaskState::Backlog, TaskState::Todo, TaskState::InProgress];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Backlog => "backlog",
            TaskState::Todo => "todo",
            TaskState::InProgress => "in_progress",
            TaskState::Done => "done",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        !self.is_completed()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Cancelled)
    }
}

impl FromStr for TaskState {
    type Err = UnknownToken;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "backlog" => Ok(TaskState::Backlog),
            "todo" => Ok(TaskState::Todo),
            "in_progress" => Ok(TaskState::InProgress),
            "done" => Ok(TaskState::Done),
            "cancelled" => Ok(TaskState::Cancelled),
            other => Err(UnknownToken {
                expected: "task state",
                found: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationType {
    #[serde(rename = "blocks")]
    Blocks,
    #[serde(rename = "related")]
    Related,
    #[serde(rename = "duplicate")]
    Duplicate,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Blocks => "blocks",
            RelationType::Related => "related",
            RelationType::Duplicate => "duplicate",
        }
    }

    /// Symmetric relations store one direction only.
    pub fn is_symmetric(&self) -> bool {
        matches!(self, RelationType::Related)
    }
}

impl FromStr for RelationType {
    type Err = UnknownToken;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "blocks" => Ok(RelationType::Blocks),
            "related" => Ok(RelationType::Related),
            "duplicate" => Ok(RelationType::Duplicate),
            other => Err(UnknownToken {
                expected: "relation type",
                found: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRelation {
    pub id: RelationId,
    pub source_task_id: RecordId,
    pub target_task_id: RecordId,
    pub relation_type: RelationType,
}

/// A relation as submitted for creation or update, before it has an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationCandidate {
    pub source_task_id: RecordId,
    pub target_task_id: RecordId,
    pub relation_type: RelationType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: CycleId,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl Cycle {
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start_date <= day && day <= self.end_date
    }

    /// Closed-interval intersection test.
    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        start <= self.end_date && end >= self.start_date
    }
}

/// Which cycles a listing should return, relative to a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleTimeframe {
    #[serde(rename = "all")]
    All,
    #[serde(rename = "past")]
    Past,
    #[serde(rename = "current")]
    Current,
    #[serde(rename = "future")]
    Future,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleProgress {
    pub cycle: Cycle,
    pub total: usize,
    pub backlog: usize,
    pub todo: usize,
    pub in_progress: usize,
    pub done: usize,
    pub cancelled: usize,
    /// Share of tasks in a completed state, 0-100.
    pub percent_complete: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: RecordId,
    pub title: String,
    pub description: Option<String>,
    pub state: TaskState,
    pub cycle_id: Option<CycleId>,
    pub parent_id: Option<RecordId>,
    pub plan_id: Option<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: RecordId,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<RecordId>,
}

// ============================================================================
// Farm Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: RecordId,
    pub name: String,
    pub notes: Option<String>,
    pub parent_id: Option<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: RecordId,
    pub name: String,
    pub notes: Option<String>,
    pub parent_id: Option<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub id: RecordId,
    pub name: String,
    pub notes: Option<String>,
}

// ============================================================================
// Reference Sync Reports
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncWarningReason {
    /// The referenced record does not exist.
    #[serde(rename = "missing_target")]
    MissingTarget,
    /// Another writer created the same edge first.
    #[serde(rename = "already_linked")]
    AlreadyLinked,
    #[serde(rename = "storage")]
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWarning {
    pub target: EntityRef,
    pub reason: SyncWarningReason,
    pub detail: String,
}

/// Outcome of reconciling one target kind for an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSync {
    pub target_kind: EntityKind,
    pub added: Vec<RecordId>,
    pub removed: Vec<RecordId>,
    pub unchanged: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub owner: EntityRef,
    pub targets: Vec<TargetSync>,
    pub warnings: Vec<SyncWarning>,
}

impl SyncReport {
    pub fn new(owner: EntityRef) -> Self {
        Self {
            owner,
            targets: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Number of edge rows inserted or deleted.
    pub fn writes(&self) -> usize {
        self.targets
            .iter()
            .map(|t| t.added.len() + t.removed.len())
            .sum()
    }

    pub fn added(&self) -> usize {
        self.targets.iter().map(|t| t.added.len()).sum()
    }

    pub fn removed(&self) -> usize {
        self.targets.iter().map(|t| t.removed.len()).sum()
    }
}

// ============================================================================
// Rollover Reports
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverReceipt {
    pub id: RecordId,
    pub title: String,
    pub from_cycle: String,
    pub to_cycle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverFailure {
    pub id: RecordId,
    pub title: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverReport {
    pub rolled_over: usize,
    pub tasks: Vec<RolloverReceipt>,
    pub failed: Vec<RolloverFailure>,
}

impl RolloverReport {
    pub fn empty() -> Self {
        Self {
            rolled_over: 0,
            tasks: Vec::new(),
            failed: Vec::new(),
        }
    }
}
