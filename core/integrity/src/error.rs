use chrono::NaiveDate;
use farmstead_schemas::{CycleId, EntityKind, RecordId, RelationId, RelationType};
use thiserror::Error;

/// A write rejected before anything was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind} {id} cannot be its own parent")]
    SelfReference { kind: EntityKind, id: RecordId },

    #[error("making {kind} {parent_id} the parent of {kind} {id} would create a cycle")]
    Cycle {
        kind: EntityKind,
        id: RecordId,
        parent_id: RecordId,
    },

    #[error("task {task_id} cannot be related to itself")]
    SelfRelation { task_id: RecordId },

    #[error("task {source_task_id} already {} task {target_task_id}", .relation_type.as_str())]
    DuplicateTriple {
        source_task_id: RecordId,
        target_task_id: RecordId,
        relation_type: RelationType,
    },

    #[error("task {target_task_id} is already {} to task {source_task_id}", .relation_type.as_str())]
    InverseDuplicate {
        source_task_id: RecordId,
        target_task_id: RecordId,
        relation_type: RelationType,
    },

    #[error("cycle {start}..{end} overlaps cycle {existing} ({existing_name})")]
    CycleOverlap {
        start: NaiveDate,
        end: NaiveDate,
        existing: CycleId,
        existing_name: String,
    },

    #[error("cycle end {end} is before its start {start}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },

    #[error("cycle duration must be at least one day")]
    InvalidDuration,

    #[error("{requested} cycles requested, at most {limit} per call")]
    TooManyCycles { requested: u64, limit: u32 },

    #[error("dates past {from} are out of range")]
    DateOutOfRange { from: NaiveDate },
}

impl ValidationError {
    /// Machine-readable reason surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::SelfReference { .. } => "self_reference",
            ValidationError::Cycle { .. } => "cycle",
            ValidationError::SelfRelation { .. } => "self_relation",
            ValidationError::DuplicateTriple { .. } => "duplicate_triple",
            ValidationError::InverseDuplicate { .. } => "inverse_duplicate",
            ValidationError::CycleOverlap { .. } => "cycle_overlap",
            ValidationError::InvalidDateRange { .. } => "invalid_date_range",
            ValidationError::InvalidDuration => "invalid_duration",
            ValidationError::TooManyCycles { .. } => "too_many_cycles",
            ValidationError::DateOutOfRange { .. } => "date_out_of_range",
        }
    }
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: RecordId },

    #[error("{0} records have no parent")]
    NotHierarchical(EntityKind),

    #[error("cycle {0} not found")]
    CycleNotFound(CycleId),

    #[error("task relation {0} not found")]
    RelationNotFound(RelationId),

    #[error("invalid month {year}-{month}")]
    InvalidMonth { year: i32, month: u32 },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl IntegrityError {
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            IntegrityError::Validation(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, IntegrityError>;
