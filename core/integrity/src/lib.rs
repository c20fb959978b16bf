pub mod config;
pub mod database;
pub mod error;
pub mod hierarchy;
pub mod mention;
pub mod relation;
pub mod rollover;
pub mod scheduler;
pub mod sync;

pub use config::IntegrityConfig;
pub use database::{Database, NewTask, Saved, TaskFilter, TaskUpdate, UpdateOptions};
pub use error::{IntegrityError, Result, ValidationError};
pub use hierarchy::{ChildLookup, HierarchyGuard, ParentLookup};
pub use mention::MentionExtractor;
pub use relation::{RelationGuard, RelationLookup};
pub use rollover::RolloverEngine;
pub use scheduler::{month_bounds, shift_month, CycleScheduler};
pub use sync::ReferenceGraphSynchronizer;
