use farmstead_schemas::{RecordId, RelationCandidate, RelationId, RelationType, TaskRelation};
use tracing::debug;

use crate::error::{Result, ValidationError};

/// Answers whether a relation triple is already stored.
pub trait RelationLookup {
    /// `excluding` names a relation to ignore, i.e. the one being updated.
    fn exists(
        &self,
        source_task_id: RecordId,
        target_task_id: RecordId,
        relation_type: RelationType,
        excluding: Option<RelationId>,
    ) -> Result<bool>;
}

impl RelationLookup for [TaskRelation] {
    fn exists(
        &self,
        source_task_id: RecordId,
        target_task_id: RecordId,
        relation_type: RelationType,
        excluding: Option<RelationId>,
    ) -> Result<bool> {
        Ok(self.iter().any(|r| {
            Some(r.id) != excluding
                && r.source_task_id == source_task_id
                && r.target_task_id == target_task_id
                && r.relation_type == relation_type
        }))
    }
}

impl RelationLookup for Vec<TaskRelation> {
    fn exists(
        &self,
        source_task_id: RecordId,
        target_task_id: RecordId,
        relation_type: RelationType,
        excluding: Option<RelationId>,
    ) -> Result<bool> {
        self.as_slice()
            .exists(source_task_id, target_task_id, relation_type, excluding)
    }
}

/// Validates task-to-task relations before they are written.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelationGuard;

impl RelationGuard {
    pub fn new() -> Self {
        Self
    }

    pub fn validate<L>(
        &self,
        relation: &RelationCandidate,
        existing: &L,
        excluding: Option<RelationId>,
    ) -> Result<()>
    where
        L: RelationLookup + ?Sized,
    {
        let RelationCandidate {
            source_task_id,
            target_task_id,
            relation_type,
        } = *relation;

        if source_task_id == target_task_id {
            return Err(ValidationError::SelfRelation {
                task_id: source_task_id,
            }
            .into());
        }

        if existing.exists(source_task_id, target_task_id, relation_type, excluding)? {
            return Err(ValidationError::DuplicateTriple {
                source_task_id,
                target_task_id,
                relation_type,
            }
            .into());
        }

        if relation_type.is_symmetric()
            && existing.exists(target_task_id, source_task_id, relation_type, excluding)?
        {
            debug!(
                "Rejected {} {} -> {}: inverse already stored",
                relation_type.as_str(),
                source_task_id,
                target_task_id
            );
            return Err(ValidationError::InverseDuplicate {
                source_task_id,
                target_task_id,
                relation_type,
            }
            .into());
        }

        Ok(())
    }
}
