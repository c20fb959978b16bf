use farmstead_schemas::{EntityKind, RecordId};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

use crate::error::{Result, ValidationError};

/// Kinds whose rows carry a `parent_id` pointing at the same table.
pub const HIERARCHICAL_KINDS: [EntityKind; 4] = [
    EntityKind::Asset,
    EntityKind::Location,
    EntityKind::Task,
    EntityKind::Plan,
];

pub fn is_hierarchical(kind: EntityKind) -> bool {
    HIERARCHICAL_KINDS.contains(&kind)
}

/// Resolves the parent of a node within one tree.
pub trait ParentLookup {
    fn parent_of(&self, id: RecordId) -> Result<Option<RecordId>>;
}

/// Resolves the direct children of a node within one tree.
pub trait ChildLookup {
    fn children_of(&self, id: RecordId) -> Result<Vec<RecordId>>;
}

impl ParentLookup for HashMap<RecordId, Option<RecordId>> {
    fn parent_of(&self, id: RecordId) -> Result<Option<RecordId>> {
        Ok(self.get(&id).copied().flatten())
    }
}

impl ChildLookup for HashMap<RecordId, Option<RecordId>> {
    fn children_of(&self, id: RecordId) -> Result<Vec<RecordId>> {
        let mut children: Vec<RecordId> = self
            .iter()
            .filter(|(_, parent)| **parent == Some(id))
            .map(|(child, _)| *child)
            .collect();
        children.sort_unstable();
        Ok(children)
    }
}

/// Guards parent assignments so each kind's parent graph stays a forest.
#[derive(Debug, Clone, Copy)]
pub struct HierarchyGuard {
    kind: EntityKind,
}

impl HierarchyGuard {
    pub fn new(kind: EntityKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Check that `candidate` may become the parent of `node_id`.
    ///
    /// `node_id` is `None` for a node that has not been persisted yet; such a
    /// node has no descendants, so neither check can fail. Clearing the
    /// parent always succeeds.
    pub fn validate_parent<L>(
        &self,
        node_id: Option<RecordId>,
        candidate: Option<RecordId>,
        lookup: &L,
    ) -> Result<()>
    where
        L: ParentLookup + ?Sized,
    {
        let (Some(id), Some(parent_id)) = (node_id, candidate) else {
            return Ok(());
        };

        if parent_id == id {
            return Err(ValidationError::SelfReference {
                kind: self.kind,
                id,
            }
            .into());
        }

        if ancestor_chain(parent_id, lookup)?.contains(&id) {
            debug!(
                "Rejected {} {} as parent of {}: {} is an ancestor",
                self.kind, parent_id, id, id
            );
            return Err(ValidationError::Cycle {
                kind: self.kind,
                id,
                parent_id,
            }
            .into());
        }

        Ok(())
    }
}

/// `start` followed by its ancestors, nearest first.
///
/// The walk stops at the first id already seen, so a loop that predates the
/// guard cannot hang it.
pub fn ancestor_chain<L>(start: RecordId, lookup: &L) -> Result<Vec<RecordId>>
where
    L: ParentLookup + ?Sized,
{
    let mut chain = vec![start];
    let mut visited = HashSet::from([start]);
    let mut current = start;

    while let Some(parent) = lookup.parent_of(current)? {
        if !visited.insert(parent) {
            warn!("Parent loop detected at id {} while walking from {}", parent, start);
            break;
        }
        chain.push(parent);
        current = parent;
    }

    Ok(chain)
}

/// Ancestors of `id`, nearest first, excluding `id` itself.
pub fn ancestors<L>(id: RecordId, lookup: &L) -> Result<Vec<RecordId>>
where
    L: ParentLookup + ?Sized,
{
    let mut chain = ancestor_chain(id, lookup)?;
    chain.remove(0);
    Ok(chain)
}

/// All descendants of `id` in breadth-first order, excluding `id` itself.
pub fn descendants<L>(id: RecordId, lookup: &L) -> Result<Vec<RecordId>>
where
    L: ChildLookup + ?Sized,
{
    let mut found = Vec::new();
    let mut visited = HashSet::from([id]);
    let mut queue = VecDeque::from([id]);

    while let Some(node) = queue.pop_front() {
        for child in lookup.children_of(node)? {
            if visited.insert(child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }

    Ok(found)
}
