use chrono::Utc;
use farmstead_schemas::{
    EdgeRole, EntityKind, EntityRef, Mention, RecordId, SyncReport, SyncWarning,
    SyncWarningReason, TargetSync,
};
use rusqlite::types::Value;
use rusqlite::{ffi, params, params_from_iter, Connection};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::database::{ensure_exists, Database};
use crate::error::Result;
use crate::mention::MentionExtractor;

/// One join table an owner kind reconciles its mentions against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceSpec {
    pub owner: EntityKind,
    pub target: EntityKind,
    pub table: &'static str,
    pub owner_column: &'static str,
    pub target_column: &'static str,
    /// Only rows with this role are managed; other roles are left alone.
    pub role: Option<EdgeRole>,
}

impl ReferenceSpec {
    /// A record never references itself through a same-kind table.
    pub fn excludes_self(&self) -> bool {
        self.owner == self.target
    }
}

/// A mentionable record kind: where its text lives and what it links to.
#[derive(Debug)]
pub struct OwnerSpec {
    pub kind: EntityKind,
    pub text_column: &'static str,
    pub references: &'static [ReferenceSpec],
}

const fn reference(
    owner: EntityKind,
    target: EntityKind,
    table: &'static str,
    owner_column: &'static str,
    target_column: &'static str,
    role: Option<EdgeRole>,
) -> ReferenceSpec {
    ReferenceSpec {
        owner,
        target,
        table,
        owner_column,
        target_column,
        role,
    }
}

const TASK_REFERENCES: &[ReferenceSpec] = &[
    reference(EntityKind::Task, EntityKind::Asset, "task_assets", "task_id", "asset_id", None),
    reference(EntityKind::Task, EntityKind::Location, "task_locations", "task_id", "location_id", None),
    reference(EntityKind::Task, EntityKind::Log, "task_logs", "task_id", "log_id", None),
    reference(EntityKind::Task, EntityKind::Plan, "task_plans", "task_id", "plan_id", None),
];

const PLAN_REFERENCES: &[ReferenceSpec] = &[
    reference(EntityKind::Plan, EntityKind::Asset, "plan_assets", "plan_id", "asset_id", None),
    reference(EntityKind::Plan, EntityKind::Location, "plan_locations", "plan_id", "location_id", None),
    reference(EntityKind::Plan, EntityKind::Log, "plan_logs", "plan_id", "log_id", None),
    reference(EntityKind::Plan, EntityKind::Task, "plan_tasks", "plan_id", "task_id", None),
    reference(EntityKind::Plan, EntityKind::Plan, "plan_plans", "plan_id", "related_plan_id", None),
];

const LOG_REFERENCES: &[ReferenceSpec] = &[
    reference(EntityKind::Log, EntityKind::Asset, "asset_logs", "log_id", "asset_id", Some(EdgeRole::Related)),
    reference(EntityKind::Log, EntityKind::Location, "location_logs", "log_id", "location_id", Some(EdgeRole::Related)),
];

/// Owner kind → text column and join tables. Adding a mentionable kind or
/// target is an entry here plus nothing else; the schema is derived from it.
pub static REGISTRY: &[OwnerSpec] = &[
    OwnerSpec {
        kind: EntityKind::Task,
        text_column: "description",
        references: TASK_REFERENCES,
    },
    OwnerSpec {
        kind: EntityKind::Plan,
        text_column: "description",
        references: PLAN_REFERENCES,
    },
    OwnerSpec {
        kind: EntityKind::Log,
        text_column: "notes",
        references: LOG_REFERENCES,
    },
    OwnerSpec {
        kind: EntityKind::Asset,
        text_column: "notes",
        references: &[],
    },
    OwnerSpec {
        kind: EntityKind::Location,
        text_column: "notes",
        references: &[],
    },
];

pub fn owner_spec(kind: EntityKind) -> &'static OwnerSpec {
    REGISTRY
        .iter()
        .find(|spec| spec.kind == kind)
        .expect("every entity kind has a registry entry")
}

pub fn reference_spec(owner: EntityKind, target: EntityKind) -> Option<&'static ReferenceSpec> {
    owner_spec(owner)
        .references
        .iter()
        .find(|spec| spec.target == target)
}

/// Every join table in the registry.
pub fn all_references() -> impl Iterator<Item = &'static ReferenceSpec> {
    REGISTRY.iter().flat_map(|owner| owner.references.iter())
}

/// Keeps reference edges in step with the mentions in owners' text fields.
pub struct ReferenceGraphSynchronizer {
    extractor: MentionExtractor,
}

impl Default for ReferenceGraphSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceGraphSynchronizer {
    pub fn new() -> Self {
        Self {
            extractor: MentionExtractor::new(),
        }
    }

    pub fn extractor(&self) -> &MentionExtractor {
        &self.extractor
    }

    /// Reconcile `owner`'s edges against `mentions` in one write transaction.
    pub fn reconcile(
        &self,
        db: &Database,
        owner: EntityRef,
        mentions: &HashSet<Mention>,
    ) -> Result<SyncReport> {
        let tx = db.transaction()?;
        ensure_exists(&tx, owner.kind, owner.id)?;
        let report = self.reconcile_in(&tx, owner, mentions)?;
        tx.commit()?;
        Ok(report)
    }

    /// Extract mentions from `text` and reconcile them.
    pub fn sync_text(&self, db: &Database, owner: EntityRef, text: &str) -> Result<SyncReport> {
        let mentions = self.extractor.extract(text);
        self.reconcile(db, owner, &mentions)
    }

    pub(crate) fn sync_text_in(
        &self,
        conn: &Connection,
        owner: EntityRef,
        text: &str,
    ) -> Result<SyncReport> {
        let mentions = self.extractor.extract(text);
        self.reconcile_in(conn, owner, &mentions)
    }

    /// Diff-based reconciliation; the caller owns the transaction.
    ///
    /// Deletions per table happen in one statement. Insertions happen one at a
    /// time and a failed insert becomes a warning: SQLite rolls back only the
    /// failing statement, so the rest of the transaction stands.
    pub(crate) fn reconcile_in(
        &self,
        conn: &Connection,
        owner: EntityRef,
        mentions: &HashSet<Mention>,
    ) -> Result<SyncReport> {
        let spec = owner_spec(owner.kind);
        let mut report = SyncReport::new(owner);

        let mut desired_by_kind: HashMap<EntityKind, BTreeSet<RecordId>> = HashMap::new();
        for mention in mentions {
            desired_by_kind
                .entry(mention.target_type)
                .or_default()
                .insert(mention.target_id);
        }

        for kind in desired_by_kind.keys() {
            if reference_spec(owner.kind, *kind).is_none() {
                debug!("{} does not link to {} records; mentions ignored", owner, kind);
            }
        }

        for reference in spec.references {
            let mut desired = desired_by_kind
                .remove(&reference.target)
                .unwrap_or_default();
            if reference.excludes_self() {
                desired.remove(&owner.id);
            }

            let current = current_targets(conn, reference, owner.id)?;
            let to_add: Vec<RecordId> = desired.difference(&current).copied().collect();
            let to_remove: Vec<RecordId> = current.difference(&desired).copied().collect();
            let unchanged = desired.intersection(&current).count();

            if !to_remove.is_empty() {
                delete_targets(conn, reference, owner.id, &to_remove)?;
            }

            let mut added = Vec::with_capacity(to_add.len());
            for target_id in to_add {
                match insert_edge(conn, reference, owner.id, target_id) {
                    Ok(()) => added.push(target_id),
                    Err(err) => {
                        let warning = SyncWarning {
                            target: EntityRef::new(reference.target, target_id),
                            reason: classify_insert_error(&err),
                            detail: err.to_string(),
                        };
                        warn!(
                            "Could not link {} -> {}: {}",
                            owner, warning.target, warning.detail
                        );
                        report.warnings.push(warning);
                    }
                }
            }

            report.targets.push(TargetSync {
                target_kind: reference.target,
                added,
                removed: to_remove,
                unchanged,
            });
        }

        if report.writes() > 0 {
            info!(
                "Reconciled references for {}: +{} -{} ({} warnings)",
                owner,
                report.added(),
                report.removed(),
                report.warnings.len()
            );
        } else {
            debug!("References for {} already in sync", owner);
        }

        Ok(report)
    }
}

/// Target ids currently linked from `owner_id` through `spec`.
pub(crate) fn current_targets(
    conn: &Connection,
    spec: &ReferenceSpec,
    owner_id: RecordId,
) -> Result<BTreeSet<RecordId>> {
    let mut values = vec![Value::Integer(owner_id)];
    let mut sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        spec.target_column, spec.table, spec.owner_column
    );
    if let Some(role) = spec.role {
        sql.push_str(" AND role = ?2");
        values.push(Value::Text(role.as_str().to_string()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let targets = stmt
        .query_map(params_from_iter(values.iter()), |row| row.get::<_, RecordId>(0))?
        .collect::<rusqlite::Result<BTreeSet<_>>>()?;
    Ok(targets)
}

fn delete_targets(
    conn: &Connection,
    spec: &ReferenceSpec,
    owner_id: RecordId,
    targets: &[RecordId],
) -> Result<usize> {
    let mut values = vec![Value::Integer(owner_id)];
    let mut sql = format!("DELETE FROM {} WHERE {} = ?", spec.table, spec.owner_column);
    if let Some(role) = spec.role {
        sql.push_str(" AND role = ?");
        values.push(Value::Text(role.as_str().to_string()));
    }
    let placeholders = vec!["?"; targets.len()].join(", ");
    sql.push_str(&format!(" AND {} IN ({})", spec.target_column, placeholders));
    values.extend(targets.iter().map(|id| Value::Integer(*id)));

    let deleted = conn.execute(&sql, params_from_iter(values.iter()))?;
    debug!("Removed {} {} edges for owner {}", deleted, spec.table, owner_id);
    Ok(deleted)
}

fn insert_edge(
    conn: &Connection,
    spec: &ReferenceSpec,
    owner_id: RecordId,
    target_id: RecordId,
) -> rusqlite::Result<()> {
    let now = Utc::now().to_rfc3339();
    match spec.role {
        Some(role) => conn.execute(
            &format!(
                "INSERT INTO {} ({}, {}, role, created_at) VALUES (?1, ?2, ?3, ?4)",
                spec.table, spec.owner_column, spec.target_column
            ),
            params![owner_id, target_id, role.as_str(), now],
        )?,
        None => conn.execute(
            &format!(
                "INSERT INTO {} ({}, {}, created_at) VALUES (?1, ?2, ?3)",
                spec.table, spec.owner_column, spec.target_column
            ),
            params![owner_id, target_id, now],
        )?,
    };
    Ok(())
}

fn classify_insert_error(err: &rusqlite::Error) -> SyncWarningReason {
    match err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
        {
            SyncWarningReason::MissingTarget
        }
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            SyncWarningReason::AlreadyLinked
        }
        _ => SyncWarningReason::Storage,
    }
}

/// Owners whose text currently references `target`.
pub(crate) fn referencing_owners(conn: &Connection, target: EntityRef) -> Result<Vec<EntityRef>> {
    let mut owners = BTreeSet::new();

    for spec in all_references().filter(|spec| spec.target == target.kind) {
        let mut values = vec![Value::Integer(target.id)];
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            spec.owner_column, spec.table, spec.target_column
        );
        if let Some(role) = spec.role {
            sql.push_str(" AND role = ?2");
            values.push(Value::Text(role.as_str().to_string()));
        }

        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, RecordId>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        owners.extend(ids.into_iter().map(|id| EntityRef::new(spec.owner, id)));
    }

    Ok(owners.into_iter().collect())
}

/// DDL for one join table, derived from its registry entry.
pub(crate) fn join_table_ddl(spec: &ReferenceSpec) -> Vec<String> {
    let (role_column, key) = match spec.role {
        Some(_) => (
            "role TEXT NOT NULL DEFAULT 'related',\n                ",
            format!("{}, {}, role", spec.owner_column, spec.target_column),
        ),
        None => ("", format!("{}, {}", spec.owner_column, spec.target_column)),
    };
    let self_check = if spec.excludes_self() {
        format!(
            ",\n                CHECK ({} <> {})",
            spec.owner_column, spec.target_column
        )
    } else {
        String::new()
    };

    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                {owner_col} INTEGER NOT NULL REFERENCES {owner_table}(id) ON DELETE CASCADE,
                {target_col} INTEGER NOT NULL REFERENCES {target_table}(id) ON DELETE CASCADE,
                {role_column}created_at TEXT NOT NULL,
                PRIMARY KEY ({key}){self_check}
            )",
            table = spec.table,
            owner_col = spec.owner_column,
            owner_table = spec.owner.table(),
            target_col = spec.target_column,
            target_table = spec.target.table(),
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_{target_col} ON {table}({target_col})",
            table = spec.table,
            target_col = spec.target_column,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{NewTask, UpdateOptions};
    use crate::error::IntegrityError;
    use tempfile::NamedTempFile;

    fn mentions(items: &[(EntityKind, RecordId)]) -> HashSet<Mention> {
        items.iter().map(|(k, id)| Mention::new(*k, *id)).collect()
    }

    fn setup() -> (NamedTempFile, Database) {
        let temp = NamedTempFile::new().unwrap();
        let db = Database::new(temp.path()).unwrap();
        (temp, db)
    }

    fn task(db: &Database, title: &str) -> RecordId {
        db.create_task(
            &NewTask {
                title: title.to_string(),
                ..Default::default()
            },
            UpdateOptions::default(),
        )
        .unwrap()
        .record
        .id
    }

    #[test]
    fn test_registry_covers_every_kind() {
        for kind in EntityKind::ALL {
            assert_eq!(owner_spec(kind).kind, kind);
        }
        assert!(reference_spec(EntityKind::Task, EntityKind::Task).is_none());
        assert!(reference_spec(EntityKind::Plan, EntityKind::Plan)
            .unwrap()
            .excludes_self());
        assert_eq!(
            reference_spec(EntityKind::Log, EntityKind::Asset).unwrap().role,
            Some(EdgeRole::Related)
        );
    }

    #[test]
    fn test_diff_correctness() {
        let (_temp, db) = setup();
        let sync = ReferenceGraphSynchronizer::new();
        let owner = EntityRef::new(EntityKind::Task, task(&db, "Fix irrigation"));
        for name in ["a", "b", "c", "d", "e", "f", "g", "h", "i"] {
            db.create_asset(name, None).unwrap();
        }

        sync.reconcile(&db, owner, &mentions(&[(EntityKind::Asset, 5), (EntityKind::Asset, 7)]))
            .unwrap();
        let report = sync
            .reconcile(&db, owner, &mentions(&[(EntityKind::Asset, 7), (EntityKind::Asset, 9)]))
            .unwrap();

        let assets = report
            .targets
            .iter()
            .find(|t| t.target_kind == EntityKind::Asset)
            .unwrap();
        assert_eq!(assets.added, vec![9]);
        assert_eq!(assets.removed, vec![5]);
        assert_eq!(assets.unchanged, 1);
        assert_eq!(
            db.edge_targets(owner, EntityKind::Asset).unwrap(),
            vec![7, 9]
        );
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (_temp, db) = setup();
        let sync = ReferenceGraphSynchronizer::new();
        let owner = EntityRef::new(EntityKind::Task, task(&db, "Plant garlic"));
        let asset = db.create_asset("Tractor", None).unwrap().id;
        let location = db.create_location("North Field", None).unwrap().id;
        let wanted = mentions(&[(EntityKind::Asset, asset), (EntityKind::Location, location)]);

        let first = sync.reconcile(&db, owner, &wanted).unwrap();
        assert_eq!(first.writes(), 2);

        let second = sync.reconcile(&db, owner, &wanted).unwrap();
        assert_eq!(second.writes(), 0);
        assert!(second.warnings.is_empty());
    }

    #[test]
    fn test_reconcile_requires_existing_owner() {
        let (_temp, db) = setup();
        let sync = ReferenceGraphSynchronizer::new();
        let pump = db.create_asset("Pump", None).unwrap().id;
        let owner = EntityRef::new(EntityKind::Task, 404);

        let result = sync.reconcile(&db, owner, &mentions(&[(EntityKind::Asset, pump)]));
        assert!(matches!(
            result,
            Err(IntegrityError::NotFound {
                kind: EntityKind::Task,
                id: 404
            })
        ));
        assert!(db
            .referencing_owners(EntityRef::new(EntityKind::Asset, pump))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_missing_target_becomes_warning() {
        let (_temp, db) = setup();
        let sync = ReferenceGraphSynchronizer::new();
        let owner = EntityRef::new(EntityKind::Task, task(&db, "Inspect hives"));
        let asset = db.create_asset("Hive 1", None).unwrap().id;

        let report = sync
            .reconcile(
                &db,
                owner,
                &mentions(&[
                    (EntityKind::Asset, 404),
                    (EntityKind::Asset, asset),
                    (EntityKind::Log, 77),
                ]),
            )
            .unwrap();

        assert_eq!(report.added(), 1);
        assert_eq!(report.warnings.len(), 2);
        assert!(report
            .warnings
            .iter()
            .all(|w| w.reason == SyncWarningReason::MissingTarget));
        assert_eq!(db.edge_targets(owner, EntityKind::Asset).unwrap(), vec![asset]);
    }

    #[test]
    fn test_plan_self_mention_discarded() {
        let (_temp, db) = setup();
        let sync = ReferenceGraphSynchronizer::new();
        let plan = db
            .create_plan("Spring", None, None, UpdateOptions::default())
            .unwrap()
            .record
            .id;
        let other = db
            .create_plan("Summer", None, None, UpdateOptions::default())
            .unwrap()
            .record
            .id;
        let owner = EntityRef::new(EntityKind::Plan, plan);

        let report = sync
            .reconcile(&db, owner, &mentions(&[(EntityKind::Plan, plan), (EntityKind::Plan, other)]))
            .unwrap();

        assert!(report.warnings.is_empty());
        assert_eq!(db.edge_targets(owner, EntityKind::Plan).unwrap(), vec![other]);
    }

    #[test]
    fn test_unlinked_kinds_ignored() {
        let (_temp, db) = setup();
        let sync = ReferenceGraphSynchronizer::new();
        let first = task(&db, "One");
        let second = task(&db, "Two");
        let owner = EntityRef::new(EntityKind::Task, first);

        let report = sync
            .reconcile(&db, owner, &mentions(&[(EntityKind::Task, second)]))
            .unwrap();
        assert_eq!(report.writes(), 0);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_role_scoped_edges_leave_moves_alone() {
        let (_temp, db) = setup();
        let sync = ReferenceGraphSynchronizer::new();
        let cow = db.create_asset("Cow 12", None).unwrap().id;
        let log = db
            .create_log("Move herd", None, UpdateOptions::default())
            .unwrap()
            .record
            .id;
        db.record_movement(log, cow).unwrap();
        let owner = EntityRef::new(EntityKind::Log, log);

        sync.reconcile(&db, owner, &mentions(&[(EntityKind::Asset, cow)]))
            .unwrap();
        assert_eq!(db.edge_targets(owner, EntityKind::Asset).unwrap(), vec![cow]);

        // Dropping the mention removes the related edge but not the move
        let report = sync.reconcile(&db, owner, &HashSet::new()).unwrap();
        assert_eq!(report.removed(), 1);
        assert!(db.edge_targets(owner, EntityKind::Asset).unwrap().is_empty());
        assert_eq!(db.moved_assets(log).unwrap(), vec![cow]);
    }

    #[test]
    fn test_inverse_lookup() {
        let (_temp, db) = setup();
        let sync = ReferenceGraphSynchronizer::new();
        let barn = db.create_asset("Barn", None).unwrap().id;
        let first = task(&db, "Paint barn");
        let plan = db
            .create_plan("Maintenance", None, None, UpdateOptions::default())
            .unwrap()
            .record
            .id;

        sync.reconcile(
            &db,
            EntityRef::new(EntityKind::Task, first),
            &mentions(&[(EntityKind::Asset, barn)]),
        )
        .unwrap();
        sync.reconcile(
            &db,
            EntityRef::new(EntityKind::Plan, plan),
            &mentions(&[(EntityKind::Asset, barn)]),
        )
        .unwrap();

        let owners = db
            .referencing_owners(EntityRef::new(EntityKind::Asset, barn))
            .unwrap();
        assert_eq!(
            owners,
            vec![
                EntityRef::new(EntityKind::Task, first),
                EntityRef::new(EntityKind::Plan, plan)
            ]
        );
    }
}
