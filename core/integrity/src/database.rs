use chrono::Utc;
use farmstead_schemas::{
    Asset, CycleId, EdgeRole, EntityKind, EntityRef, Location, Log, Mention, Plan, RecordId,
    RelationCandidate, RelationId, RelationType, SyncReport, Task, TaskRelation, TaskState,
    UnknownToken,
};
use rusqlite::types::{Type, Value};
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{IntegrityError, Result};
use crate::hierarchy::{self, is_hierarchical, ChildLookup, HierarchyGuard, ParentLookup};
use crate::relation::{RelationGuard, RelationLookup};
use crate::sync::{self, ReferenceGraphSynchronizer};

const TASK_COLUMNS: &str = "t.id, t.title, t.description, t.state, t.cycle_id, t.parent_id, t.plan_id";
const RELATION_COLUMNS: &str = "id, source_task_id, target_task_id, relation_type";

/// Options for writes that may trigger derived effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Skip reference reconciliation for a text change.
    pub suppress_derived_effects: bool,
}

impl UpdateOptions {
    pub fn suppressed() -> Self {
        Self {
            suppress_derived_effects: true,
        }
    }
}

/// A written record plus the reference sync its text triggered, if any.
#[derive(Debug, Clone, Serialize)]
pub struct Saved<T> {
    pub record: T,
    pub sync: Option<SyncReport>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub state: Option<TaskState>,
    pub cycle_id: Option<CycleId>,
    pub parent_id: Option<RecordId>,
    pub plan_id: Option<RecordId>,
}

/// Partial task update. `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub state: Option<TaskState>,
    pub cycle_id: Option<Option<CycleId>>,
    pub parent_id: Option<Option<RecordId>>,
    pub plan_id: Option<Option<RecordId>>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub cycle_id: Option<CycleId>,
    pub parent_id: Option<RecordId>,
    pub plan_id: Option<RecordId>,
    /// Only tasks without a cycle.
    pub unscheduled: bool,
    /// Only backlog, todo and in-progress tasks.
    pub active: bool,
    /// Only tasks with at least one active blocker.
    pub blocked: bool,
}

pub struct Database {
    conn: Connection,
    sync: ReferenceGraphSynchronizer,
}

impl Database {
    /// Open (or create) the database and its schema
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;

        let db = Self {
            conn,
            sync: ReferenceGraphSynchronizer::new(),
        };
        db.init_schema()?;

        info!("Database initialized");
        Ok(db)
    }

    pub fn synchronizer(&self) -> &ReferenceGraphSynchronizer {
        &self.sync
    }

    /// Start a write transaction that takes SQLite's write lock up front, so
    /// read-validate-write sequences are serialized across connections.
    pub(crate) fn transaction(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Create all tables and indexes
    fn init_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS assets (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                notes TEXT,
                parent_id INTEGER REFERENCES assets(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS locations (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                notes TEXT,
                parent_id INTEGER REFERENCES locations(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                notes TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // === WORK TRACKING ===

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS plans (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                parent_id INTEGER REFERENCES plans(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // (start_date, end_date) uniqueness is the race guard for monthly generation
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS cycles (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (start_date, end_date),
                CHECK (end_date >= start_date)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                state TEXT NOT NULL DEFAULT 'backlog',
                cycle_id INTEGER REFERENCES cycles(id) ON DELETE SET NULL,
                parent_id INTEGER REFERENCES tasks(id) ON DELETE SET NULL,
                plan_id INTEGER REFERENCES plans(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS task_relations (
                id INTEGER PRIMARY KEY,
                source_task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                target_task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                relation_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (source_task_id, target_task_id, relation_type),
                CHECK (source_task_id <> target_task_id)
            )",
            [],
        )?;

        // === REFERENCE EDGES ===
        for spec in sync::all_references() {
            for statement in sync::join_table_ddl(spec) {
                self.conn.execute(&statement, [])?;
            }
        }

        // Indexes for performance
        for kind in hierarchy::HIERARCHICAL_KINDS {
            self.conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_parent ON {table}(parent_id)",
                    table = kind.table()
                ),
                [],
            )?;
        }

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_cycle ON tasks(cycle_id)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cycles_dates ON cycles(start_date, end_date)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_relations_target ON task_relations(target_task_id)",
            [],
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========== FARM RECORDS ==========

    /// Create an asset, optionally under a parent asset
    pub fn create_asset(&self, name: &str, parent_id: Option<RecordId>) -> Result<Asset> {
        let id = self.insert_tree_node(EntityKind::Asset, name, parent_id)?;
        info!("Created asset: {} ({})", name, id);
        self.get_asset(id)?.ok_or(IntegrityError::NotFound {
            kind: EntityKind::Asset,
            id,
        })
    }

    pub fn get_asset(&self, id: RecordId) -> Result<Option<Asset>> {
        let asset = self
            .conn
            .query_row(
                "SELECT id, name, notes, parent_id FROM assets WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Asset {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        notes: row.get(2)?,
                        parent_id: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(asset)
    }

    /// Create a location, optionally under a parent location
    pub fn create_location(&self, name: &str, parent_id: Option<RecordId>) -> Result<Location> {
        let id = self.insert_tree_node(EntityKind::Location, name, parent_id)?;
        info!("Created location: {} ({})", name, id);
        self.get_location(id)?.ok_or(IntegrityError::NotFound {
            kind: EntityKind::Location,
            id,
        })
    }

    pub fn get_location(&self, id: RecordId) -> Result<Option<Location>> {
        let location = self
            .conn
            .query_row(
                "SELECT id, name, notes, parent_id FROM locations WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Location {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        notes: row.get(2)?,
                        parent_id: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(location)
    }

    fn insert_tree_node(
        &self,
        kind: EntityKind,
        name: &str,
        parent_id: Option<RecordId>,
    ) -> Result<RecordId> {
        let tx = self.transaction()?;
        validate_parent_in(&tx, kind, None, parent_id)?;

        let now = Utc::now().to_rfc3339();
        tx.execute(
            &format!(
                "INSERT INTO {} (name, parent_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
                kind.table()
            ),
            params![name, parent_id, now, now],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Create a log; mentions in its notes are linked unless suppressed
    pub fn create_log(
        &self,
        name: &str,
        notes: Option<&str>,
        options: UpdateOptions,
    ) -> Result<Saved<Log>> {
        let tx = self.transaction()?;
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO logs (name, notes, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, notes, now, now],
        )?;
        let id = tx.last_insert_rowid();
        let sync = self.derived_sync(&tx, EntityRef::new(EntityKind::Log, id), notes, options)?;
        tx.commit()?;

        info!("Created log: {} ({})", name, id);
        let record = self.get_log(id)?.ok_or(IntegrityError::NotFound {
            kind: EntityKind::Log,
            id,
        })?;
        Ok(Saved { record, sync })
    }

    pub fn get_log(&self, id: RecordId) -> Result<Option<Log>> {
        let log = self
            .conn
            .query_row(
                "SELECT id, name, notes FROM logs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Log {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        notes: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(log)
    }

    /// Record that a log moved an asset. Movement edges are never touched by
    /// reference reconciliation.
    pub fn record_movement(&self, log_id: RecordId, asset_id: RecordId) -> Result<()> {
        let tx = self.transaction()?;
        ensure_exists(&tx, EntityKind::Log, log_id)?;
        ensure_exists(&tx, EntityKind::Asset, asset_id)?;
        tx.execute(
            "INSERT OR IGNORE INTO asset_logs (log_id, asset_id, role, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![log_id, asset_id, EdgeRole::Moved.as_str(), Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        debug!("Log {} moved asset {}", log_id, asset_id);
        Ok(())
    }

    pub fn moved_assets(&self, log_id: RecordId) -> Result<Vec<RecordId>> {
        let mut stmt = self.conn.prepare(
            "SELECT asset_id FROM asset_logs WHERE log_id = ?1 AND role = ?2 ORDER BY asset_id",
        )?;
        let ids = stmt
            .query_map(params![log_id, EdgeRole::Moved.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<RecordId>>>()?;
        Ok(ids)
    }

    // ========== PLANS ==========

    /// Create a plan; mentions in its description are linked unless suppressed
    pub fn create_plan(
        &self,
        name: &str,
        description: Option<&str>,
        parent_id: Option<RecordId>,
        options: UpdateOptions,
    ) -> Result<Saved<Plan>> {
        let tx = self.transaction()?;
        validate_parent_in(&tx, EntityKind::Plan, None, parent_id)?;

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO plans (name, description, parent_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, description, parent_id, now, now],
        )?;
        let id = tx.last_insert_rowid();
        let sync = self.derived_sync(
            &tx,
            EntityRef::new(EntityKind::Plan, id),
            description,
            options,
        )?;
        tx.commit()?;

        info!("Created plan: {} ({})", name, id);
        let record = self.get_plan(id)?.ok_or(IntegrityError::NotFound {
            kind: EntityKind::Plan,
            id,
        })?;
        Ok(Saved { record, sync })
    }

    pub fn get_plan(&self, id: RecordId) -> Result<Option<Plan>> {
        let plan = self
            .conn
            .query_row(
                "SELECT id, name, description, parent_id FROM plans WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Plan {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        parent_id: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(plan)
    }

    // ========== TASKS ==========

    /// Create a task; mentions in its description are linked unless suppressed
    pub fn create_task(&self, new: &NewTask, options: UpdateOptions) -> Result<Saved<Task>> {
        let tx = self.transaction()?;
        validate_parent_in(&tx, EntityKind::Task, None, new.parent_id)?;
        if let Some(cycle_id) = new.cycle_id {
            ensure_cycle_exists(&tx, cycle_id)?;
        }
        if let Some(plan_id) = new.plan_id {
            ensure_exists(&tx, EntityKind::Plan, plan_id)?;
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO tasks (title, description, state, cycle_id, parent_id, plan_id,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.title,
                new.description,
                new.state.unwrap_or(TaskState::Backlog).as_str(),
                new.cycle_id.map(|c| c.0),
                new.parent_id,
                new.plan_id,
                now,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();
        let sync = self.derived_sync(
            &tx,
            EntityRef::new(EntityKind::Task, id),
            new.description.as_deref(),
            options,
        )?;
        let record = get_task_in(&tx, id)?.ok_or(IntegrityError::NotFound {
            kind: EntityKind::Task,
            id,
        })?;
        tx.commit()?;

        info!("Created task: {} ({})", new.title, id);
        Ok(Saved { record, sync })
    }

    pub fn get_task(&self, id: RecordId) -> Result<Option<Task>> {
        get_task_in(&self.conn, id)
    }

    /// Apply a partial update to a task in its own transaction
    pub fn update_task(
        &self,
        id: RecordId,
        update: &TaskUpdate,
        options: UpdateOptions,
    ) -> Result<Saved<Task>> {
        let tx = self.transaction()?;
        let saved = self.apply_task_update(&tx, id, update, options)?;
        tx.commit()?;
        Ok(saved)
    }

    /// Validate and write a task update on an open transaction.
    pub(crate) fn apply_task_update(
        &self,
        conn: &Connection,
        id: RecordId,
        update: &TaskUpdate,
        options: UpdateOptions,
    ) -> Result<Saved<Task>> {
        let existing = get_task_in(conn, id)?.ok_or(IntegrityError::NotFound {
            kind: EntityKind::Task,
            id,
        })?;

        let mut task = existing.clone();
        if let Some(title) = &update.title {
            task.title = title.clone();
        }
        if let Some(description) = &update.description {
            task.description = description.clone();
        }
        if let Some(state) = update.state {
            task.state = state;
        }
        if let Some(cycle_id) = update.cycle_id {
            task.cycle_id = cycle_id;
        }
        if let Some(parent_id) = update.parent_id {
            task.parent_id = parent_id;
        }
        if let Some(plan_id) = update.plan_id {
            task.plan_id = plan_id;
        }

        if task.parent_id != existing.parent_id {
            validate_parent_in(conn, EntityKind::Task, Some(id), task.parent_id)?;
        }
        if task.cycle_id != existing.cycle_id {
            if let Some(cycle_id) = task.cycle_id {
                ensure_cycle_exists(conn, cycle_id)?;
            }
        }
        if task.plan_id != existing.plan_id {
            if let Some(plan_id) = task.plan_id {
                ensure_exists(conn, EntityKind::Plan, plan_id)?;
            }
        }

        conn.execute(
            "UPDATE tasks
             SET title = ?1, description = ?2, state = ?3, cycle_id = ?4, parent_id = ?5,
                 plan_id = ?6, updated_at = ?7
             WHERE id = ?8",
            params![
                task.title,
                task.description,
                task.state.as_str(),
                task.cycle_id.map(|c| c.0),
                task.parent_id,
                task.plan_id,
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        debug!("Updated task {}", id);

        let sync = if task.description != existing.description {
            self.derived_sync(
                conn,
                EntityRef::new(EntityKind::Task, id),
                task.description.as_deref(),
                options,
            )?
        } else {
            None
        };

        Ok(Saved { record: task, sync })
    }

    /// List tasks matching a filter, ordered by id
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(state) = filter.state {
            values.push(Value::Text(state.as_str().to_string()));
            clauses.push(format!("t.state = ?{}", values.len()));
        }
        if let Some(cycle_id) = filter.cycle_id {
            values.push(Value::Integer(cycle_id.0));
            clauses.push(format!("t.cycle_id = ?{}", values.len()));
        }
        if let Some(parent_id) = filter.parent_id {
            values.push(Value::Integer(parent_id));
            clauses.push(format!("t.parent_id = ?{}", values.len()));
        }
        if let Some(plan_id) = filter.plan_id {
            values.push(Value::Integer(plan_id));
            clauses.push(format!("t.plan_id = ?{}", values.len()));
        }
        if filter.unscheduled {
            clauses.push("t.cycle_id IS NULL".to_string());
        }
        if filter.active {
            clauses.push(format!("t.state IN ({})", active_states_sql()));
        }
        if filter.blocked {
            values.push(Value::Text(RelationType::Blocks.as_str().to_string()));
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM task_relations r
                         JOIN tasks b ON b.id = r.source_task_id
                         WHERE r.target_task_id = t.id AND r.relation_type = ?{}
                           AND b.state IN ({}))",
                values.len(),
                active_states_sql()
            ));
        }

        let mut sql = format!("SELECT {} FROM tasks t", TASK_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY t.id");

        let mut stmt = self.conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params_from_iter(values.iter()), row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    // ========== TEXT FIELDS & REFERENCES ==========

    /// Save an owner's rich-text field and reconcile its mentions unless
    /// derived effects are suppressed.
    pub fn save_text(
        &self,
        owner: EntityRef,
        text: Option<&str>,
        options: UpdateOptions,
    ) -> Result<Option<SyncReport>> {
        let spec = sync::owner_spec(owner.kind);

        let tx = self.transaction()?;
        ensure_exists(&tx, owner.kind, owner.id)?;
        tx.execute(
            &format!(
                "UPDATE {} SET {} = ?1, updated_at = ?2 WHERE id = ?3",
                owner.kind.table(),
                spec.text_column
            ),
            params![text, Utc::now().to_rfc3339(), owner.id],
        )?;
        let report = self.derived_sync(&tx, owner, text, options)?;
        tx.commit()?;

        debug!("Saved {} of {}", spec.text_column, owner);
        Ok(report)
    }

    /// Reconcile `owner`'s edges against an explicit mention set.
    pub fn reconcile(&self, owner: EntityRef, mentions: &HashSet<Mention>) -> Result<SyncReport> {
        self.sync.reconcile(self, owner, mentions)
    }

    fn derived_sync(
        &self,
        conn: &Connection,
        owner: EntityRef,
        text: Option<&str>,
        options: UpdateOptions,
    ) -> Result<Option<SyncReport>> {
        if options.suppress_derived_effects {
            debug!("Reference sync for {} suppressed", owner);
            return Ok(None);
        }
        let report = self.sync.sync_text_in(conn, owner, text.unwrap_or_default())?;
        Ok(Some(report))
    }

    /// Ids currently linked from `owner` to records of `target_kind`.
    pub fn edge_targets(&self, owner: EntityRef, target_kind: EntityKind) -> Result<Vec<RecordId>> {
        match sync::reference_spec(owner.kind, target_kind) {
            Some(spec) => Ok(sync::current_targets(&self.conn, spec, owner.id)?
                .into_iter()
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Every owner whose text references `target`.
    pub fn referencing_owners(&self, target: EntityRef) -> Result<Vec<EntityRef>> {
        sync::referencing_owners(&self.conn, target)
    }

    // ========== HIERARCHIES ==========

    /// Move a node under a new parent (or to the root with `None`)
    pub fn set_parent(
        &self,
        kind: EntityKind,
        id: RecordId,
        parent_id: Option<RecordId>,
    ) -> Result<()> {
        let tx = self.transaction()?;
        ensure_exists(&tx, kind, id)?;
        validate_parent_in(&tx, kind, Some(id), parent_id)?;
        tx.execute(
            &format!(
                "UPDATE {} SET parent_id = ?1, updated_at = ?2 WHERE id = ?3",
                kind.table()
            ),
            params![parent_id, Utc::now().to_rfc3339(), id],
        )?;
        tx.commit()?;

        info!("Set parent of {} {} to {:?}", kind, id, parent_id);
        Ok(())
    }

    pub fn parent_of(&self, kind: EntityKind, id: RecordId) -> Result<Option<RecordId>> {
        TreeTable::new(&self.conn, kind)?.parent_of(id)
    }

    pub fn children(&self, kind: EntityKind, id: RecordId) -> Result<Vec<RecordId>> {
        TreeTable::new(&self.conn, kind)?.children_of(id)
    }

    /// Ancestors of a node, nearest first
    pub fn ancestors(&self, kind: EntityKind, id: RecordId) -> Result<Vec<RecordId>> {
        hierarchy::ancestors(id, &TreeTable::new(&self.conn, kind)?)
    }

    /// Descendants of a node, breadth first
    pub fn descendants(&self, kind: EntityKind, id: RecordId) -> Result<Vec<RecordId>> {
        hierarchy::descendants(id, &TreeTable::new(&self.conn, kind)?)
    }

    // ========== TASK RELATIONS ==========

    /// Create a typed relation between two tasks
    pub fn create_task_relation(&self, candidate: &RelationCandidate) -> Result<TaskRelation> {
        let tx = self.transaction()?;
        RelationGuard::new().validate(candidate, &RelationTable::new(&tx), None)?;
        ensure_exists(&tx, EntityKind::Task, candidate.source_task_id)?;
        ensure_exists(&tx, EntityKind::Task, candidate.target_task_id)?;

        tx.execute(
            "INSERT INTO task_relations (source_task_id, target_task_id, relation_type, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                candidate.source_task_id,
                candidate.target_task_id,
                candidate.relation_type.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        let id = RelationId(tx.last_insert_rowid());
        tx.commit()?;

        info!(
            "Created relation: {} -{}-> {} ({})",
            candidate.source_task_id,
            candidate.relation_type.as_str(),
            candidate.target_task_id,
            id
        );
        Ok(TaskRelation {
            id,
            source_task_id: candidate.source_task_id,
            target_task_id: candidate.target_task_id,
            relation_type: candidate.relation_type,
        })
    }

    /// Rewrite an existing relation, revalidated as if it were new
    pub fn update_task_relation(
        &self,
        id: RelationId,
        candidate: &RelationCandidate,
    ) -> Result<TaskRelation> {
        let tx = self.transaction()?;
        get_relation_in(&tx, id)?.ok_or(IntegrityError::RelationNotFound(id))?;
        RelationGuard::new().validate(candidate, &RelationTable::new(&tx), Some(id))?;
        ensure_exists(&tx, EntityKind::Task, candidate.source_task_id)?;
        ensure_exists(&tx, EntityKind::Task, candidate.target_task_id)?;

        tx.execute(
            "UPDATE task_relations
             SET source_task_id = ?1, target_task_id = ?2, relation_type = ?3
             WHERE id = ?4",
            params![
                candidate.source_task_id,
                candidate.target_task_id,
                candidate.relation_type.as_str(),
                id.0
            ],
        )?;
        tx.commit()?;

        info!("Updated relation {}", id);
        Ok(TaskRelation {
            id,
            source_task_id: candidate.source_task_id,
            target_task_id: candidate.target_task_id,
            relation_type: candidate.relation_type,
        })
    }

    pub fn delete_task_relation(&self, id: RelationId) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM task_relations WHERE id = ?1", params![id.0])?;

        if deleted > 0 {
            info!("Deleted relation: {}", id);
        }
        Ok(deleted > 0)
    }

    pub fn get_task_relation(&self, id: RelationId) -> Result<Option<TaskRelation>> {
        get_relation_in(&self.conn, id)
    }

    /// Relations where the task is either end
    pub fn relations_for_task(&self, task_id: RecordId) -> Result<Vec<TaskRelation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM task_relations
             WHERE source_task_id = ?1 OR target_task_id = ?1
             ORDER BY id",
            RELATION_COLUMNS
        ))?;
        let relations = stmt
            .query_map(params![task_id], row_to_relation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(relations)
    }

    /// Tasks that block `task_id`
    pub fn blockers_of(&self, task_id: RecordId) -> Result<Vec<Task>> {
        self.related_tasks(
            "JOIN task_relations r ON r.source_task_id = t.id WHERE r.target_task_id = ?1",
            task_id,
        )
    }

    /// Tasks that `task_id` blocks
    pub fn blocked_by(&self, task_id: RecordId) -> Result<Vec<Task>> {
        self.related_tasks(
            "JOIN task_relations r ON r.target_task_id = t.id WHERE r.source_task_id = ?1",
            task_id,
        )
    }

    /// A task is blocked while any of its blockers is still active
    pub fn is_blocked(&self, task_id: RecordId) -> Result<bool> {
        Ok(self
            .blockers_of(task_id)?
            .iter()
            .any(|blocker| blocker.state.is_active()))
    }

    fn related_tasks(&self, join: &str, task_id: RecordId) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks t {} AND r.relation_type = ?2 ORDER BY t.id",
            TASK_COLUMNS, join
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params![task_id, RelationType::Blocks.as_str()], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }
}

/// Parent/child lookups over one tree table.
pub(crate) struct TreeTable<'c> {
    conn: &'c Connection,
    kind: EntityKind,
}

impl<'c> TreeTable<'c> {
    pub(crate) fn new(conn: &'c Connection, kind: EntityKind) -> Result<Self> {
        if !is_hierarchical(kind) {
            return Err(IntegrityError::NotHierarchical(kind));
        }
        Ok(Self { conn, kind })
    }
}

impl ParentLookup for TreeTable<'_> {
    fn parent_of(&self, id: RecordId) -> Result<Option<RecordId>> {
        let parent: Option<Option<RecordId>> = self
            .conn
            .query_row(
                &format!("SELECT parent_id FROM {} WHERE id = ?1", self.kind.table()),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(parent.flatten())
    }
}

impl ChildLookup for TreeTable<'_> {
    fn children_of(&self, id: RecordId) -> Result<Vec<RecordId>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id FROM {} WHERE parent_id = ?1 ORDER BY id",
            self.kind.table()
        ))?;
        let children = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<RecordId>>>()?;
        Ok(children)
    }
}

/// Relation existence checks against the task_relations table.
pub(crate) struct RelationTable<'c> {
    conn: &'c Connection,
}

impl<'c> RelationTable<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl RelationLookup for RelationTable<'_> {
    fn exists(
        &self,
        source_task_id: RecordId,
        target_task_id: RecordId,
        relation_type: RelationType,
        excluding: Option<RelationId>,
    ) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM task_relations
                 WHERE source_task_id = ?1 AND target_task_id = ?2 AND relation_type = ?3
                   AND (?4 IS NULL OR id <> ?4)
                 LIMIT 1",
                params![
                    source_task_id,
                    target_task_id,
                    relation_type.as_str(),
                    excluding.map(|r| r.0)
                ],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        Ok(found)
    }
}

/// Existence of the parent plus the hierarchy guard, on an open transaction.
fn validate_parent_in(
    conn: &Connection,
    kind: EntityKind,
    node_id: Option<RecordId>,
    parent_id: Option<RecordId>,
) -> Result<()> {
    let tree = TreeTable::new(conn, kind)?;
    if let Some(parent_id) = parent_id {
        ensure_exists(conn, kind, parent_id)?;
    }
    HierarchyGuard::new(kind).validate_parent(node_id, parent_id, &tree)
}

pub(crate) fn ensure_exists(conn: &Connection, kind: EntityKind, id: RecordId) -> Result<()> {
    let found: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?1", kind.table()),
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    match found {
        Some(_) => Ok(()),
        None => Err(IntegrityError::NotFound { kind, id }),
    }
}

fn ensure_cycle_exists(conn: &Connection, id: CycleId) -> Result<()> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM cycles WHERE id = ?1", params![id.0], |row| {
            row.get(0)
        })
        .optional()?;

    found
        .map(|_| ())
        .ok_or(IntegrityError::CycleNotFound(id))
}

pub(crate) fn get_task_in(conn: &Connection, id: RecordId) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {} FROM tasks t WHERE t.id = ?1", TASK_COLUMNS),
            params![id],
            row_to_task,
        )
        .optional()?;
    Ok(task)
}

fn get_relation_in(conn: &Connection, id: RelationId) -> Result<Option<TaskRelation>> {
    let relation = conn
        .query_row(
            &format!("SELECT {} FROM task_relations WHERE id = ?1", RELATION_COLUMNS),
            params![id.0],
            row_to_relation,
        )
        .optional()?;
    Ok(relation)
}

/// `'backlog', 'todo', 'in_progress'` for SQL `IN` lists.
pub(crate) fn active_states_sql() -> String {
    TaskState::ACTIVE
        .iter()
        .map(|state| format!("'{}'", state.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let state_raw: String = row.get(3)?;
    let state = state_raw
        .parse::<TaskState>()
        .map_err(|err| token_error(3, err))?;

    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        state,
        cycle_id: row.get::<_, Option<i64>>(4)?.map(CycleId),
        parent_id: row.get(5)?,
        plan_id: row.get(6)?,
    })
}

fn row_to_relation(row: &Row) -> rusqlite::Result<TaskRelation> {
    let type_raw: String = row.get(3)?;
    let relation_type = type_raw
        .parse::<RelationType>()
        .map_err(|err| token_error(3, err))?;

    Ok(TaskRelation {
        id: RelationId(row.get(0)?),
        source_task_id: row.get(1)?,
        target_task_id: row.get(2)?,
        relation_type,
    })
}

fn token_error(index: usize, err: UnknownToken) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}
