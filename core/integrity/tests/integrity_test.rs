use chrono::NaiveDate;
use farmstead_integrity::{
    CycleScheduler, Database, IntegrityError, NewTask, RolloverEngine, TaskUpdate, UpdateOptions,
};
use farmstead_schemas::{
    CycleTimeframe, EntityKind, EntityRef, Mention, RecordId, RelationCandidate, RelationType,
    SyncWarningReason, TaskState,
};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::NamedTempFile;

fn setup() -> (NamedTempFile, Database) {
    let temp = NamedTempFile::new().unwrap();
    let db = Database::new(temp.path()).unwrap();
    (temp, db)
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn mention(kind: EntityKind, id: RecordId) -> String {
    format!(
        r#"<span data-mention-type="{}" data-mention-id="{}">@{}</span>"#,
        kind.as_str(),
        id,
        id
    )
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

fn code<T: std::fmt::Debug>(result: Result<T, IntegrityError>) -> &'static str {
    result
        .unwrap_err()
        .validation()
        .map(|err| err.code())
        .expect("validation error")
}

#[test]
fn test_reconcile_is_idempotent() {
    let (_temp, db) = setup();
    let pump = db.create_asset("Pump", None).unwrap().id;
    let well = db.create_location("Well", None).unwrap().id;
    let owner = EntityRef::new(EntityKind::Task, task(&db, "Fix pump"));
    let text = format!(
        "{} at {}",
        mention(EntityKind::Asset, pump),
        mention(EntityKind::Location, well)
    );

    let first = db.save_text(owner, Some(&text), UpdateOptions::default()).unwrap().unwrap();
    assert_eq!(first.added(), 2);

    let second = db.save_text(owner, Some(&text), UpdateOptions::default()).unwrap().unwrap();
    assert_eq!(second.writes(), 0);
    assert_eq!(db.edge_targets(owner, EntityKind::Asset).unwrap(), vec![pump]);
}

#[test]
fn test_reconcile_applies_exact_diff() {
    let (_temp, db) = setup();
    let ids: Vec<RecordId> = (1..=9)
        .map(|n| db.create_asset(&format!("Bed {}", n), None).unwrap().id)
        .collect();
    let owner = EntityRef::new(EntityKind::Plan, {
        db.create_plan("Rotation", None, None, UpdateOptions::default())
            .unwrap()
            .record
            .id
    });

    let initial: HashSet<Mention> = [5, 7]
        .iter()
        .map(|i| Mention::new(EntityKind::Asset, ids[i - 1]))
        .collect();
    db.reconcile(owner, &initial).unwrap();

    let desired: HashSet<Mention> = [7, 9]
        .iter()
        .map(|i| Mention::new(EntityKind::Asset, ids[i - 1]))
        .collect();
    let report = db.reconcile(owner, &desired).unwrap();

    assert_eq!(report.added(), 1);
    assert_eq!(report.removed(), 1);
    assert_eq!(
        db.edge_targets(owner, EntityKind::Asset).unwrap(),
        vec![ids[6], ids[8]]
    );
}

#[test]
fn test_missing_target_is_a_warning() {
    let (_temp, db) = setup();
    let real = db.create_asset("Mower", None).unwrap().id;
    let owner = EntityRef::new(EntityKind::Task, task(&db, "Mow"));
    let text = format!(
        "{} {}",
        mention(EntityKind::Asset, real),
        mention(EntityKind::Asset, 4040)
    );

    let report = db.save_text(owner, Some(&text), UpdateOptions::default()).unwrap().unwrap();

    assert_eq!(report.added(), 1);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].reason, SyncWarningReason::MissingTarget);
    assert_eq!(db.edge_targets(owner, EntityKind::Asset).unwrap(), vec![real]);
}

#[test]
fn test_hierarchy_stays_acyclic() {
    let (_temp, db) = setup();
    let a = task(&db, "A");
    let b = task(&db, "B");
    let c = task(&db, "C");
    db.set_parent(EntityKind::Task, b, Some(a)).unwrap();
    db.set_parent(EntityKind::Task, c, Some(b)).unwrap();

    assert_eq!(code(db.set_parent(EntityKind::Task, a, Some(c))), "cycle");
    assert_eq!(code(db.set_parent(EntityKind::Task, a, Some(a))), "self_reference");
    assert_eq!(db.ancestors(EntityKind::Task, c).unwrap(), vec![b, a]);
    assert_eq!(db.get_task(a).unwrap().unwrap().parent_id, None);
}

#[test]
fn test_relation_uniqueness_and_symmetry() {
    let (_temp, db) = setup();
    let a = task(&db, "A");
    let b = task(&db, "B");
    let rel = |source, target, relation_type| RelationCandidate {
        source_task_id: source,
        target_task_id: target,
        relation_type,
    };

    db.create_task_relation(&rel(a, b, RelationType::Blocks)).unwrap();
    assert_eq!(
        code(db.create_task_relation(&rel(a, b, RelationType::Blocks))),
        "duplicate_triple"
    );
    assert!(db.create_task_relation(&rel(b, a, RelationType::Blocks)).is_ok());

    db.create_task_relation(&rel(a, b, RelationType::Related)).unwrap();
    assert_eq!(
        code(db.create_task_relation(&rel(b, a, RelationType::Related))),
        "inverse_duplicate"
    );
}

#[test]
fn test_month_generation_is_idempotent() {
    let (_temp, db) = setup();
    let scheduler = CycleScheduler::new();

    let first = scheduler.generate_for_month(&db, 2026, 3).unwrap();
    let second = scheduler.generate_for_month(&db, 2026, 3).unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!((first.start_date, first.end_date), (date(2026, 3, 1), date(2026, 3, 31)));
}

#[test]
fn test_cycles_never_overlap() {
    let (_temp, db) = setup();
    let scheduler = CycleScheduler::new();
    scheduler
        .create_cycle(&db, "January", date(2026, 1, 1), date(2026, 1, 31))
        .unwrap();

    assert_eq!(
        code(scheduler.create_cycle(&db, "Straddle", date(2026, 1, 15), date(2026, 2, 15))),
        "cycle_overlap"
    );
}

#[test]
fn test_rollover_selection_and_exclusion() {
    let (_temp, db) = setup();
    let scheduler = CycleScheduler::new();
    let engine = RolloverEngine::new();
    let past = scheduler.generate_for_month(&db, 2026, 8).unwrap();

    let open = task(&db, "Bale hay");
    let finished = task(&db, "Cut hay");
    for (id, state) in [(open, TaskState::Todo), (finished, TaskState::Done)] {
        db.update_task(
            id,
            &TaskUpdate {
                state: Some(state),
                cycle_id: Some(Some(past.id)),
                ..Default::default()
            },
            UpdateOptions::default(),
        )
        .unwrap();
    }

    let today = date(2026, 10, 18);
    let report = engine.rollover_from_past_cycles(&db, today).unwrap();
    assert_eq!(report.rolled_over, 1);
    assert_eq!(report.tasks[0].id, open);
    assert_eq!(report.tasks[0].to_cycle, "October 2026");

    let again = engine.rollover_from_past_cycles(&db, today).unwrap();
    assert_eq!(again.rolled_over, 0);

    assert_eq!(db.get_task(finished).unwrap().unwrap().cycle_id, Some(past.id));
}

#[test]
fn test_movement_edges_survive_reconcile() {
    let (_temp, db) = setup();
    let goat = db.create_asset("Goat", None).unwrap().id;
    let log = db
        .create_log("Moved goat", None, UpdateOptions::default())
        .unwrap()
        .record
        .id;
    db.record_movement(log, goat).unwrap();

    let owner = EntityRef::new(EntityKind::Log, log);
    db.save_text(owner, Some(&mention(EntityKind::Asset, goat)), UpdateOptions::default())
        .unwrap();
    db.save_text(owner, Some(""), UpdateOptions::default()).unwrap();

    assert_eq!(db.moved_assets(log).unwrap(), vec![goat]);
    assert!(db.edge_targets(owner, EntityKind::Asset).unwrap().is_empty());
}

#[test]
fn test_concurrent_reparents_cannot_form_a_cycle() {
    let (temp, db) = setup();
    let a = task(&db, "Repair gate");
    let b = task(&db, "Hang gate");
    let other = Database::new(temp.path()).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let spawn = |handle: Database, child: RecordId, parent: RecordId| {
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            handle.set_parent(EntityKind::Task, child, Some(parent))
        })
    };
    let first = spawn(db, a, b);
    let second = spawn(other, b, a);
    let results = [first.join().unwrap(), second.join().unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let rejected = results.into_iter().find(|r| r.is_err()).unwrap();
    assert_eq!(code(rejected), "cycle");

    let db = Database::new(temp.path()).unwrap();
    let parents = [
        db.get_task(a).unwrap().unwrap().parent_id,
        db.get_task(b).unwrap().unwrap().parent_id,
    ];
    assert_eq!(parents.iter().filter(|p| p.is_some()).count(), 1);
}

#[test]
fn test_concurrent_month_generation_yields_one_cycle() {
    let (temp, db) = setup();
    let other = Database::new(temp.path()).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = [db, other]
        .into_iter()
        .map(|handle| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                CycleScheduler::new().generate_for_month(&handle, 2026, 3)
            })
        })
        .collect();
    let cycles: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    assert_eq!(cycles[0].id, cycles[1].id);
    let db = Database::new(temp.path()).unwrap();
    let stored = CycleScheduler::new()
        .list_cycles(&db, CycleTimeframe::All, date(2026, 3, 1))
        .unwrap();
    assert_eq!(stored.len(), 1);
}
