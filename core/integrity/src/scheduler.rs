use chrono::{Datelike, Days, NaiveDate, Utc};
use farmstead_schemas::{Cycle, CycleId, CycleProgress, CycleTimeframe, TaskState};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::{IntegrityError, Result, ValidationError};

const CYCLE_COLUMNS: &str = "id, name, start_date, end_date";

/// Upper bound on cycles a single generate or ensure call may create.
pub const MAX_CYCLES_PER_CALL: u32 = 1200;

/// Creates and resolves time-boxed cycles.
///
/// Cycles never overlap. Monthly generation relies on the
/// `(start_date, end_date)` unique constraint, so two callers generating the
/// same month end up with one row.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleScheduler;

impl CycleScheduler {
    pub fn new() -> Self {
        Self
    }

    /// The calendar-month cycle for `year`/`month`, created if missing
    pub fn generate_for_month(&self, db: &Database, year: i32, month: u32) -> Result<Cycle> {
        let tx = db.transaction()?;
        let cycle = self.generate_for_month_in(&tx, year, month)?;
        tx.commit()?;
        Ok(cycle)
    }

    pub(crate) fn generate_for_month_in(
        &self,
        conn: &Connection,
        year: i32,
        month: u32,
    ) -> Result<Cycle> {
        let (start, end) = month_bounds(year, month)?;

        if let Some(existing) = find_exact(conn, start, end)? {
            debug!("Cycle for {}-{:02} already exists ({})", year, month, existing.id);
            return Ok(existing);
        }

        validate_window(conn, start, end, None)?;

        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            "INSERT INTO cycles (name, start_date, end_date, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (start_date, end_date) DO NOTHING",
            params![month_name(start), start, end, now, now],
        )?;

        let cycle = find_exact(conn, start, end)?.ok_or(IntegrityError::Storage(
            rusqlite::Error::QueryReturnedNoRows,
        ))?;
        if inserted > 0 {
            info!("Created cycle: {} ({})", cycle.name, cycle.id);
        }
        Ok(cycle)
    }

    /// Make sure monthly cycles exist from `months_behind` months before
    /// `today` through `months_ahead` months after it, then return every
    /// stored cycle by start date.
    ///
    /// A month that collides with a hand-made cycle is skipped.
    pub fn ensure_cycles_exist(
        &self,
        db: &Database,
        months_ahead: u32,
        months_behind: u32,
        today: NaiveDate,
    ) -> Result<Vec<Cycle>> {
        let requested = u64::from(months_ahead) + u64::from(months_behind) + 1;
        if requested > u64::from(MAX_CYCLES_PER_CALL) {
            return Err(ValidationError::TooManyCycles {
                requested,
                limit: MAX_CYCLES_PER_CALL,
            }
            .into());
        }
        // Both fit in i32 after the bound check
        let (behind, ahead) = (months_behind as i32, months_ahead as i32);

        let tx = db.transaction()?;

        for offset in -behind..=ahead {
            let (year, month) = shift_month(today.year(), today.month(), offset)
                .ok_or(ValidationError::DateOutOfRange { from: today })?;
            match self.generate_for_month_in(&tx, year, month) {
                Ok(_) => {}
                Err(IntegrityError::Validation(err @ ValidationError::CycleOverlap { .. })) => {
                    warn!("Skipping {}-{:02}: {}", year, month, err);
                }
                Err(err) => return Err(err),
            }
        }

        let cycles = list_cycles_in(&tx, CycleTimeframe::All, today)?;
        tx.commit()?;
        Ok(cycles)
    }

    /// The cycle containing `today`, generating its month if none does
    pub fn current_cycle(&self, db: &Database, today: NaiveDate) -> Result<Cycle> {
        let tx = db.transaction()?;
        let cycle = self.current_cycle_in(&tx, today)?;
        tx.commit()?;
        Ok(cycle)
    }

    pub(crate) fn current_cycle_in(&self, conn: &Connection, today: NaiveDate) -> Result<Cycle> {
        let containing = conn
            .query_row(
                &format!(
                    "SELECT {} FROM cycles
                     WHERE start_date <= ?1 AND end_date >= ?1
                     ORDER BY start_date LIMIT 1",
                    CYCLE_COLUMNS
                ),
                params![today],
                row_to_cycle,
            )
            .optional()?;

        match containing {
            Some(cycle) => {
                debug_assert!(cycle.contains(today));
                Ok(cycle)
            }
            None => self.generate_for_month_in(conn, today.year(), today.month()),
        }
    }

    /// Create a custom cycle, rejected if it overlaps any stored cycle
    pub fn create_cycle(
        &self,
        db: &Database,
        name: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Cycle> {
        let tx = db.transaction()?;
        let cycle = insert_cycle(&tx, name, start, end)?;
        tx.commit()?;

        info!("Created cycle: {} ({})", cycle.name, cycle.id);
        Ok(cycle)
    }

    /// Rename or move a cycle; the new window must not overlap any other
    pub fn update_cycle(
        &self,
        db: &Database,
        id: CycleId,
        name: Option<&str>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Cycle> {
        let tx = db.transaction()?;
        let existing = get_cycle_in(&tx, id)?.ok_or(IntegrityError::CycleNotFound(id))?;

        let updated = Cycle {
            id,
            name: name.map(str::to_string).unwrap_or(existing.name),
            start_date: start.unwrap_or(existing.start_date),
            end_date: end.unwrap_or(existing.end_date),
        };
        validate_window(&tx, updated.start_date, updated.end_date, Some(id))?;

        tx.execute(
            "UPDATE cycles SET name = ?1, start_date = ?2, end_date = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                updated.name,
                updated.start_date,
                updated.end_date,
                Utc::now().to_rfc3339(),
                id.0
            ],
        )?;
        tx.commit()?;

        info!("Updated cycle {}", id);
        Ok(updated)
    }

    /// Create `count` back-to-back cycles of `duration_days` days each,
    /// starting at `start`.
    ///
    /// All or nothing: if any window overlaps a stored cycle or runs past
    /// the representable calendar, no cycle is written and the error is
    /// returned.
    pub fn generate_cycles(
        &self,
        db: &Database,
        start: NaiveDate,
        count: u32,
        duration_days: u32,
    ) -> Result<Vec<Cycle>> {
        if duration_days == 0 {
            return Err(ValidationError::InvalidDuration.into());
        }
        if count > MAX_CYCLES_PER_CALL {
            return Err(ValidationError::TooManyCycles {
                requested: u64::from(count),
                limit: MAX_CYCLES_PER_CALL,
            }
            .into());
        }

        let tx = db.transaction()?;
        let mut cycles = Vec::with_capacity(count as usize);
        let mut window_start = start;

        for index in 0..count {
            let window_end = window_start
                .checked_add_days(Days::new(u64::from(duration_days - 1)))
                .ok_or(ValidationError::DateOutOfRange { from: window_start })?;
            let cycle = insert_cycle(&tx, &window_name(window_start, window_end), window_start, window_end)?;
            cycles.push(cycle);

            if index + 1 < count {
                window_start = window_end
                    .succ_opt()
                    .ok_or(ValidationError::DateOutOfRange { from: window_end })?;
            }
        }

        tx.commit()?;
        info!("Generated {} cycles starting {}", cycles.len(), start);
        Ok(cycles)
    }

    pub fn get_cycle(&self, db: &Database, id: CycleId) -> Result<Option<Cycle>> {
        get_cycle_in(db.connection(), id)
    }

    /// Cycles relative to `today`, ordered by start date
    pub fn list_cycles(
        &self,
        db: &Database,
        timeframe: CycleTimeframe,
        today: NaiveDate,
    ) -> Result<Vec<Cycle>> {
        list_cycles_in(db.connection(), timeframe, today)
    }

    /// Task counts per state for one cycle
    pub fn cycle_progress(&self, db: &Database, id: CycleId) -> Result<CycleProgress> {
        let conn = db.connection();
        let cycle = get_cycle_in(conn, id)?.ok_or(IntegrityError::CycleNotFound(id))?;

        let mut progress = CycleProgress {
            cycle,
            total: 0,
            backlog: 0,
            todo: 0,
            in_progress: 0,
            done: 0,
            cancelled: 0,
            percent_complete: 0.0,
        };

        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM tasks WHERE cycle_id = ?1 GROUP BY state")?;
        let counts = stmt
            .query_map(params![id.0], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut completed = 0;
        for (raw, count) in counts {
            let count = count as usize;
            let state = match raw.parse::<TaskState>() {
                Ok(state) => state,
                Err(err) => {
                    warn!("Ignoring {} tasks in cycle {}: {}", count, id, err);
                    continue;
                }
            };
            match state {
                TaskState::Backlog => progress.backlog += count,
                TaskState::Todo => progress.todo += count,
                TaskState::InProgress => progress.in_progress += count,
                TaskState::Done => progress.done += count,
                TaskState::Cancelled => progress.cancelled += count,
            }
            if state.is_completed() {
                completed += count;
            }
            progress.total += count;
        }

        if progress.total > 0 {
            progress.percent_complete = completed as f32 * 100.0 / progress.total as f32;
        }
        Ok(progress)
    }
}

/// First and last day of a calendar month.
pub fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate)> {
    let invalid = || IntegrityError::InvalidMonth { year, month };

    let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
    let (next_year, next_month) = shift_month(year, month, 1).ok_or_else(invalid)?;
    let end = NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|next| next.pred_opt())
        .ok_or_else(invalid)?;

    Ok((start, end))
}

/// `(year, month)` moved by `offset` months, across year boundaries.
/// `None` when the resulting year does not fit an `i32`.
pub fn shift_month(year: i32, month: u32, offset: i32) -> Option<(i32, u32)> {
    let index = i64::from(year) * 12 + i64::from(month) - 1 + i64::from(offset);
    let shifted_year = i32::try_from(index.div_euclid(12)).ok()?;
    Some((shifted_year, index.rem_euclid(12) as u32 + 1))
}

fn month_name(start: NaiveDate) -> String {
    start.format("%B %Y").to_string()
}

fn window_name(start: NaiveDate, end: NaiveDate) -> String {
    format!("{} - {}", start.format("%b %-d"), end.format("%b %-d, %Y"))
}

fn insert_cycle(conn: &Connection, name: &str, start: NaiveDate, end: NaiveDate) -> Result<Cycle> {
    validate_window(conn, start, end, None)?;

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO cycles (name, start_date, end_date, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![name, start, end, now, now],
    )?;

    Ok(Cycle {
        id: CycleId(conn.last_insert_rowid()),
        name: name.to_string(),
        start_date: start,
        end_date: end,
    })
}

/// Reject inverted ranges and any intersection with another stored cycle.
fn validate_window(
    conn: &Connection,
    start: NaiveDate,
    end: NaiveDate,
    excluding: Option<CycleId>,
) -> Result<()> {
    if end < start {
        return Err(ValidationError::InvalidDateRange { start, end }.into());
    }

    // Closed intervals: touching on a single day counts as overlap
    let overlapping = conn
        .query_row(
            &format!(
                "SELECT {} FROM cycles
                 WHERE start_date <= ?2 AND end_date >= ?1 AND (?3 IS NULL OR id <> ?3)
                 ORDER BY start_date LIMIT 1",
                CYCLE_COLUMNS
            ),
            params![start, end, excluding.map(|c| c.0)],
            row_to_cycle,
        )
        .optional()?;

    match overlapping {
        Some(existing) => {
            debug_assert!(existing.overlaps(start, end));
            Err(ValidationError::CycleOverlap {
                start,
                end,
                existing: existing.id,
                existing_name: existing.name,
            }
            .into())
        }
        None => Ok(()),
    }
}

fn find_exact(conn: &Connection, start: NaiveDate, end: NaiveDate) -> Result<Option<Cycle>> {
    let cycle = conn
        .query_row(
            &format!(
                "SELECT {} FROM cycles WHERE start_date = ?1 AND end_date = ?2",
                CYCLE_COLUMNS
            ),
            params![start, end],
            row_to_cycle,
        )
        .optional()?;
    Ok(cycle)
}

pub(crate) fn get_cycle_in(conn: &Connection, id: CycleId) -> Result<Option<Cycle>> {
    let cycle = conn
        .query_row(
            &format!("SELECT {} FROM cycles WHERE id = ?1", CYCLE_COLUMNS),
            params![id.0],
            row_to_cycle,
        )
        .optional()?;
    Ok(cycle)
}

fn list_cycles_in(
    conn: &Connection,
    timeframe: CycleTimeframe,
    today: NaiveDate,
) -> Result<Vec<Cycle>> {
    let filter = match timeframe {
        CycleTimeframe::All => "?1 IS NOT NULL",
        CycleTimeframe::Past => "end_date < ?1",
        CycleTimeframe::Current => "start_date <= ?1 AND end_date >= ?1",
        CycleTimeframe::Future => "start_date > ?1",
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM cycles WHERE {} ORDER BY start_date",
        CYCLE_COLUMNS, filter
    ))?;
    let cycles = stmt
        .query_map(params![today], row_to_cycle)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(cycles)
}

pub(crate) fn row_to_cycle(row: &Row) -> rusqlite::Result<Cycle> {
    Ok(Cycle {
        id: CycleId(row.get(0)?),
        name: row.get(1)?,
        start_date: row.get(2)?,
        end_date: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{NewTask, UpdateOptions};
    use tempfile::NamedTempFile;

    fn setup() -> (NamedTempFile, Database) {
        let temp = NamedTempFile::new().unwrap();
        let db = Database::new(temp.path()).unwrap();
        (temp, db)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn code<T: std::fmt::Debug>(result: Result<T>) -> &'static str {
        match result {
            Err(IntegrityError::Validation(err)) => err.code(),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_month_bounds() {
        assert_eq!(month_bounds(2026, 2).unwrap(), (date(2026, 2, 1), date(2026, 2, 28)));
        assert_eq!(month_bounds(2028, 2).unwrap().1, date(2028, 2, 29));
        assert_eq!(month_bounds(2026, 12).unwrap().1, date(2026, 12, 31));
        assert!(matches!(
            month_bounds(2026, 13),
            Err(IntegrityError::InvalidMonth { month: 13, .. })
        ));
    }

    #[test]
    fn test_shift_month_wraps_years() {
        assert_eq!(shift_month(2026, 1, -1), Some((2025, 12)));
        assert_eq!(shift_month(2026, 11, 3), Some((2027, 2)));
        assert_eq!(shift_month(2026, 6, 0), Some((2026, 6)));
        assert_eq!(shift_month(2026, 3, -27), Some((2023, 12)));
        assert_eq!(shift_month(i32::MAX, 12, 1), None);
        assert_eq!(shift_month(i32::MIN, 1, i32::MIN), None);
    }

    #[test]
    fn test_generate_for_month_is_idempotent() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();

        let first = scheduler.generate_for_month(&db, 2026, 3).unwrap();
        let second = scheduler.generate_for_month(&db, 2026, 3).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.name, "March 2026");
        assert_eq!(first.start_date, date(2026, 3, 1));
        assert_eq!(first.end_date, date(2026, 3, 31));
        assert_eq!(
            scheduler
                .list_cycles(&db, CycleTimeframe::All, date(2026, 3, 1))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_overlap_rejected() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();
        scheduler.generate_for_month(&db, 2026, 1).unwrap();

        let err = scheduler.create_cycle(&db, "Mid-winter", date(2026, 1, 15), date(2026, 2, 15));
        assert_eq!(code(err), "cycle_overlap");

        // Sharing one boundary day is still an overlap
        let err = scheduler.create_cycle(&db, "Edge", date(2026, 1, 31), date(2026, 2, 5));
        assert_eq!(code(err), "cycle_overlap");

        assert!(scheduler
            .create_cycle(&db, "February sprint", date(2026, 2, 1), date(2026, 2, 14))
            .is_ok());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let (_temp, db) = setup();
        let err = CycleScheduler::new().create_cycle(&db, "Backwards", date(2026, 5, 10), date(2026, 5, 1));
        assert_eq!(code(err), "invalid_date_range");
    }

    #[test]
    fn test_update_cycle_excludes_itself() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();
        let april = scheduler.generate_for_month(&db, 2026, 4).unwrap();
        scheduler.generate_for_month(&db, 2026, 5).unwrap();

        let renamed = scheduler
            .update_cycle(&db, april.id, Some("Planting"), None, Some(date(2026, 4, 20)))
            .unwrap();
        assert_eq!(renamed.name, "Planting");
        assert_eq!(
            scheduler.get_cycle(&db, april.id).unwrap().unwrap().end_date,
            date(2026, 4, 20)
        );

        let err = scheduler.update_cycle(&db, april.id, None, None, Some(date(2026, 5, 3)));
        assert_eq!(code(err), "cycle_overlap");

        assert!(matches!(
            scheduler.update_cycle(&db, CycleId(99), Some("x"), None, None),
            Err(IntegrityError::CycleNotFound(CycleId(99)))
        ));
    }

    #[test]
    fn test_ensure_cycles_exist_window() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();

        let cycles = scheduler
            .ensure_cycles_exist(&db, 2, 1, date(2026, 12, 10))
            .unwrap();
        let names: Vec<&str> = cycles.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["November 2026", "December 2026", "January 2027", "February 2027"]
        );

        // Second call creates nothing new
        let again = scheduler
            .ensure_cycles_exist(&db, 2, 1, date(2026, 12, 10))
            .unwrap();
        assert_eq!(again, cycles);
    }

    #[test]
    fn test_ensure_skips_months_blocked_by_custom_cycles() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();
        scheduler
            .create_cycle(&db, "Lambing", date(2026, 3, 20), date(2026, 4, 10))
            .unwrap();

        let cycles = scheduler
            .ensure_cycles_exist(&db, 2, 0, date(2026, 3, 5))
            .unwrap();
        let names: Vec<&str> = cycles.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Lambing", "May 2026"]);
    }

    #[test]
    fn test_current_cycle_prefers_containing() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();
        let custom = scheduler
            .create_cycle(&db, "Harvest week", date(2026, 9, 7), date(2026, 9, 13))
            .unwrap();

        assert_eq!(scheduler.current_cycle(&db, date(2026, 9, 9)).unwrap(), custom);

        let generated = scheduler.current_cycle(&db, date(2026, 10, 18)).unwrap();
        assert_eq!(generated.name, "October 2026");
    }

    #[test]
    fn test_generate_consecutive_cycles() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();

        let weeks = scheduler
            .generate_cycles(&db, date(2026, 6, 1), 3, 7)
            .unwrap();
        assert_eq!(weeks.len(), 3);
        assert_eq!(weeks[0].end_date, date(2026, 6, 7));
        assert_eq!(weeks[1].start_date, date(2026, 6, 8));
        assert_eq!(weeks[2].end_date, date(2026, 6, 21));
        assert_eq!(weeks[0].name, "Jun 1 - Jun 7, 2026");
    }

    #[test]
    fn test_generate_cycles_all_or_nothing() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();
        scheduler
            .create_cycle(&db, "Blocker", date(2026, 6, 10), date(2026, 6, 12))
            .unwrap();

        let err = scheduler.generate_cycles(&db, date(2026, 6, 1), 4, 7);
        assert_eq!(code(err), "cycle_overlap");
        assert_eq!(
            scheduler
                .list_cycles(&db, CycleTimeframe::All, date(2026, 6, 1))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_generate_cycles_rejects_unbounded_input() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();
        let start = date(2026, 6, 1);

        assert_eq!(
            code(scheduler.generate_cycles(&db, start, 1, u32::MAX)),
            "date_out_of_range"
        );
        assert_eq!(
            code(scheduler.generate_cycles(&db, start, u32::MAX, 1)),
            "too_many_cycles"
        );
        assert_eq!(code(scheduler.generate_cycles(&db, start, 3, 0)), "invalid_duration");
        assert!(scheduler
            .list_cycles(&db, CycleTimeframe::All, start)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_generate_cycles_stops_before_calendar_end() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();

        // First window ends on the last representable day, the second cannot start
        let start = NaiveDate::MAX.pred_opt().unwrap();
        let err = scheduler.generate_cycles(&db, start, 2, 2);
        assert_eq!(code(err), "date_out_of_range");
        assert!(scheduler
            .list_cycles(&db, CycleTimeframe::All, date(2026, 6, 1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_ensure_rejects_oversized_window() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();

        assert_eq!(
            code(scheduler.ensure_cycles_exist(&db, 0, 1 << 31, date(2026, 10, 18))),
            "too_many_cycles"
        );
        assert_eq!(
            code(scheduler.ensure_cycles_exist(&db, u32::MAX, u32::MAX, date(2026, 10, 18))),
            "too_many_cycles"
        );
        assert!(matches!(
            scheduler.ensure_cycles_exist(&db, 1, 0, NaiveDate::MAX),
            Err(IntegrityError::InvalidMonth { month: 12, .. })
        ));
    }

    #[test]
    fn test_list_by_timeframe() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();
        let today = date(2026, 5, 15);
        scheduler.ensure_cycles_exist(&db, 1, 1, today).unwrap();

        let names = |timeframe| {
            scheduler
                .list_cycles(&db, timeframe, today)
                .unwrap()
                .into_iter()
                .map(|c| c.name)
                .collect::<Vec<_>>()
        };
        assert_eq!(names(CycleTimeframe::Past), vec!["April 2026"]);
        assert_eq!(names(CycleTimeframe::Current), vec!["May 2026"]);
        assert_eq!(names(CycleTimeframe::Future), vec!["June 2026"]);
    }

    #[test]
    fn test_cycle_progress() {
        let (_temp, db) = setup();
        let scheduler = CycleScheduler::new();
        let cycle = scheduler.generate_for_month(&db, 2026, 7).unwrap();

        for state in [TaskState::Todo, TaskState::Done, TaskState::Done, TaskState::Cancelled] {
            db.create_task(
                &NewTask {
                    title: format!("{:?}", state),
                    state: Some(state),
                    cycle_id: Some(cycle.id),
                    ..Default::default()
                },
                UpdateOptions::default(),
            )
            .unwrap();
        }

        let progress = scheduler.cycle_progress(&db, cycle.id).unwrap();
        assert_eq!(progress.total, 4);
        assert_eq!(progress.done, 2);
        assert_eq!(progress.todo, 1);
        assert_eq!(progress.cancelled, 1);
        assert!((progress.percent_complete - 75.0).abs() < f32::EPSILON);
    }
}
