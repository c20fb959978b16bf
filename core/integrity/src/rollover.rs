use chrono::NaiveDate;
use farmstead_schemas::{
    Cycle, RecordId, RolloverFailure, RolloverReceipt, RolloverReport,
};
use rusqlite::params;
use tracing::{debug, info, warn};

use crate::database::{active_states_sql, Database, TaskUpdate, UpdateOptions};
use crate::error::Result;
use crate::scheduler::CycleScheduler;

/// Moves unfinished work out of finished cycles.
#[derive(Debug, Default, Clone, Copy)]
pub struct RolloverEngine {
    scheduler: CycleScheduler,
}

struct Stale {
    id: RecordId,
    title: String,
    from_cycle: String,
}

impl RolloverEngine {
    pub fn new() -> Self {
        Self {
            scheduler: CycleScheduler::new(),
        }
    }

    /// Reassign every active task whose cycle ended before `today` to the
    /// cycle containing `today`.
    ///
    /// Best effort: a task that cannot be moved is reported in `failed` and
    /// the rest still move. Derived effects of the reassignment are
    /// suppressed. Running it twice moves nothing the second time.
    pub fn rollover_from_past_cycles(
        &self,
        db: &Database,
        today: NaiveDate,
    ) -> Result<RolloverReport> {
        let tx = db.transaction()?;
        let current = self.scheduler.current_cycle_in(&tx, today)?;

        let stale = {
            let mut stmt = tx.prepare(&format!(
                "SELECT t.id, t.title, c.name
                 FROM tasks t
                 JOIN cycles c ON c.id = t.cycle_id
                 WHERE c.end_date < ?1 AND t.state IN ({})
                 ORDER BY t.id",
                active_states_sql()
            ))?;
            let rows = stmt
                .query_map(params![today], |row| {
                    Ok(Stale {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        from_cycle: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        if stale.is_empty() {
            debug!("No tasks to roll over into {}", current.name);
            tx.commit()?;
            return Ok(RolloverReport::empty());
        }

        let update = TaskUpdate {
            cycle_id: Some(Some(current.id)),
            ..Default::default()
        };

        let mut report = RolloverReport::empty();
        for task in stale {
            match db.apply_task_update(&tx, task.id, &update, UpdateOptions::suppressed()) {
                Ok(_) => {
                    debug!(
                        "Rolled task {} from {} to {}",
                        task.id, task.from_cycle, current.name
                    );
                    report.tasks.push(RolloverReceipt {
                        id: task.id,
                        title: task.title,
                        from_cycle: task.from_cycle,
                        to_cycle: current.name.clone(),
                    });
                }
                Err(err) => {
                    warn!("Failed to roll over task {}: {}", task.id, err);
                    report.failed.push(RolloverFailure {
                        id: task.id,
                        title: task.title,
                        error: err.to_string(),
                    });
                }
            }
        }
        tx.commit()?;

        report.rolled_over = report.tasks.len();
        info!(
            "Rolled over {} tasks into {} ({} failed)",
            report.rolled_over,
            current.name,
            report.failed.len()
        );
        Ok(report)
    }

    /// The current cycle, after rolling stale work into it
    pub fn current_cycle_with_rollover(
        &self,
        db: &Database,
        today: NaiveDate,
    ) -> Result<(Cycle, RolloverReport)> {
        let report = self.rollover_from_past_cycles(db, today)?;
        let cycle = self.scheduler.current_cycle(db, today)?;
        Ok((cycle, report))
    }
}
