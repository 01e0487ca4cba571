use crate::{job::JobHandle, scheduler::status::JobStatus};
use chrono::Local;
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::{path::Path, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info};

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists jobs (
    submission_id text primary key,
    job_id text not null,
    working_dir text not null,
    script_path text not null,
    log_path text not null,
    status integer not null,
    message text not null,
    state text,
    submitted_at text not null,
    updated_at text not null
);",
    "create index if not exists jobs_job_id on jobs (job_id);",
];

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    SQLite(#[from] rusqlite::Error),
}

/// One row of the ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub submission_id: String,
    pub job_id: String,
    pub working_dir: String,
    pub script_path: String,
    pub log_path: String,
    pub status: i32,
    pub message: String,
    pub state: Option<String>,
    pub submitted_at: String,
    pub updated_at: String,
}

/// Thread safe handle to the local job ledger, clones share the connection
#[derive(Debug, Clone)]
pub struct Ledger(Arc<FairMutex<Connection>>);

impl Ledger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        debug!(path = ?path, "Opening job ledger");

        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(connection: Connection) -> Result<Self, LedgerError> {
        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            if let Err(error) = connection.execute(table, []) {
                error!(
                    error = ?error,
                    "Failed to apply SQL schema ({}/{})",
                    counter + 1,
                    SQL_SCHEMA.len()
                );

                return Err(error.into());
            }
        }

        Ok(Self(Arc::new(FairMutex::new(connection))))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, Connection> {
        self.0.lock_arc()
    }

    /// Store the outcome of a submission, rejected ones included
    pub fn record_submission(&self, handle: &JobHandle) -> Result<(), LedgerError> {
        let now = Local::now().to_rfc3339();

        self.lock()
            .prepare_cached(
                "insert or replace into jobs (submission_id, job_id, working_dir, script_path,
                log_path, status, message, state, submitted_at, updated_at)
                values (?, ?, ?, ?, ?, ?, ?, null, ?, ?)",
            )?
            .execute(params![
                handle.submission_id.to_string(),
                handle.job_id,
                handle.working_dir.to_string_lossy(),
                handle.script_path.to_string_lossy(),
                handle.log_path.to_string_lossy(),
                handle.status,
                handle.message,
                handle.submitted_at.to_rfc3339(),
                now,
            ])?;

        info!(submission_id = %handle.submission_id, job_id = %handle.job_id, "Recorded submission");

        Ok(())
    }

    /// Update the last observed status of a job, returns whether the job was known.
    ///
    /// Only the newest submission carrying the job id is touched, the scheduler reuses ids.
    pub fn record_status(&self, status: &JobStatus) -> Result<bool, LedgerError> {
        if status.job_id.is_empty() {
            return Ok(false);
        }

        let updated = self
            .lock()
            .prepare_cached(
                "update jobs set status = ?, message = ?, state = ?, updated_at = ?
                where submission_id = (
                    select submission_id from jobs where job_id = ?
                    order by submitted_at desc limit 1
                )",
            )?
            .execute(params![
                status.status,
                status.message,
                status.state.to_string(),
                Local::now().to_rfc3339(),
                status.job_id,
            ])?;

        debug!(job_id = %status.job_id, rows = updated, "Recorded status");

        Ok(updated > 0)
    }

    pub fn find(&self, job_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let connection = self.lock();
        let mut statement = connection.prepare_cached(
            "select submission_id, job_id, working_dir, script_path, log_path, status,
            message, state, submitted_at, updated_at from jobs
            where job_id = ? order by submitted_at desc limit 1",
        )?;
        let found = statement.query_row(params![job_id], entry).optional()?;

        Ok(found)
    }

    /// All entries, newest submission first
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<LedgerEntry>, LedgerError> {
        // negative limits mean no limit for sqlite
        let limit = limit.map_or(-1, |limit| limit as i64);

        let connection = self.lock();
        let mut statement = connection.prepare_cached(
            "select submission_id, job_id, working_dir, script_path, log_path, status,
            message, state, submitted_at, updated_at from jobs
            order by submitted_at desc limit ?",
        )?;
        let entries = statement
            .query_map(params![limit], entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

fn entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        submission_id: row.get(0)?,
        job_id: row.get(1)?,
        working_dir: row.get(2)?,
        script_path: row.get(3)?,
        log_path: row.get(4)?,
        status: row.get(5)?,
        message: row.get(6)?,
        state: row.get(7)?,
        submitted_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::state::JobState;
    use chrono::Duration;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn handle(job_id: &str, minutes_ago: i64) -> JobHandle {
        let submission_id = Uuid::new_v4();
        let working_dir = PathBuf::from(format!("/w/tmp/20240115100000_{submission_id}"));

        JobHandle {
            submission_id,
            job_id: job_id.to_owned(),
            context_path: working_dir.join("context.yaml"),
            script_path: working_dir.join("job.sh"),
            log_path: working_dir.join("result.out"),
            working_dir,
            submitted_at: Local::now() - Duration::minutes(minutes_ago),
            status: 0,
            message: format!("[INFO] PJM 0000 pjsub Job {job_id} submitted."),
        }
    }

    #[test]
    fn lists_newest_first() {
        let ledger = Ledger::open_in_memory().unwrap();

        ledger.record_submission(&handle("100", 20)).unwrap();
        ledger.record_submission(&handle("102", 0)).unwrap();
        ledger.record_submission(&handle("101", 10)).unwrap();

        let ids: Vec<String> = ledger
            .list(None)
            .unwrap()
            .into_iter()
            .map(|entry| entry.job_id)
            .collect();
        assert_eq!(ids, vec!["102", "101", "100"]);

        assert_eq!(ledger.list(Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn status_updates_known_jobs() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record_submission(&handle("123456", 0)).unwrap();

        let status = JobStatus {
            job_id: "123456".to_owned(),
            state: JobState::Finished,
            status: 0,
            message: "[INFO] PJM 0100 pjdel Accepted job 123456.".to_owned(),
            ..JobStatus::default()
        };

        assert!(ledger.record_status(&status).unwrap());
        assert!(!ledger
            .record_status(&JobStatus {
                job_id: "42".to_owned(),
                ..JobStatus::default()
            })
            .unwrap());

        let entry = ledger.find("123456").unwrap().unwrap();
        assert_eq!(entry.state.as_deref(), Some("FINISHED"));
        assert_eq!(entry.message, status.message);
        assert_eq!(ledger.find("42").unwrap(), None);
    }

    #[test]
    fn status_updates_only_the_newest_reuse_of_a_job_id() {
        let ledger = Ledger::open_in_memory().unwrap();
        let older = handle("500", 60 * 24);
        let newer = handle("500", 0);
        ledger.record_submission(&older).unwrap();
        ledger.record_submission(&newer).unwrap();

        let status = JobStatus {
            job_id: "500".to_owned(),
            state: JobState::Running,
            ..JobStatus::default()
        };
        assert!(ledger.record_status(&status).unwrap());

        let entries = ledger.list(None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].submission_id, newer.submission_id.to_string());
        assert_eq!(entries[0].state.as_deref(), Some("RUNNING"));
        assert_eq!(entries[1].submission_id, older.submission_id.to_string());
        assert_eq!(entries[1].state, None);
    }

    #[test]
    fn rejected_submissions_are_kept() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut rejected = handle("", 0);
        rejected.status = 1;
        rejected.message = "[ERR.] PJM 0007 pjsub Staging option error (3).".to_owned();

        ledger.record_submission(&rejected).unwrap();

        let entries = ledger.list(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id, "");
        assert_eq!(entries[0].status, 1);
        assert_eq!(entries[0].state, None);
    }

    #[test]
    fn clones_share_the_connection() {
        let ledger = Ledger::open_in_memory().unwrap();
        let clone = ledger.clone();

        std::thread::spawn(move || clone.record_submission(&handle("7", 0)).unwrap())
            .join()
            .unwrap();

        assert_eq!(ledger.list(None).unwrap().len(), 1);
    }
}
