//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Every trait method
//! runs in one `BEGIN IMMEDIATE` transaction, so writers from other
//! processes sharing the file serialize on the database lock; `SQLITE_BUSY`
//! past the busy timeout is retried by [`with_retry`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};

use harvester_types::connection::Connection as ConnectionDef;
use harvester_types::job::{Job, JobDescription};
use harvester_types::state::{
    ActivityRecord, ConnectionName, DocumentCounts, DocumentOutcome, DocumentRecord,
    DocumentStatus, IngestStatus, JobId, JobStatus, NewDocument,
};

use crate::backend::{JobRunUpdate, SeedingProgress, StateBackend};
use crate::codec::{
    from_json, from_sql_count, limit_to_sql, opt_to_millis, parse_status, to_json, to_millis,
    to_sql_int, ActivityRow, DocumentRow, IngestRow, JobRow, OutcomeUpdate, ACTIVITY_COLUMNS,
    DOCUMENT_COLUMNS, INGEST_COLUMNS, JOB_COLUMNS,
};
use crate::error::{self, StateError};
use crate::transaction::{with_retry, RetryPolicy};

/// How long a statement waits on another process's lock before `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS connections (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    connector TEXT NOT NULL,
    definition TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    seeding_complete INTEGER NOT NULL DEFAULT 0,
    last_seed_time INTEGER,
    next_seed_time INTEGER,
    start_time INTEGER,
    end_time INTEGER,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS job_connections (
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    connection TEXT NOT NULL,
    PRIMARY KEY (job_id, connection)
);

CREATE TABLE IF NOT EXISTS documents (
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    identifier TEXT NOT NULL,
    priority REAL NOT NULL,
    status TEXT NOT NULL,
    bin_name TEXT NOT NULL DEFAULT '',
    last_version TEXT,
    fail_count INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    check_time INTEGER,
    error_message TEXT,
    PRIMARY KEY (job_id, identifier)
);

CREATE INDEX IF NOT EXISTS idx_documents_status_priority ON documents (status, priority);

CREATE TABLE IF NOT EXISTS bin_counters (
    connector_class TEXT NOT NULL,
    bin_name TEXT NOT NULL,
    next_value REAL NOT NULL,
    PRIMARY KEY (connector_class, bin_name)
);

CREATE TABLE IF NOT EXISTS ingest_status (
    output_connection TEXT NOT NULL,
    document_key TEXT NOT NULL,
    uri TEXT NOT NULL,
    version TEXT,
    ingest_time INTEGER NOT NULL,
    PRIMARY KEY (output_connection, document_key)
);

CREATE INDEX IF NOT EXISTS idx_ingest_document ON ingest_status (document_key);

CREATE TABLE IF NOT EXISTS activity_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    occurred_at INTEGER NOT NULL,
    connection TEXT NOT NULL,
    activity_type TEXT NOT NULL,
    byte_count INTEGER,
    entity_id TEXT NOT NULL,
    result_code TEXT NOT NULL,
    description TEXT,
    elapsed_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_activity_connection ON activity_history (connection, occurred_at);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry: RetryPolicy::default(),
        })
    }

    /// Replace the contention retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Run `body` in a write transaction, retrying it whole on contention.
    fn transact<T>(
        &self,
        operation: &str,
        mut body: impl FnMut(&Transaction<'_>) -> error::Result<T>,
    ) -> error::Result<T> {
        with_retry(&self.retry, operation, || {
            let mut conn = self.lock_conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = body(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Run a read-only `body` on the connection.
    fn read<T>(
        &self,
        operation: &str,
        mut body: impl FnMut(&Connection) -> error::Result<T>,
    ) -> error::Result<T> {
        with_retry(&self.retry, operation, || {
            let conn = self.lock_conn()?;
            body(&*conn)
        })
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn job_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        description: row.get(1)?,
        status: row.get(2)?,
        seeding_complete: row.get(3)?,
        last_seed_time: row.get(4)?,
        next_seed_time: row.get(5)?,
        start_time: row.get(6)?,
        end_time: row.get(7)?,
        error_message: row.get(8)?,
    })
}

fn document_row(row: &Row<'_>) -> rusqlite::Result<DocumentRow> {
    Ok(DocumentRow {
        job_id: row.get(0)?,
        identifier: row.get(1)?,
        priority: row.get(2)?,
        status: row.get(3)?,
        bin_name: row.get(4)?,
        last_version: row.get(5)?,
        fail_count: row.get(6)?,
        retry_count: row.get(7)?,
        check_time: row.get(8)?,
        error_message: row.get(9)?,
    })
}

fn ingest_row(row: &Row<'_>) -> rusqlite::Result<IngestRow> {
    Ok(IngestRow {
        output_connection: row.get(0)?,
        document_key: row.get(1)?,
        uri: row.get(2)?,
        version: row.get(3)?,
        ingest_time: row.get(4)?,
    })
}

fn activity_row(row: &Row<'_>) -> rusqlite::Result<ActivityRow> {
    Ok(ActivityRow {
        occurred_at: row.get(0)?,
        connection: row.get(1)?,
        activity_type: row.get(2)?,
        byte_count: row.get(3)?,
        entity_id: row.get(4)?,
        result_code: row.get(5)?,
        description: row.get(6)?,
        elapsed_ms: row.get(7)?,
    })
}

fn query_jobs(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> error::Result<Vec<Job>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, job_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(JobRow::decode).collect()
}

fn query_documents(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> error::Result<Vec<DocumentRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, document_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(DocumentRow::decode).collect()
}

fn job_status(conn: &Connection, id: &JobId) -> error::Result<Option<JobStatus>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM jobs WHERE id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_status).transpose()
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Drop a `Deleted` tombstone holding `name` and reject a live clash.
fn claim_job_name(tx: &Transaction<'_>, name: &str, except: Option<&JobId>) -> error::Result<()> {
    tx.execute(
        "DELETE FROM jobs WHERE name = ?1 AND status = ?2",
        params![name, JobStatus::Deleted.as_str()],
    )?;
    let holder: Option<String> = tx
        .query_row("SELECT id FROM jobs WHERE name = ?1", [name], |row| row.get(0))
        .optional()?;
    match holder {
        Some(id) if except.map_or(true, |ex| ex.as_str() != id) => {
            Err(StateError::DuplicateJobName(name.to_string()))
        }
        _ => Ok(()),
    }
}

fn write_job_connections(
    tx: &Transaction<'_>,
    id: &JobId,
    description: &JobDescription,
) -> error::Result<()> {
    tx.execute("DELETE FROM job_connections WHERE job_id = ?1", [id.as_str()])?;
    let mut stmt =
        tx.prepare("INSERT INTO job_connections (job_id, connection) VALUES (?1, ?2)")?;
    for connection in description.referenced_connections() {
        stmt.execute(params![id.as_str(), connection.as_str()])?;
    }
    Ok(())
}

impl StateBackend for SqliteStateBackend {
    // -- connections --------------------------------------------------------

    fn save_connection(&self, connection: &ConnectionDef) -> error::Result<()> {
        let definition = to_json(connection)?;
        self.transact("save_connection", |tx| {
            tx.execute(
                "INSERT INTO connections (name, kind, connector, definition, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(name) DO UPDATE SET kind = excluded.kind, \
                 connector = excluded.connector, definition = excluded.definition, \
                 updated_at = excluded.updated_at",
                params![
                    connection.name.as_str(),
                    connection.kind.as_str(),
                    connection.connector,
                    definition,
                    to_millis(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    fn load_connection(&self, name: &ConnectionName) -> error::Result<Option<ConnectionDef>> {
        self.read("load_connection", |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT definition FROM connections WHERE name = ?1",
                    [name.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            raw.as_deref().map(from_json).transpose()
        })
    }

    fn list_connections(&self) -> error::Result<Vec<ConnectionDef>> {
        self.read("list_connections", |conn| {
            let mut stmt = conn.prepare("SELECT definition FROM connections ORDER BY name")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter().map(|raw| from_json(raw)).collect()
        })
    }

    fn delete_connection(&self, name: &ConnectionName) -> error::Result<bool> {
        self.transact("delete_connection", |tx| {
            let user: Option<String> = tx
                .query_row(
                    "SELECT j.name FROM job_connections jc JOIN jobs j ON j.id = jc.job_id \
                     WHERE jc.connection = ?1 AND j.status <> ?2 ORDER BY j.name LIMIT 1",
                    params![name.as_str(), JobStatus::Deleted.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(job) = user {
                return Err(StateError::ConnectionInUse {
                    connection: name.clone(),
                    job,
                });
            }
            let removed = tx.execute("DELETE FROM connections WHERE name = ?1", [name.as_str()])?;
            Ok(removed > 0)
        })
    }

    // -- jobs ---------------------------------------------------------------

    fn create_job(&self, description: &JobDescription) -> error::Result<Job> {
        let encoded = to_json(description)?;
        self.transact("create_job", |tx| {
            claim_job_name(tx, &description.name, None)?;
            let id = JobId::generate();
            tx.execute(
                "INSERT INTO jobs (id, name, description, status) VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.as_str(),
                    description.name,
                    encoded,
                    JobStatus::NotYetRun.as_str()
                ],
            )?;
            write_job_connections(tx, &id, description)?;
            Ok(Job {
                id,
                description: description.clone(),
                status: JobStatus::NotYetRun,
                seeding_complete: false,
                last_seed_time: None,
                next_seed_time: None,
                start_time: None,
                end_time: None,
                error_message: None,
            })
        })
    }

    fn update_job_description(
        &self,
        id: &JobId,
        description: &JobDescription,
    ) -> error::Result<()> {
        let encoded = to_json(description)?;
        self.transact("update_job_description", |tx| {
            if matches!(job_status(tx, id)?, None | Some(JobStatus::Deleted)) {
                return Err(StateError::JobNotFound(id.clone()));
            }
            claim_job_name(tx, &description.name, Some(id))?;
            tx.execute(
                "UPDATE jobs SET name = ?1, description = ?2 WHERE id = ?3",
                params![description.name, encoded, id.as_str()],
            )?;
            write_job_connections(tx, id, description)
        })
    }

    fn load_job(&self, id: &JobId) -> error::Result<Option<Job>> {
        self.read("load_job", |conn| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
            Ok(query_jobs(conn, &sql, [id.as_str()])?.pop())
        })
    }

    fn find_job_by_name(&self, name: &str) -> error::Result<Option<Job>> {
        self.read("find_job_by_name", |conn| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1 AND status <> ?2");
            Ok(query_jobs(conn, &sql, params![name, JobStatus::Deleted.as_str()])?.pop())
        })
    }

    fn list_jobs(&self) -> error::Result<Vec<Job>> {
        self.read("list_jobs", |conn| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status <> ?1 ORDER BY name");
            query_jobs(conn, &sql, [JobStatus::Deleted.as_str()])
        })
    }

    fn jobs_in_status(&self, statuses: &[JobStatus]) -> error::Result<Vec<Job>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        self.read("jobs_in_status", |conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ({}) ORDER BY name",
                placeholders(statuses.len())
            );
            query_jobs(conn, &sql, params_from_iter(statuses.iter().map(|s| s.as_str())))
        })
    }

    fn transition_job(
        &self,
        id: &JobId,
        from: &[JobStatus],
        to: JobStatus,
        update: &JobRunUpdate,
    ) -> error::Result<bool> {
        self.transact("transition_job", |tx| {
            match job_status(tx, id)? {
                Some(current) if from.contains(&current) => {}
                _ => return Ok(false),
            }
            tx.execute(
                "UPDATE jobs SET status = ?1, end_time = COALESCE(?2, end_time), \
                 error_message = COALESCE(?3, error_message) WHERE id = ?4",
                params![
                    to.as_str(),
                    opt_to_millis(update.end_time),
                    update.error_message,
                    id.as_str()
                ],
            )?;
            Ok(true)
        })
    }

    fn begin_job_run(&self, id: &JobId, now: DateTime<Utc>) -> error::Result<bool> {
        self.transact("begin_job_run", |tx| {
            match job_status(tx, id)? {
                Some(current) if current.is_startable() => {}
                _ => return Ok(false),
            }
            tx.execute(
                "UPDATE jobs SET status = ?1, start_time = ?2, end_time = NULL, \
                 error_message = NULL, seeding_complete = 0, next_seed_time = NULL \
                 WHERE id = ?3",
                params![JobStatus::Running.as_str(), to_millis(now), id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM documents WHERE job_id = ?1 AND status = ?2",
                params![id.as_str(), DocumentStatus::Deleted.as_str()],
            )?;
            tx.execute(
                "UPDATE documents SET status = ?1, retry_count = 0, check_time = NULL, \
                 error_message = NULL WHERE job_id = ?2 AND status IN (?3, ?4)",
                params![
                    DocumentStatus::Pending.as_str(),
                    id.as_str(),
                    DocumentStatus::Completed.as_str(),
                    DocumentStatus::Error.as_str()
                ],
            )?;
            Ok(true)
        })
    }

    fn note_seeding(&self, id: &JobId, progress: SeedingProgress) -> error::Result<()> {
        self.transact("note_seeding", |tx| {
            tx.execute(
                "UPDATE jobs SET seeding_complete = ?1, \
                 last_seed_time = COALESCE(?2, last_seed_time), next_seed_time = ?3 \
                 WHERE id = ?4",
                params![
                    progress.seeding_complete,
                    opt_to_millis(progress.last_seed_time),
                    opt_to_millis(progress.next_seed_time),
                    id.as_str()
                ],
            )?;
            Ok(())
        })
    }

    fn begin_job_deletion(&self, id: &JobId) -> error::Result<bool> {
        self.transact("begin_job_deletion", |tx| {
            match job_status(tx, id)? {
                Some(JobStatus::Deleting | JobStatus::Deleted) | None => return Ok(false),
                Some(_) => {}
            }
            tx.execute(
                "UPDATE jobs SET status = ?1 WHERE id = ?2",
                params![JobStatus::Deleting.as_str(), id.as_str()],
            )?;
            // Active rows stay with their worker; finish_document hands them over.
            tx.execute(
                "UPDATE documents SET status = ?1 WHERE job_id = ?2 AND status <> ?3",
                params![
                    DocumentStatus::BeingDeleted.as_str(),
                    id.as_str(),
                    DocumentStatus::Active.as_str()
                ],
            )?;
            Ok(true)
        })
    }

    fn finish_job_deletion(&self, id: &JobId) -> error::Result<bool> {
        self.transact("finish_job_deletion", |tx| {
            if job_status(tx, id)? != Some(JobStatus::Deleting) {
                return Ok(false);
            }
            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM documents WHERE job_id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )?;
            if remaining > 0 {
                return Ok(false);
            }
            tx.execute(
                "UPDATE jobs SET status = ?1 WHERE id = ?2",
                params![JobStatus::Deleted.as_str(), id.as_str()],
            )?;
            tx.execute("DELETE FROM job_connections WHERE job_id = ?1", [id.as_str()])?;
            Ok(true)
        })
    }

    // -- documents ----------------------------------------------------------

    fn add_documents(&self, job: &JobId, documents: &[NewDocument]) -> error::Result<u64> {
        if documents.is_empty() {
            return Ok(0);
        }
        self.transact("add_documents", |tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO documents (job_id, identifier, priority, status, bin_name) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(job_id, identifier) DO UPDATE SET status = excluded.status, \
                 priority = excluded.priority, bin_name = excluded.bin_name, \
                 retry_count = 0, check_time = NULL, error_message = NULL \
                 WHERE documents.status IN (?6, ?7, ?8)",
            )?;
            let mut changed = 0u64;
            for doc in documents {
                changed += stmt.execute(params![
                    job.as_str(),
                    doc.identifier,
                    doc.priority,
                    DocumentStatus::Pending.as_str(),
                    doc.bin_name,
                    DocumentStatus::Completed.as_str(),
                    DocumentStatus::Error.as_str(),
                    DocumentStatus::Deleted.as_str(),
                ])? as u64;
            }
            Ok(changed)
        })
    }

    fn claim_documents(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> error::Result<Vec<DocumentRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.transact("claim_documents", |tx| {
            let mut claimed = query_documents(
                tx,
                "SELECT d.job_id, d.identifier, d.priority, d.status, d.bin_name, \
                 d.last_version, d.fail_count, d.retry_count, d.check_time, d.error_message \
                 FROM documents d JOIN jobs j ON j.id = d.job_id \
                 WHERE d.status = ?1 AND j.status = ?2 \
                 AND (d.check_time IS NULL OR d.check_time <= ?3) \
                 ORDER BY d.priority, d.identifier LIMIT ?4",
                params![
                    DocumentStatus::Pending.as_str(),
                    JobStatus::Running.as_str(),
                    to_millis(now),
                    limit_to_sql(limit)
                ],
            )?;
            let mut stmt = tx.prepare(
                "UPDATE documents SET status = ?1 WHERE job_id = ?2 AND identifier = ?3",
            )?;
            for doc in &mut claimed {
                stmt.execute(params![
                    DocumentStatus::Active.as_str(),
                    doc.job_id.as_str(),
                    doc.identifier
                ])?;
                doc.status = DocumentStatus::Active;
            }
            Ok(claimed)
        })
    }

    fn finish_document(
        &self,
        job: &JobId,
        identifier: &str,
        outcome: &DocumentOutcome,
    ) -> error::Result<bool> {
        let update = OutcomeUpdate::from_outcome(outcome);
        self.transact("finish_document", |tx| {
            if job_status(tx, job)? == Some(JobStatus::Deleting) {
                tx.execute(
                    "UPDATE documents SET status = ?1 \
                     WHERE job_id = ?2 AND identifier = ?3 AND status = ?4",
                    params![
                        DocumentStatus::BeingDeleted.as_str(),
                        job.as_str(),
                        identifier,
                        DocumentStatus::Active.as_str()
                    ],
                )?;
                return Ok(false);
            }
            let changed = tx.execute(
                "UPDATE documents SET status = ?1, \
                 last_version = CASE WHEN ?2 THEN ?3 ELSE last_version END, \
                 fail_count = fail_count + ?4, \
                 retry_count = CASE WHEN ?5 THEN retry_count + ?6 ELSE 0 END, \
                 check_time = ?7, error_message = ?8 \
                 WHERE job_id = ?9 AND identifier = ?10 AND status = ?11",
                params![
                    update.status.as_str(),
                    update.sets_version(),
                    update.version_value(),
                    update.fail_increment,
                    update.keeps_retry_count(),
                    update.retry_delta(),
                    update.check_time,
                    update.error_message,
                    job.as_str(),
                    identifier,
                    DocumentStatus::Active.as_str()
                ],
            )?;
            Ok(changed > 0)
        })
    }

    fn load_document(
        &self,
        job: &JobId,
        identifier: &str,
    ) -> error::Result<Option<DocumentRecord>> {
        self.read("load_document", |conn| {
            let sql = format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE job_id = ?1 AND identifier = ?2"
            );
            Ok(query_documents(conn, &sql, params![job.as_str(), identifier])?.pop())
        })
    }

    fn document_counts(&self, job: &JobId) -> error::Result<DocumentCounts> {
        self.read("document_counts", |conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM documents WHERE job_id = ?1 GROUP BY status",
            )?;
            let rows = stmt
                .query_map([job.as_str()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut counts = DocumentCounts::default();
            for (status, count) in rows {
                counts.record(parse_status(&status)?, from_sql_count(count));
            }
            Ok(counts)
        })
    }

    fn lowest_pending_priority(&self) -> error::Result<Option<f64>> {
        self.read("lowest_pending_priority", |conn| {
            Ok(conn.query_row(
                "SELECT MIN(d.priority) FROM documents d JOIN jobs j ON j.id = d.job_id \
                 WHERE d.status = ?1 AND j.status = ?2",
                params![DocumentStatus::Pending.as_str(), JobStatus::Running.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    fn reset_active_documents(&self) -> error::Result<u64> {
        self.transact("reset_active_documents", |tx| {
            let changed = tx.execute(
                "UPDATE documents SET status = ?1 WHERE status = ?2",
                params![
                    DocumentStatus::Pending.as_str(),
                    DocumentStatus::Active.as_str()
                ],
            )?;
            Ok(changed as u64)
        })
    }

    fn documents_being_deleted(
        &self,
        job: &JobId,
        limit: usize,
    ) -> error::Result<Vec<DocumentRecord>> {
        self.read("documents_being_deleted", |conn| {
            let sql = format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE job_id = ?1 AND status = ?2 \
                 ORDER BY identifier LIMIT ?3"
            );
            query_documents(
                conn,
                &sql,
                params![
                    job.as_str(),
                    DocumentStatus::BeingDeleted.as_str(),
                    limit_to_sql(limit)
                ],
            )
        })
    }

    fn purge_documents(&self, job: &JobId, identifiers: &[String]) -> error::Result<u64> {
        if identifiers.is_empty() {
            return Ok(0);
        }
        self.transact("purge_documents", |tx| {
            let mut stmt =
                tx.prepare("DELETE FROM documents WHERE job_id = ?1 AND identifier = ?2")?;
            let mut removed = 0u64;
            for identifier in identifiers {
                removed += stmt.execute(params![job.as_str(), identifier])? as u64;
            }
            Ok(removed)
        })
    }

    // -- fairness bins ------------------------------------------------------

    #[allow(clippy::cast_precision_loss)]
    fn grab_bin_values(
        &self,
        connector_class: &str,
        bin_name: &str,
        starting_value: f64,
        count: usize,
    ) -> error::Result<Vec<f64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.transact("grab_bin_values", |tx| {
            let stored: Option<f64> = tx
                .query_row(
                    "SELECT next_value FROM bin_counters \
                     WHERE connector_class = ?1 AND bin_name = ?2",
                    params![connector_class, bin_name],
                    |row| row.get(0),
                )
                .optional()?;
            let base = stored.map_or(starting_value, |v| v.max(starting_value));
            let next = base + count as f64;
            tx.execute(
                "INSERT INTO bin_counters (connector_class, bin_name, next_value) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(connector_class, bin_name) DO UPDATE SET next_value = excluded.next_value",
                params![connector_class, bin_name, next],
            )?;
            Ok((0..count).map(|i| base + i as f64).collect())
        })
    }

    // -- ingest status ------------------------------------------------------

    fn ingest_status(
        &self,
        output: &ConnectionName,
        document_key: &str,
    ) -> error::Result<Option<IngestStatus>> {
        self.read("ingest_status", |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {INGEST_COLUMNS} FROM ingest_status \
                         WHERE output_connection = ?1 AND document_key = ?2"
                    ),
                    params![output.as_str(), document_key],
                    ingest_row,
                )
                .optional()?;
            row.map(IngestRow::decode).transpose()
        })
    }

    fn ingest_statuses(&self, document_key: &str) -> error::Result<Vec<IngestStatus>> {
        self.read("ingest_statuses", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INGEST_COLUMNS} FROM ingest_status WHERE document_key = ?1 \
                 ORDER BY output_connection"
            ))?;
            let rows = stmt
                .query_map([document_key], ingest_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(IngestRow::decode).collect()
        })
    }

    fn record_ingest(&self, status: &IngestStatus) -> error::Result<()> {
        self.transact("record_ingest", |tx| {
            tx.execute(
                "INSERT INTO ingest_status \
                 (output_connection, document_key, uri, version, ingest_time) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(output_connection, document_key) DO UPDATE SET \
                 uri = excluded.uri, version = excluded.version, ingest_time = excluded.ingest_time",
                params![
                    status.output_connection.as_str(),
                    status.document_key,
                    status.uri,
                    status.version,
                    to_millis(status.ingest_time)
                ],
            )?;
            Ok(())
        })
    }

    fn remove_ingest(&self, output: &ConnectionName, document_key: &str) -> error::Result<()> {
        self.transact("remove_ingest", |tx| {
            tx.execute(
                "DELETE FROM ingest_status WHERE output_connection = ?1 AND document_key = ?2",
                params![output.as_str(), document_key],
            )?;
            Ok(())
        })
    }

    // -- activity history ---------------------------------------------------

    fn record_activity(&self, record: &ActivityRecord) -> error::Result<()> {
        self.transact("record_activity", |tx| {
            tx.execute(
                "INSERT INTO activity_history \
                 (occurred_at, connection, activity_type, byte_count, entity_id, result_code, \
                 description, elapsed_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    to_millis(record.timestamp),
                    record.connection.as_str(),
                    record.activity_type,
                    record.byte_count.map(to_sql_int),
                    record.entity_id,
                    record.result_code,
                    record.description,
                    record.elapsed_ms.map(to_sql_int)
                ],
            )?;
            Ok(())
        })
    }

    fn recent_activity(
        &self,
        connection: Option<&ConnectionName>,
        limit: usize,
    ) -> error::Result<Vec<ActivityRecord>> {
        self.read("recent_activity", |conn| {
            let sql = format!(
                "SELECT {ACTIVITY_COLUMNS} FROM activity_history \
                 WHERE ?1 IS NULL OR connection = ?1 \
                 ORDER BY occurred_at DESC, id DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![connection.map(ConnectionName::as_str), limit_to_sql(limit)],
                    activity_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(ActivityRow::decode).collect()
        })
    }
}
