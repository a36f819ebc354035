//! `PostgreSQL`-backed implementation of [`StateBackend`].
//!
//! Uses the sync `postgres` crate with a single `Mutex<Client>` for
//! thread safety. The `postgres` crate manages its own internal tokio
//! runtime, so this works from any thread.
//!
//! Several engines may share one database. Row locks (`SELECT ... FOR
//! UPDATE`) guard read-modify-write sequences, the claim step skips rows
//! another transaction has locked, and serialization failures or deadlocks
//! are retried by [`with_retry`].

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use postgres::{Client, NoTls, Row, Transaction};

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

/// Idempotent DDL for state tables (`PostgreSQL` dialect).
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS connections (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    connector TEXT NOT NULL,
    definition TEXT NOT NULL,
    updated_at BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    seeding_complete BOOLEAN NOT NULL DEFAULT FALSE,
    last_seed_time BIGINT,
    next_seed_time BIGINT,
    start_time BIGINT,
    end_time BIGINT,
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
    priority DOUBLE PRECISION NOT NULL,
    status TEXT NOT NULL,
    bin_name TEXT NOT NULL DEFAULT '',
    last_version TEXT,
    fail_count BIGINT NOT NULL DEFAULT 0,
    retry_count BIGINT NOT NULL DEFAULT 0,
    check_time BIGINT,
    error_message TEXT,
    PRIMARY KEY (job_id, identifier)
);

CREATE INDEX IF NOT EXISTS idx_documents_status_priority ON documents (status, priority);

CREATE TABLE IF NOT EXISTS bin_counters (
    connector_class TEXT NOT NULL,
    bin_name TEXT NOT NULL,
    next_value DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (connector_class, bin_name)
);

CREATE TABLE IF NOT EXISTS ingest_status (
    output_connection TEXT NOT NULL,
    document_key TEXT NOT NULL,
    uri TEXT NOT NULL,
    version TEXT,
    ingest_time BIGINT NOT NULL,
    PRIMARY KEY (output_connection, document_key)
);

CREATE INDEX IF NOT EXISTS idx_ingest_document ON ingest_status (document_key);

CREATE TABLE IF NOT EXISTS activity_history (
    id BIGSERIAL PRIMARY KEY,
    occurred_at BIGINT NOT NULL,
    connection TEXT NOT NULL,
    activity_type TEXT NOT NULL,
    byte_count BIGINT,
    entity_id TEXT NOT NULL,
    result_code TEXT NOT NULL,
    description TEXT,
    elapsed_ms BIGINT
);

CREATE INDEX IF NOT EXISTS idx_activity_connection ON activity_history (connection, occurred_at);
";

/// `PostgreSQL`-backed state storage.
///
/// Create with [`PostgresStateBackend::open`] providing a libpq-style
/// connection string (e.g. `"host=localhost dbname=harvester user=postgres"`).
pub struct PostgresStateBackend {
    client: Mutex<Client>,
    retry: RetryPolicy,
}

impl PostgresStateBackend {
    /// Connect to a `PostgreSQL` database and initialize state tables.
    ///
    /// `connstr` is a libpq-style connection string or `PostgreSQL` URI:
    /// - `"host=localhost port=5432 dbname=harvester user=postgres"`
    /// - `"postgresql://postgres@localhost/harvester"`
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Postgres`] if connection or DDL execution fails.
    pub fn open(connstr: &str) -> error::Result<Self> {
        let mut client = Client::connect(connstr, NoTls)?;
        client.batch_execute(CREATE_TABLES)?;
        Ok(Self {
            client: Mutex::new(client),
            retry: RetryPolicy::default(),
        })
    }

    /// Replace the contention retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Acquire the client lock.
    fn lock_client(&self) -> error::Result<MutexGuard<'_, Client>> {
        self.client.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn transact<T>(
        &self,
        operation: &str,
        mut body: impl FnMut(&mut Transaction<'_>) -> error::Result<T>,
    ) -> error::Result<T> {
        with_retry(&self.retry, operation, || {
            let mut client = self.lock_client()?;
            let mut tx = client.transaction()?;
            let value = body(&mut tx)?;
            tx.commit()?;
            Ok(value)
        })
    }
}

fn job_row(row: &Row) -> error::Result<JobRow> {
    Ok(JobRow {
        id: row.try_get(0)?,
        description: row.try_get(1)?,
        status: row.try_get(2)?,
        seeding_complete: row.try_get(3)?,
        last_seed_time: row.try_get(4)?,
        next_seed_time: row.try_get(5)?,
        start_time: row.try_get(6)?,
        end_time: row.try_get(7)?,
        error_message: row.try_get(8)?,
    })
}

fn document_row(row: &Row) -> error::Result<DocumentRow> {
    Ok(DocumentRow {
        job_id: row.try_get(0)?,
        identifier: row.try_get(1)?,
        priority: row.try_get(2)?,
        status: row.try_get(3)?,
        bin_name: row.try_get(4)?,
        last_version: row.try_get(5)?,
        fail_count: row.try_get(6)?,
        retry_count: row.try_get(7)?,
        check_time: row.try_get(8)?,
        error_message: row.try_get(9)?,
    })
}

fn ingest_row(row: &Row) -> error::Result<IngestRow> {
    Ok(IngestRow {
        output_connection: row.try_get(0)?,
        document_key: row.try_get(1)?,
        uri: row.try_get(2)?,
        version: row.try_get(3)?,
        ingest_time: row.try_get(4)?,
    })
}

fn activity_row(row: &Row) -> error::Result<ActivityRow> {
    Ok(ActivityRow {
        occurred_at: row.try_get(0)?,
        connection: row.try_get(1)?,
        activity_type: row.try_get(2)?,
        byte_count: row.try_get(3)?,
        entity_id: row.try_get(4)?,
        result_code: row.try_get(5)?,
        description: row.try_get(6)?,
        elapsed_ms: row.try_get(7)?,
    })
}

fn decode_jobs(rows: &[Row]) -> error::Result<Vec<Job>> {
    rows.iter().map(|row| job_row(row)?.decode()).collect()
}

fn decode_documents(rows: &[Row]) -> error::Result<Vec<DocumentRecord>> {
    rows.iter().map(|row| document_row(row)?.decode()).collect()
}

/// Current status of a job, row-locked for the rest of the transaction.
fn lock_job_status(tx: &mut Transaction<'_>, id: &JobId) -> error::Result<Option<JobStatus>> {
    let row = tx.query_opt(
        "SELECT status FROM jobs WHERE id = $1 FOR UPDATE",
        &[&id.as_str()],
    )?;
    match row {
        Some(row) => Ok(Some(parse_status(&row.try_get::<_, String>(0)?)?)),
        None => Ok(None),
    }
}

fn claim_job_name(
    tx: &mut Transaction<'_>,
    name: &str,
    except: Option<&JobId>,
) -> error::Result<()> {
    tx.execute(
        "DELETE FROM jobs WHERE name = $1 AND status = $2",
        &[&name, &JobStatus::Deleted.as_str()],
    )?;
    let holder = tx.query_opt("SELECT id FROM jobs WHERE name = $1", &[&name])?;
    if let Some(row) = holder {
        let id: String = row.try_get(0)?;
        if except.map_or(true, |ex| ex.as_str() != id) {
            return Err(StateError::DuplicateJobName(name.to_string()));
        }
    }
    Ok(())
}

fn write_job_connections(
    tx: &mut Transaction<'_>,
    id: &JobId,
    description: &JobDescription,
) -> error::Result<()> {
    tx.execute("DELETE FROM job_connections WHERE job_id = $1", &[&id.as_str()])?;
    for connection in description.referenced_connections() {
        tx.execute(
            "INSERT INTO job_connections (job_id, connection) VALUES ($1, $2)",
            &[&id.as_str(), &connection.as_str()],
        )?;
    }
    Ok(())
}

impl StateBackend for PostgresStateBackend {
    fn save_connection(&self, connection: &ConnectionDef) -> error::Result<()> {
        let definition = to_json(connection)?;
        self.transact("save_connection", |tx| {
            tx.execute(
                "INSERT INTO connections (name, kind, connector, definition, updated_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (name) DO UPDATE SET kind = EXCLUDED.kind, \
                 connector = EXCLUDED.connector, definition = EXCLUDED.definition, \
                 updated_at = EXCLUDED.updated_at",
                &[
                    &connection.name.as_str(),
                    &connection.kind.as_str(),
                    &connection.connector,
                    &definition,
                    &to_millis(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    fn load_connection(&self, name: &ConnectionName) -> error::Result<Option<ConnectionDef>> {
        self.transact("load_connection", |tx| {
            let row = tx.query_opt(
                "SELECT definition FROM connections WHERE name = $1",
                &[&name.as_str()],
            )?;
            match row {
                Some(row) => Ok(Some(from_json(&row.try_get::<_, String>(0)?)?)),
                None => Ok(None),
            }
        })
    }

    fn list_connections(&self) -> error::Result<Vec<ConnectionDef>> {
        self.transact("list_connections", |tx| {
            let rows = tx.query("SELECT definition FROM connections ORDER BY name", &[])?;
            rows.iter()
                .map(|row| from_json(&row.try_get::<_, String>(0)?))
                .collect()
        })
    }

    fn delete_connection(&self, name: &ConnectionName) -> error::Result<bool> {
        self.transact("delete_connection", |tx| {
            let user = tx.query_opt(
                "SELECT j.name FROM job_connections jc JOIN jobs j ON j.id = jc.job_id \
                 WHERE jc.connection = $1 AND j.status <> $2 ORDER BY j.name LIMIT 1 \
                 FOR SHARE OF j",
                &[&name.as_str(), &JobStatus::Deleted.as_str()],
            )?;
            if let Some(row) = user {
                return Err(StateError::ConnectionInUse {
                    connection: name.clone(),
                    job: row.try_get(0)?,
                });
            }
            let removed = tx.execute("DELETE FROM connections WHERE name = $1", &[&name.as_str()])?;
            Ok(removed > 0)
        })
    }

    fn create_job(&self, description: &JobDescription) -> error::Result<Job> {
        let encoded = to_json(description)?;
        self.transact("create_job", |tx| {
            claim_job_name(tx, &description.name, None)?;
            let id = JobId::generate();
            tx.execute(
                "INSERT INTO jobs (id, name, description, status) VALUES ($1, $2, $3, $4)",
                &[
                    &id.as_str(),
                    &description.name,
                    &encoded,
                    &JobStatus::NotYetRun.as_str(),
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
            if matches!(lock_job_status(tx, id)?, None | Some(JobStatus::Deleted)) {
                return Err(StateError::JobNotFound(id.clone()));
            }
            claim_job_name(tx, &description.name, Some(id))?;
            tx.execute(
                "UPDATE jobs SET name = $1, description = $2 WHERE id = $3",
                &[&description.name, &encoded, &id.as_str()],
            )?;
            write_job_connections(tx, id, description)
        })
    }

    fn load_job(&self, id: &JobId) -> error::Result<Option<Job>> {
        self.transact("load_job", |tx| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
            let rows = tx.query(&sql, &[&id.as_str()])?;
            Ok(decode_jobs(&rows)?.pop())
        })
    }

    fn find_job_by_name(&self, name: &str) -> error::Result<Option<Job>> {
        self.transact("find_job_by_name", |tx| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = $1 AND status <> $2");
            let rows = tx.query(&sql, &[&name, &JobStatus::Deleted.as_str()])?;
            Ok(decode_jobs(&rows)?.pop())
        })
    }

    fn list_jobs(&self) -> error::Result<Vec<Job>> {
        self.transact("list_jobs", |tx| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status <> $1 ORDER BY name");
            let rows = tx.query(&sql, &[&JobStatus::Deleted.as_str()])?;
            decode_jobs(&rows)
        })
    }

    fn jobs_in_status(&self, statuses: &[JobStatus]) -> error::Result<Vec<Job>> {
        let wanted: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        self.transact("jobs_in_status", |tx| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = ANY($1) ORDER BY name");
            let rows = tx.query(&sql, &[&wanted])?;
            decode_jobs(&rows)
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
            match lock_job_status(tx, id)? {
                Some(current) if from.contains(&current) => {}
                _ => return Ok(false),
            }
            tx.execute(
                "UPDATE jobs SET status = $1, end_time = COALESCE($2, end_time), \
                 error_message = COALESCE($3, error_message) WHERE id = $4",
                &[
                    &to.as_str(),
                    &opt_to_millis(update.end_time),
                    &update.error_message,
                    &id.as_str(),
                ],
            )?;
            Ok(true)
        })
    }

    fn begin_job_run(&self, id: &JobId, now: DateTime<Utc>) -> error::Result<bool> {
        self.transact("begin_job_run", |tx| {
            match lock_job_status(tx, id)? {
                Some(current) if current.is_startable() => {}
                _ => return Ok(false),
            }
            tx.execute(
                "UPDATE jobs SET status = $1, start_time = $2, end_time = NULL, \
                 error_message = NULL, seeding_complete = FALSE, next_seed_time = NULL \
                 WHERE id = $3",
                &[&JobStatus::Running.as_str(), &to_millis(now), &id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM documents WHERE job_id = $1 AND status = $2",
                &[&id.as_str(), &DocumentStatus::Deleted.as_str()],
            )?;
            tx.execute(
                "UPDATE documents SET status = $1, retry_count = 0, check_time = NULL, \
                 error_message = NULL WHERE job_id = $2 AND status IN ($3, $4)",
                &[
                    &DocumentStatus::Pending.as_str(),
                    &id.as_str(),
                    &DocumentStatus::Completed.as_str(),
                    &DocumentStatus::Error.as_str(),
                ],
            )?;
            Ok(true)
        })
    }

    fn note_seeding(&self, id: &JobId, progress: SeedingProgress) -> error::Result<()> {
        self.transact("note_seeding", |tx| {
            tx.execute(
                "UPDATE jobs SET seeding_complete = $1, \
                 last_seed_time = COALESCE($2, last_seed_time), next_seed_time = $3 \
                 WHERE id = $4",
                &[
                    &progress.seeding_complete,
                    &opt_to_millis(progress.last_seed_time),
                    &opt_to_millis(progress.next_seed_time),
                    &id.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    fn begin_job_deletion(&self, id: &JobId) -> error::Result<bool> {
        self.transact("begin_job_deletion", |tx| {
            match lock_job_status(tx, id)? {
                Some(JobStatus::Deleting | JobStatus::Deleted) | None => return Ok(false),
                Some(_) => {}
            }
            tx.execute(
                "UPDATE jobs SET status = $1 WHERE id = $2",
                &[&JobStatus::Deleting.as_str(), &id.as_str()],
            )?;
            tx.execute(
                "UPDATE documents SET status = $1 WHERE job_id = $2 AND status <> $3",
                &[
                    &DocumentStatus::BeingDeleted.as_str(),
                    &id.as_str(),
                    &DocumentStatus::Active.as_str(),
                ],
            )?;
            Ok(true)
        })
    }

    fn finish_job_deletion(&self, id: &JobId) -> error::Result<bool> {
        self.transact("finish_job_deletion", |tx| {
            if lock_job_status(tx, id)? != Some(JobStatus::Deleting) {
                return Ok(false);
            }
            let remaining: i64 = tx
                .query_one(
                    "SELECT COUNT(*) FROM documents WHERE job_id = $1",
                    &[&id.as_str()],
                )?
                .try_get(0)?;
            if remaining > 0 {
                return Ok(false);
            }
            tx.execute(
                "UPDATE jobs SET status = $1 WHERE id = $2",
                &[&JobStatus::Deleted.as_str(), &id.as_str()],
            )?;
            tx.execute("DELETE FROM job_connections WHERE job_id = $1", &[&id.as_str()])?;
            Ok(true)
        })
    }

    fn add_documents(&self, job: &JobId, documents: &[NewDocument]) -> error::Result<u64> {
        if documents.is_empty() {
            return Ok(0);
        }
        self.transact("add_documents", |tx| {
            let stmt = tx.prepare(
                "INSERT INTO documents (job_id, identifier, priority, status, bin_name) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (job_id, identifier) DO UPDATE SET status = EXCLUDED.status, \
                 priority = EXCLUDED.priority, bin_name = EXCLUDED.bin_name, \
                 retry_count = 0, check_time = NULL, error_message = NULL \
                 WHERE documents.status IN ($6, $7, $8)",
            )?;
            let mut changed = 0u64;
            for doc in documents {
                changed += tx.execute(
                    &stmt,
                    &[
                        &job.as_str(),
                        &doc.identifier,
                        &doc.priority,
                        &DocumentStatus::Pending.as_str(),
                        &doc.bin_name,
                        &DocumentStatus::Completed.as_str(),
                        &DocumentStatus::Error.as_str(),
                        &DocumentStatus::Deleted.as_str(),
                    ],
                )?;
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
            let rows = tx.query(
                "WITH picked AS ( \
                   SELECT d.job_id, d.identifier FROM documents d \
                   JOIN jobs j ON j.id = d.job_id \
                   WHERE d.status = $1 AND j.status = $2 \
                   AND (d.check_time IS NULL OR d.check_time <= $3) \
                   ORDER BY d.priority, d.identifier LIMIT $4 \
                   FOR UPDATE OF d SKIP LOCKED) \
                 UPDATE documents d SET status = $5 FROM picked p \
                 WHERE d.job_id = p.job_id AND d.identifier = p.identifier \
                 RETURNING d.job_id, d.identifier, d.priority, d.status, d.bin_name, \
                 d.last_version, d.fail_count, d.retry_count, d.check_time, d.error_message",
                &[
                    &DocumentStatus::Pending.as_str(),
                    &JobStatus::Running.as_str(),
                    &to_millis(now),
                    &limit_to_sql(limit),
                    &DocumentStatus::Active.as_str(),
                ],
            )?;
            let mut claimed = decode_documents(&rows)?;
            claimed.sort_by(|a, b| {
                a.priority
                    .total_cmp(&b.priority)
                    .then_with(|| a.identifier.cmp(&b.identifier))
            });
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
            if lock_job_status(tx, job)? == Some(JobStatus::Deleting) {
                tx.execute(
                    "UPDATE documents SET status = $1 \
                     WHERE job_id = $2 AND identifier = $3 AND status = $4",
                    &[
                        &DocumentStatus::BeingDeleted.as_str(),
                        &job.as_str(),
                        &identifier,
                        &DocumentStatus::Active.as_str(),
                    ],
                )?;
                return Ok(false);
            }
            let changed = tx.execute(
                "UPDATE documents SET status = $1, \
                 last_version = CASE WHEN $2 THEN $3 ELSE last_version END, \
                 fail_count = fail_count + $4, \
                 retry_count = CASE WHEN $5 THEN retry_count + $6 ELSE 0 END, \
                 check_time = $7, error_message = $8 \
                 WHERE job_id = $9 AND identifier = $10 AND status = $11",
                &[
                    &update.status.as_str(),
                    &update.sets_version(),
                    &update.version_value(),
                    &update.fail_increment,
                    &update.keeps_retry_count(),
                    &update.retry_delta(),
                    &update.check_time,
                    &update.error_message,
                    &job.as_str(),
                    &identifier,
                    &DocumentStatus::Active.as_str(),
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
        self.transact("load_document", |tx| {
            let sql = format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE job_id = $1 AND identifier = $2"
            );
            let rows = tx.query(&sql, &[&job.as_str(), &identifier])?;
            Ok(decode_documents(&rows)?.pop())
        })
    }

    fn document_counts(&self, job: &JobId) -> error::Result<DocumentCounts> {
        self.transact("document_counts", |tx| {
            let rows = tx.query(
                "SELECT status, COUNT(*) FROM documents WHERE job_id = $1 GROUP BY status",
                &[&job.as_str()],
            )?;
            let mut counts = DocumentCounts::default();
            for row in rows {
                let status: String = row.try_get(0)?;
                let count: i64 = row.try_get(1)?;
                counts.record(parse_status(&status)?, from_sql_count(count));
            }
            Ok(counts)
        })
    }

    fn lowest_pending_priority(&self) -> error::Result<Option<f64>> {
        self.transact("lowest_pending_priority", |tx| {
            Ok(tx
                .query_one(
                    "SELECT MIN(d.priority) FROM documents d JOIN jobs j ON j.id = d.job_id \
                     WHERE d.status = $1 AND j.status = $2",
                    &[&DocumentStatus::Pending.as_str(), &JobStatus::Running.as_str()],
                )?
                .try_get(0)?)
        })
    }

    fn reset_active_documents(&self) -> error::Result<u64> {
        self.transact("reset_active_documents", |tx| {
            Ok(tx.execute(
                "UPDATE documents SET status = $1 WHERE status = $2",
                &[
                    &DocumentStatus::Pending.as_str(),
                    &DocumentStatus::Active.as_str(),
                ],
            )?)
        })
    }

    fn documents_being_deleted(
        &self,
        job: &JobId,
        limit: usize,
    ) -> error::Result<Vec<DocumentRecord>> {
        self.transact("documents_being_deleted", |tx| {
            let sql = format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE job_id = $1 AND status = $2 \
                 ORDER BY identifier LIMIT $3"
            );
            let rows = tx.query(
                &sql,
                &[
                    &job.as_str(),
                    &DocumentStatus::BeingDeleted.as_str(),
                    &limit_to_sql(limit),
                ],
            )?;
            decode_documents(&rows)
        })
    }

    fn purge_documents(&self, job: &JobId, identifiers: &[String]) -> error::Result<u64> {
        if identifiers.is_empty() {
            return Ok(0);
        }
        self.transact("purge_documents", |tx| {
            Ok(tx.execute(
                "DELETE FROM documents WHERE job_id = $1 AND identifier = ANY($2)",
                &[&job.as_str(), &identifiers],
            )?)
        })
    }

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
            tx.execute(
                "INSERT INTO bin_counters (connector_class, bin_name, next_value) \
                 VALUES ($1, $2, $3) ON CONFLICT (connector_class, bin_name) DO NOTHING",
                &[&connector_class, &bin_name, &starting_value],
            )?;
            let stored: f64 = tx
                .query_one(
                    "SELECT next_value FROM bin_counters \
                     WHERE connector_class = $1 AND bin_name = $2 FOR UPDATE",
                    &[&connector_class, &bin_name],
                )?
                .try_get(0)?;
            let base = stored.max(starting_value);
            let next = base + count as f64;
            tx.execute(
                "UPDATE bin_counters SET next_value = $3 \
                 WHERE connector_class = $1 AND bin_name = $2",
                &[&connector_class, &bin_name, &next],
            )?;
            Ok((0..count).map(|i| base + i as f64).collect())
        })
    }

    fn ingest_status(
        &self,
        output: &ConnectionName,
        document_key: &str,
    ) -> error::Result<Option<IngestStatus>> {
        self.transact("ingest_status", |tx| {
            let sql = format!(
                "SELECT {INGEST_COLUMNS} FROM ingest_status \
                 WHERE output_connection = $1 AND document_key = $2"
            );
            match tx.query_opt(&sql, &[&output.as_str(), &document_key])? {
                Some(row) => Ok(Some(ingest_row(&row)?.decode()?)),
                None => Ok(None),
            }
        })
    }

    fn ingest_statuses(&self, document_key: &str) -> error::Result<Vec<IngestStatus>> {
        self.transact("ingest_statuses", |tx| {
            let sql = format!(
                "SELECT {INGEST_COLUMNS} FROM ingest_status WHERE document_key = $1 \
                 ORDER BY output_connection"
            );
            let rows = tx.query(&sql, &[&document_key])?;
            rows.iter().map(|row| ingest_row(row)?.decode()).collect()
        })
    }

    fn record_ingest(&self, status: &IngestStatus) -> error::Result<()> {
        self.transact("record_ingest", |tx| {
            tx.execute(
                "INSERT INTO ingest_status \
                 (output_connection, document_key, uri, version, ingest_time) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (output_connection, document_key) DO UPDATE SET \
                 uri = EXCLUDED.uri, version = EXCLUDED.version, \
                 ingest_time = EXCLUDED.ingest_time",
                &[
                    &status.output_connection.as_str(),
                    &status.document_key,
                    &status.uri,
                    &status.version,
                    &to_millis(status.ingest_time),
                ],
            )?;
            Ok(())
        })
    }

    fn remove_ingest(&self, output: &ConnectionName, document_key: &str) -> error::Result<()> {
        self.transact("remove_ingest", |tx| {
            tx.execute(
                "DELETE FROM ingest_status WHERE output_connection = $1 AND document_key = $2",
                &[&output.as_str(), &document_key],
            )?;
            Ok(())
        })
    }

    fn record_activity(&self, record: &ActivityRecord) -> error::Result<()> {
        self.transact("record_activity", |tx| {
            tx.execute(
                "INSERT INTO activity_history \
                 (occurred_at, connection, activity_type, byte_count, entity_id, result_code, \
                 description, elapsed_ms) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &to_millis(record.timestamp),
                    &record.connection.as_str(),
                    &record.activity_type,
                    &record.byte_count.map(to_sql_int),
                    &record.entity_id,
                    &record.result_code,
                    &record.description,
                    &record.elapsed_ms.map(to_sql_int),
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
        let filter = connection.map(ConnectionName::as_str);
        self.transact("recent_activity", |tx| {
            let sql = format!(
                "SELECT {ACTIVITY_COLUMNS} FROM activity_history \
                 WHERE $1::TEXT IS NULL OR connection = $1 \
                 ORDER BY occurred_at DESC, id DESC LIMIT $2"
            );
            let rows = tx.query(&sql, &[&filter, &limit_to_sql(limit)])?;
            rows.iter().map(|row| activity_row(row)?.decode()).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_types::job::PipelineStage;

    fn test_connstr() -> String {
        std::env::var("TEST_POSTGRES_URL")
            .unwrap_or_else(|_| "host=localhost user=postgres dbname=harvester_test".into())
    }

    fn clean_tables(client: &mut Client) {
        client
            .batch_execute(
                "DELETE FROM job_connections; DELETE FROM documents; DELETE FROM jobs; \
                 DELETE FROM connections; DELETE FROM bin_counters; \
                 DELETE FROM ingest_status; DELETE FROM activity_history;",
            )
            .unwrap();
    }

    fn fresh() -> PostgresStateBackend {
        let backend = PostgresStateBackend::open(&test_connstr()).unwrap();
        clean_tables(&mut backend.lock_client().unwrap());
        backend
    }

    fn doc(identifier: &str, priority: f64) -> NewDocument {
        NewDocument {
            identifier: identifier.into(),
            priority,
            bin_name: String::new(),
        }
    }

    #[test]
    #[ignore = "requires TEST_POSTGRES_URL"]
    fn claim_and_finish_lifecycle() {
        let backend = fresh();
        let job = backend
            .create_job(
                &JobDescription::new("pg_crawl", "files").with_stage(PipelineStage::output("idx")),
            )
            .unwrap();
        assert!(backend.begin_job_run(&job.id, Utc::now()).unwrap());
        backend
            .add_documents(&job.id, &[doc("b", 2.0), doc("a", 1.0)])
            .unwrap();

        let claimed = backend.claim_documents(10, Utc::now()).unwrap();
        let ids: Vec<_> = claimed.iter().map(|d| d.identifier.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);

        let version = Some("v1".to_string());
        assert!(backend
            .finish_document(&job.id, "a", &DocumentOutcome::Completed { version })
            .unwrap());
        let counts = backend.document_counts(&job.id).unwrap();
        assert_eq!((counts.completed, counts.active), (1, 1));
    }

    #[test]
    #[ignore = "requires TEST_POSTGRES_URL"]
    fn bin_values_contiguous_across_clients() {
        let backend = std::sync::Arc::new(fresh());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let backend = std::sync::Arc::clone(&backend);
                std::thread::spawn(move || {
                    (0..10)
                        .flat_map(|_| backend.grab_bin_values("pg", "bin", 0.0, 5).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<f64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_by(f64::total_cmp);
        let expected: Vec<f64> = (0..200).map(f64::from).collect();
        assert_eq!(all, expected);
    }

    #[test]
    #[ignore = "requires TEST_POSTGRES_URL"]
    fn connection_in_use_rejected() {
        let backend = fresh();
        backend
            .create_job(
                &JobDescription::new("pg_uses", "files").with_stage(PipelineStage::output("idx")),
            )
            .unwrap();
        let err = backend
            .delete_connection(&ConnectionName::new("idx"))
            .unwrap_err();
        assert!(matches!(err, StateError::ConnectionInUse { .. }));
    }
}
