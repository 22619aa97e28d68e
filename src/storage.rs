use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};

use crate::errors::StorageError;
use crate::model::{Commit, CommitInfo, CommitStatus, Project, SortOrder};
use crate::state::is_valid_transition;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS project (
    slug        TEXT NOT NULL,
    name        TEXT NOT NULL,
    repository  TEXT NOT NULL,
    branch      TEXT NOT NULL,
    command     BLOB NOT NULL,
    url_pattern TEXT,
    PRIMARY KEY (slug)
);

CREATE TABLE IF NOT EXISTS `commit` (
    slug        TEXT NOT NULL,
    sha         TEXT NOT NULL,
    date        TEXT NOT NULL,
    message     BLOB NOT NULL,
    author      TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'unknown'
                CHECK (status IN ('unknown', 'building', 'passed', 'failed')),
    output      BLOB NOT NULL DEFAULT x'',
    build_date  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%f', 'now') || '000Z'),
    PRIMARY KEY (slug, sha),
    CONSTRAINT slug FOREIGN KEY (slug) REFERENCES project(slug) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_commit_build_date ON `commit`(slug, build_date);
";

/// Writes on a contended database wait this long before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(1000);

const COMMIT_COLUMNS: &str = "slug, sha, date, message, author, status, output, build_date";

/// Async-safe handle to the build database.
///
/// Wraps `StorageDb` behind `Arc<Mutex>` and runs every access on tokio's
/// blocking pool, so SQLite I/O never stalls async worker threads.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<std::sync::Mutex<StorageDb>>,
}

impl Storage {
    pub fn new(db: StorageDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Ok(Self::new(StorageDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self::new(StorageDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&StorageDb) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StorageError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StorageError::TaskPanicked(e.to_string()))?
    }

    pub async fn upsert_project(&self, project: &Project) -> Result<(), StorageError> {
        let project = project.clone();
        self.call(move |db| db.upsert_project(&project)).await
    }

    pub async fn get_project(&self, slug: &str) -> Result<Option<Project>, StorageError> {
        let slug = slug.to_string();
        self.call(move |db| db.get_project(&slug)).await
    }

    pub async fn delete_project(&self, slug: &str) -> Result<bool, StorageError> {
        let slug = slug.to_string();
        self.call(move |db| db.delete_project(&slug)).await
    }

    pub async fn known_shas(&self, slug: &str) -> Result<HashSet<String>, StorageError> {
        let slug = slug.to_string();
        self.call(move |db| db.known_shas(&slug)).await
    }

    pub async fn insert_building(
        &self,
        slug: &str,
        info: &CommitInfo,
        build_date: DateTime<Utc>,
    ) -> Result<Commit, StorageError> {
        let slug = slug.to_string();
        let info = info.clone();
        self.call(move |db| db.insert_building(&slug, &info, build_date))
            .await
    }

    pub async fn restart(
        &self,
        slug: &str,
        info: &CommitInfo,
        build_date: DateTime<Utc>,
    ) -> Result<Commit, StorageError> {
        let slug = slug.to_string();
        let info = info.clone();
        self.call(move |db| db.restart(&slug, &info, build_date)).await
    }

    pub async fn finalize(
        &self,
        slug: &str,
        sha: &str,
        status: CommitStatus,
        output: Vec<u8>,
    ) -> Result<(), StorageError> {
        let slug = slug.to_string();
        let sha = sha.to_string();
        self.call(move |db| db.finalize(&slug, &sha, status, &output))
            .await
    }

    pub async fn get_commit(&self, slug: &str, sha: &str) -> Result<Option<Commit>, StorageError> {
        let slug = slug.to_string();
        let sha = sha.to_string();
        self.call(move |db| db.get_commit(&slug, &sha)).await
    }

    pub async fn list_commits(
        &self,
        slug: &str,
        limit: Option<usize>,
        order: SortOrder,
    ) -> Result<Vec<Commit>, StorageError> {
        let slug = slug.to_string();
        self.call(move |db| db.list_commits(&slug, limit, order))
            .await
    }

    pub async fn latest_commit(&self, slug: &str) -> Result<Option<Commit>, StorageError> {
        let slug = slug.to_string();
        self.call(move |db| db.latest_commit(&slug)).await
    }
}

pub struct StorageDb {
    conn: Connection,
}

impl StorageDb {
    /// Open (or create) a SQLite database at the given path and apply the schema.
    pub fn new(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StorageError> {
        self.conn.busy_timeout(BUSY_TIMEOUT)?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn upsert_project(&self, project: &Project) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO project (slug, name, repository, branch, command, url_pattern)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(slug) DO UPDATE SET
                name = excluded.name,
                repository = excluded.repository,
                branch = excluded.branch,
                command = excluded.command,
                url_pattern = excluded.url_pattern",
            params![
                project.slug,
                project.name,
                project.repository,
                project.branch,
                project.command,
                project.url_pattern
            ],
        )?;
        Ok(())
    }

    pub fn get_project(&self, slug: &str) -> Result<Option<Project>, StorageError> {
        let project = self
            .conn
            .query_row(
                "SELECT slug, name, repository, branch, command, url_pattern
                 FROM project WHERE slug = ?1",
                params![slug],
                |row| {
                    Ok(Project {
                        slug: row.get(0)?,
                        name: row.get(1)?,
                        repository: row.get(2)?,
                        branch: row.get(3)?,
                        command: row.get(4)?,
                        url_pattern: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(project)
    }

    /// Delete a project. Its commits go with it through the foreign key.
    pub fn delete_project(&self, slug: &str) -> Result<bool, StorageError> {
        let removed = self
            .conn
            .execute("DELETE FROM project WHERE slug = ?1", params![slug])?;
        Ok(removed > 0)
    }

    pub fn known_shas(&self, slug: &str) -> Result<HashSet<String>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT sha FROM `commit` WHERE slug = ?1")?;
        let shas = stmt
            .query_map(params![slug], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(shas)
    }

    /// Record a newly discovered commit as `building`. The primary key rejects
    /// a second row for the same `(slug, sha)`.
    pub fn insert_building(
        &self,
        slug: &str,
        info: &CommitInfo,
        build_date: DateTime<Utc>,
    ) -> Result<Commit, StorageError> {
        let result = self.conn.execute(
            "INSERT INTO `commit` (slug, sha, date, message, author, status, output, build_date)
             VALUES (?1, ?2, ?3, ?4, ?5, 'building', x'', ?6)",
            params![
                slug,
                info.sha,
                format_ts(info.date),
                info.message,
                info.author,
                format_ts(build_date)
            ],
        );

        match result {
            Ok(_) => Ok(building_commit(slug, info, build_date)),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation
                    && matches!(
                        e.extended_code,
                        rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                            | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    ) =>
            {
                Err(StorageError::Duplicate {
                    slug: slug.to_string(),
                    sha: info.sha.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reset a commit row to `building` for an explicit rebuild, creating it
    /// when the sha was never recorded.
    pub fn restart(
        &self,
        slug: &str,
        info: &CommitInfo,
        build_date: DateTime<Utc>,
    ) -> Result<Commit, StorageError> {
        self.conn.execute(
            "INSERT INTO `commit` (slug, sha, date, message, author, status, output, build_date)
             VALUES (?1, ?2, ?3, ?4, ?5, 'building', x'', ?6)
             ON CONFLICT(slug, sha) DO UPDATE SET
                status = 'building',
                output = x'',
                build_date = excluded.build_date",
            params![
                slug,
                info.sha,
                format_ts(info.date),
                info.message,
                info.author,
                format_ts(build_date)
            ],
        )?;
        Ok(building_commit(slug, info, build_date))
    }

    /// Refine a `building` row in place with its terminal status and output.
    pub fn finalize(
        &self,
        slug: &str,
        sha: &str,
        status: CommitStatus,
        output: &[u8],
    ) -> Result<(), StorageError> {
        if !is_valid_transition(CommitStatus::Building, status) || status == CommitStatus::Building {
            return Err(StorageError::InvalidColumn {
                column: "status".to_string(),
                message: format!("a build cannot finish as '{}'", status),
            });
        }
        let updated = self.conn.execute(
            "UPDATE `commit` SET status = ?3, output = ?4
             WHERE slug = ?1 AND sha = ?2 AND status = 'building'",
            params![slug, sha, status.as_str(), output],
        )?;
        if updated == 0 {
            return Err(StorageError::MissingRow {
                slug: slug.to_string(),
                sha: sha.to_string(),
            });
        }
        Ok(())
    }

    pub fn get_commit(&self, slug: &str, sha: &str) -> Result<Option<Commit>, StorageError> {
        let sql = format!(
            "SELECT {} FROM `commit` WHERE slug = ?1 AND sha = ?2",
            COMMIT_COLUMNS
        );
        let raw = self
            .conn
            .query_row(&sql, params![slug, sha], RawCommit::from_row)
            .optional()?;
        raw.map(RawCommit::into_commit).transpose()
    }

    /// Commits of a project ordered by `build_date`, ties broken by insertion order.
    pub fn list_commits(
        &self,
        slug: &str,
        limit: Option<usize>,
        order: SortOrder,
    ) -> Result<Vec<Commit>, StorageError> {
        let sql = format!(
            "SELECT {cols} FROM `commit` WHERE slug = ?1
             ORDER BY build_date {dir}, rowid {dir} LIMIT ?2",
            cols = COMMIT_COLUMNS,
            dir = order.sql()
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params![slug, limit], RawCommit::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawCommit::into_commit).collect()
    }

    pub fn latest_commit(&self, slug: &str) -> Result<Option<Commit>, StorageError> {
        Ok(self
            .list_commits(slug, Some(1), SortOrder::Descending)?
            .into_iter()
            .next())
    }
}

fn building_commit(slug: &str, info: &CommitInfo, build_date: DateTime<Utc>) -> Commit {
    Commit {
        slug: slug.to_string(),
        sha: info.sha.clone(),
        date: info.date,
        message: info.message.clone(),
        author: info.author.clone(),
        status: CommitStatus::Building,
        output: Vec::new(),
        build_date,
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &str, value: &str) -> Result<DateTime<Utc>, StorageError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    // Rows written through the column default by other tools.
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| StorageError::InvalidColumn {
            column: column.to_string(),
            message: format!("{}: {}", value, e),
        })
}

/// Row as stored, before parsing the enum and timestamp columns.
struct RawCommit {
    slug: String,
    sha: String,
    date: String,
    message: Vec<u8>,
    author: String,
    status: String,
    output: Vec<u8>,
    build_date: String,
}

impl RawCommit {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            slug: row.get(0)?,
            sha: row.get(1)?,
            date: row.get(2)?,
            message: blob_or_text(row, 3)?,
            author: row.get(4)?,
            status: row.get(5)?,
            output: blob_or_text(row, 6)?,
            build_date: row.get(7)?,
        })
    }

    fn into_commit(self) -> Result<Commit, StorageError> {
        let status =
            CommitStatus::from_str(&self.status).map_err(|message| StorageError::InvalidColumn {
                column: "status".to_string(),
                message,
            })?;
        Ok(Commit {
            date: parse_ts("date", &self.date)?,
            build_date: parse_ts("build_date", &self.build_date)?,
            slug: self.slug,
            sha: self.sha,
            message: String::from_utf8_lossy(&self.message).into_owned(),
            author: self.author,
            status,
            output: self.output,
        })
    }
}

/// BLOB columns may hold TEXT values when written by string parameters.
fn blob_or_text(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<u8>> {
    use rusqlite::types::ValueRef;
    match row.get_ref(idx)? {
        ValueRef::Blob(b) => Ok(b.to_vec()),
        ValueRef::Text(t) => Ok(t.to_vec()),
        ValueRef::Null => Ok(Vec::new()),
        other => Err(rusqlite::Error::InvalidColumnType(
            idx,
            "message/output".to_string(),
            other.data_type(),
        )),
    }
}
