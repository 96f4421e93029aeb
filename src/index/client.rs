//! Typed accessors over the Data Index (`spec.md` §4.1, §6).

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::retry::with_retry;
use super::types::*;
use super::{IndexError, EXPECTED_SCHEMA_VERSION};

/// Thin wrapper around a `sqlx::PgPool` exposing the narrow,
/// retry-safe update API `spec.md` §4.1 names, plus the read
/// accessors C8's update loop needs to discover work.
#[derive(Clone)]
pub struct Pool {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    name: String,
    group_name: String,
    active: bool,
    io_class: String,
    storage_type: String,
    root: String,
    username: Option<String>,
    address: Option<String>,
    auto_import: bool,
    auto_verify: bool,
    avail_gb: Option<f64>,
    min_avail_gb: Option<f64>,
    max_total_gb: Option<f64>,
    daemon_host: String,
    io_config: Option<serde_json::Value>,
}

impl From<NodeRow> for Node {
    fn from(r: NodeRow) -> Self {
        Node {
            name: r.name,
            group_name: r.group_name,
            active: r.active,
            io_class: r.io_class,
            storage_type: StorageType::from_char(r.storage_type.chars().next().unwrap_or('-'))
                .unwrap_or(StorageType::Unset),
            root: r.root,
            username: r.username,
            address: r.address,
            auto_import: r.auto_import,
            auto_verify: r.auto_verify,
            avail_gb: r.avail_gb,
            min_avail_gb: r.min_avail_gb,
            max_total_gb: r.max_total_gb,
            daemon_host: r.daemon_host,
            io_config: r.io_config,
        }
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    name: String,
    io_class: String,
}

impl From<GroupRow> for Group {
    fn from(r: GroupRow) -> Self {
        Group { name: r.name, io_class: r.io_class }
    }
}

#[derive(sqlx::FromRow)]
struct FileRow {
    id: i64,
    acq_name: String,
    name: String,
    size_b: i64,
    md5sum: Vec<u8>,
    registered: DateTime<Utc>,
}

impl TryFrom<FileRow> for File {
    type Error = anyhow::Error;

    fn try_from(r: FileRow) -> Result<Self> {
        let mut md5 = [0u8; 16];
        if r.md5sum.len() != 16 {
            bail!("corrupt file row {}: md5sum is not 16 bytes", r.id);
        }
        md5.copy_from_slice(&r.md5sum);
        Ok(File {
            id: r.id,
            acq_name: r.acq_name,
            name: r.name,
            size_b: r.size_b,
            md5sum: md5,
            registered: r.registered,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FileCopyRow {
    id: i64,
    file_id: i64,
    node_name: String,
    state: String,
    has_file: bool,
    size_b: i64,
    last_update: DateTime<Utc>,
    last_check: Option<DateTime<Utc>>,
}

impl From<FileCopyRow> for FileCopy {
    fn from(r: FileCopyRow) -> Self {
        FileCopy {
            id: r.id,
            file_id: r.file_id,
            node_name: r.node_name,
            state: CopyState::from_char(r.state.chars().next().unwrap_or('M'))
                .unwrap_or(CopyState::Missing),
            has_file: r.has_file,
            size_b: r.size_b,
            last_update: r.last_update,
            last_check: r.last_check,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ImportRequestRow {
    id: i64,
    path: String,
    node_name: String,
    recurse: bool,
    register_new: bool,
    completed: bool,
    timestamp: DateTime<Utc>,
}

impl From<ImportRequestRow> for ImportRequest {
    fn from(r: ImportRequestRow) -> Self {
        ImportRequest {
            id: r.id,
            path: r.path,
            node_name: r.node_name,
            recurse: r.recurse,
            register_new: r.register_new,
            completed: r.completed,
            timestamp: r.timestamp,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CopyRequestRow {
    id: i64,
    file_id: i64,
    group_to: String,
    node_from: String,
    target_node: Option<String>,
    completed: bool,
    cancelled: bool,
    timestamp: DateTime<Utc>,
    n_requests: i32,
    transfer_started: Option<DateTime<Utc>>,
    transfer_completed: Option<DateTime<Utc>>,
}

impl From<CopyRequestRow> for CopyRequest {
    fn from(r: CopyRequestRow) -> Self {
        CopyRequest {
            id: r.id,
            file_id: r.file_id,
            group_to: r.group_to,
            node_from: r.node_from,
            target_node: r.target_node,
            completed: r.completed,
            cancelled: r.cancelled,
            timestamp: r.timestamp,
            n_requests: r.n_requests,
            transfer_started: r.transfer_started,
            transfer_completed: r.transfer_completed,
        }
    }
}

impl Pool {
    /// Connect to the Data Index, then refuse to continue if the
    /// schema version is not the one this daemon was built against
    /// (`spec.md` §6, exit code 4).
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("connecting to data index")?;

        let pool = Pool { pool };
        pool.check_schema_version().await?;
        Ok(pool)
    }

    async fn check_schema_version(&self) -> Result<()> {
        let found: i32 = sqlx::query_scalar("SELECT ver FROM dataindex_version")
            .fetch_one(&self.pool)
            .await
            .context("reading dataindex_version")?;

        if found != EXPECTED_SCHEMA_VERSION {
            return Err(IndexError::VersionMismatch { expected: EXPECTED_SCHEMA_VERSION, found }.into());
        }
        Ok(())
    }

    /// Nodes whose `daemon_host` matches this host and which are
    /// active. Availability also requires a readable, matching
    /// `ALPENHORN_NODE` marker — that check happens in [`crate::fs`],
    /// not here, since it touches the filesystem, not the Index.
    pub async fn find_active_nodes(&self, host: &str) -> Result<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as(
            "SELECT name, group_fk AS group_name, active, io_class, storage_type, root, \
             username, address, auto_import, auto_verify, avail_gb, min_avail_gb, \
             max_total_gb, daemon_host, io_config \
             FROM storage_node WHERE daemon_host = $1 AND active",
        )
        .bind(host)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Node::from).collect())
    }

    /// Groups with at least one member node available on `host`.
    pub async fn find_available_groups(&self, host: &str) -> Result<Vec<Group>> {
        let rows: Vec<GroupRow> = sqlx::query_as(
            "SELECT DISTINCT g.name, g.io_class \
             FROM storage_group g \
             JOIN storage_node n ON n.group_fk = g.name \
             WHERE n.daemon_host = $1 AND n.active",
        )
        .bind(host)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Group::from).collect())
    }

    pub async fn pending_import_requests(&self, node: &str, limit: i64) -> Result<Vec<ImportRequest>> {
        let rows: Vec<ImportRequestRow> = sqlx::query_as(
            "SELECT id, path, node_fk AS node_name, recurse, register_new, completed, timestamp \
             FROM importrequest WHERE node_fk = $1 AND NOT completed \
             ORDER BY timestamp ASC LIMIT $2",
        )
        .bind(node)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ImportRequest::from).collect())
    }

    pub async fn pending_copy_requests(&self, dest_group: &str, limit: i64) -> Result<Vec<CopyRequest>> {
        let rows: Vec<CopyRequestRow> = sqlx::query_as(
            "SELECT id, file_fk AS file_id, group_to_fk AS group_to, node_from_fk AS node_from, \
             node_to_fk AS target_node, completed, cancelled, timestamp, n_requests, \
             transfer_started, transfer_completed \
             FROM copyrequest \
             WHERE group_to_fk = $1 AND NOT completed AND NOT cancelled \
             ORDER BY timestamp ASC LIMIT $2",
        )
        .bind(dest_group)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CopyRequest::from).collect())
    }

    pub async fn suspect_copies(&self, node: &str, limit: i64) -> Result<Vec<FileCopy>> {
        self.copies_in_state(node, 'N', limit).await
    }

    pub async fn released_copies(&self, node: &str, limit: i64) -> Result<Vec<FileCopy>> {
        self.copies_in_state(node, 'Y', limit).await
    }

    async fn copies_in_state(&self, node: &str, state: char, limit: i64) -> Result<Vec<FileCopy>> {
        let rows: Vec<FileCopyRow> = sqlx::query_as(
            "SELECT id, file_fk AS file_id, node_fk AS node_name, state, has_file, size_b, \
             last_update, last_check \
             FROM filecopy WHERE node_fk = $1 AND state = $2 \
             ORDER BY last_update ASC LIMIT $3",
        )
        .bind(node)
        .bind(state.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FileCopy::from).collect())
    }

    /// Insert the Acquisition if it does not exist yet; acquisitions
    /// never change after creation (`spec.md` §3).
    pub async fn upsert_acquisition(&self, name: &str) -> Result<Acquisition, IndexError> {
        with_retry(|| async {
            sqlx::query("INSERT INTO acq (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
                .bind(name)
                .execute(&self.pool)
                .await
        })
        .await?;

        Ok(Acquisition { name: name.to_string() })
    }

    /// Insert the File row, or, if one already exists for
    /// `(acq, name)`, verify it agrees in size and hash. A disagreement
    /// is an error — existing registrations are never overwritten
    /// (`spec.md` §4.6 step 4).
    pub async fn upsert_file(
        &self,
        acq: &str,
        name: &str,
        size: i64,
        md5: &[u8; 16],
    ) -> Result<File, IndexError> {
        let existing: Option<FileRow> = sqlx::query_as(
            "SELECT id, acq_fk AS acq_name, name, size_b, md5sum, registered \
             FROM file WHERE acq_fk = $1 AND name = $2",
        )
        .bind(acq)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let file = File::try_from(row).map_err(IndexError::Other)?;
            if file.size_b != size || &file.md5sum != md5 {
                return Err(IndexError::Other(anyhow::anyhow!(
                    "file {}/{} already registered with different size/hash, refusing to overwrite",
                    acq,
                    name
                )));
            }
            return Ok(file);
        }

        let row: FileRow = with_retry(|| async {
            sqlx::query_as(
                "INSERT INTO file (acq_fk, name, size_b, md5sum, registered) \
                 VALUES ($1, $2, $3, $4, now()) \
                 ON CONFLICT (acq_fk, name) DO UPDATE SET acq_fk = EXCLUDED.acq_fk \
                 RETURNING id, acq_fk AS acq_name, name, size_b, md5sum, registered",
            )
            .bind(acq)
            .bind(name)
            .bind(size)
            .bind(&md5[..])
            .fetch_one(&self.pool)
            .await
        })
        .await?;

        File::try_from(row).map_err(IndexError::Other)
    }

    /// Find an existing `(file, node)` copy row, or create one in
    /// `Suspect` state (the natural "I just saw bytes, haven't
    /// verified them yet" starting point, §4.6).
    pub async fn find_or_create_copy(&self, file_id: i64, node: &str) -> Result<FileCopy, IndexError> {
        let row: FileCopyRow = with_retry(|| async {
            sqlx::query_as(
                "INSERT INTO filecopy (file_fk, node_fk, state, has_file, size_b, last_update) \
                 VALUES ($1, $2, 'N', true, 0, now()) \
                 ON CONFLICT (file_fk, node_fk) DO UPDATE SET file_fk = EXCLUDED.file_fk \
                 RETURNING id, file_fk AS file_id, node_fk AS node_name, state, has_file, \
                 size_b, last_update, last_check",
            )
            .bind(file_id)
            .bind(node)
            .fetch_one(&self.pool)
            .await
        })
        .await?;

        Ok(FileCopy::from(row))
    }

    pub async fn set_copy_state(
        &self,
        file_id: i64,
        node: &str,
        state: CopyState,
        size_on_node: i64,
    ) -> Result<(), IndexError> {
        with_retry(|| async {
            sqlx::query(
                "UPDATE filecopy SET state = $1, size_b = $2, has_file = $3, last_update = now() \
                 WHERE file_fk = $4 AND node_fk = $5",
            )
            .bind(state.as_char().to_string())
            .bind(size_on_node)
            .bind(!matches!(state, CopyState::Removed))
            .bind(file_id)
            .bind(node)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn record_last_check(&self, file_id: i64, node: &str, ts: DateTime<Utc>) -> Result<(), IndexError> {
        with_retry(|| async {
            sqlx::query("UPDATE filecopy SET last_check = $1 WHERE file_fk = $2 AND node_fk = $3")
                .bind(ts)
                .bind(file_id)
                .bind(node)
                .execute(&self.pool)
                .await
        })
        .await?;
        Ok(())
    }

    pub async fn mark_copy_missing(&self, file_id: i64, node: &str) -> Result<(), IndexError> {
        self.set_copy_state(file_id, node, CopyState::Missing, 0).await
    }

    /// Number of `Healthy` copies of `file_id` on `Archive` nodes,
    /// excluding `node` itself — the exact quantity the deletion guard
    /// (`spec.md` §3 invariant, Testable Property 1) must check.
    pub async fn archive_copy_count_excluding(&self, file_id: i64, node: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM filecopy fc \
             JOIN storage_node n ON n.name = fc.node_fk \
             WHERE fc.file_fk = $1 AND fc.node_fk <> $2 \
             AND fc.state = 'H' AND n.storage_type = 'A'",
        )
        .bind(file_id)
        .bind(node)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Current state of a `(file, node)` copy row, if one exists.
    /// Used for the pre-pull check (`spec.md` §4.7 step 1): a pull
    /// whose destination already holds a `Healthy` copy is satisfied
    /// without touching the transfer backend.
    pub async fn copy_state(&self, file_id: i64, node: &str) -> Result<Option<CopyState>, IndexError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM filecopy WHERE file_fk = $1 AND node_fk = $2")
                .bind(file_id)
                .bind(node)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(c,)| CopyState::from_char(c.chars().next().unwrap_or('-'))))
    }

    pub async fn complete_import_request(&self, id: i64) -> Result<(), IndexError> {
        with_retry(|| async {
            sqlx::query("UPDATE importrequest SET completed = true WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
        })
        .await?;
        Ok(())
    }

    pub async fn complete_copy_request(&self, id: i64) -> Result<(), IndexError> {
        with_retry(|| async {
            sqlx::query(
                "UPDATE copyrequest SET completed = true, transfer_completed = now() WHERE id = $1",
            )
            .bind(id)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn cancel_copy_request(&self, id: i64) -> Result<(), IndexError> {
        with_retry(|| async {
            sqlx::query("UPDATE copyrequest SET cancelled = true WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
        })
        .await?;
        Ok(())
    }

    pub async fn mark_transfer_started(&self, id: i64) -> Result<(), IndexError> {
        with_retry(|| async {
            sqlx::query("UPDATE copyrequest SET transfer_started = now() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
        })
        .await?;
        Ok(())
    }

    pub async fn bump_request_attempts(&self, id: i64) -> Result<i32, IndexError> {
        let n: i32 = with_retry(|| async {
            sqlx::query_scalar(
                "UPDATE copyrequest SET n_requests = n_requests + 1 WHERE id = $1 RETURNING n_requests",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
        })
        .await?;
        Ok(n)
    }

    /// Look up a node's root path and whether it is currently marked
    /// active; used by the transfer engine to resolve a source node's
    /// remote access parameters.
    pub async fn find_node(&self, name: &str) -> Result<Option<Node>, IndexError> {
        let row: Option<NodeRow> = sqlx::query_as(
            "SELECT name, group_fk AS group_name, active, io_class, storage_type, root, \
             username, address, auto_import, auto_verify, avail_gb, min_avail_gb, \
             max_total_gb, daemon_host, io_config \
             FROM storage_node WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Node::from))
    }

    /// Fetch a [`File`] by its primary key, for callers (verification,
    /// deletion, transfer) that only hold a `file_id` from a
    /// [`FileCopy`] row.
    pub async fn raw_file_by_id(&self, id: i64) -> Result<Option<File>, IndexError> {
        let row: Option<FileRow> = sqlx::query_as(
            "SELECT id, acq_fk AS acq_name, name, size_b, md5sum, registered FROM file WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(File::try_from).transpose().map_err(IndexError::Other)
    }

    pub fn raw(&self) -> &PgPool {
        &self.pool
    }
}
