use parking_lot::Mutex;
use rusqlite::{Connection, params};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::embed::cosine_similarity;
use crate::error::{Error, Result};

use super::{ContentPoint, Payload, PayloadPatch, PointFilter, PointId, ScoredPoint, ScrollPage, VectorStore};

const DB_FILE: &str = "points.db";

/// Local vector-store backend: one SQLite file per repository under
/// `.code-indexer/index/`. Vectors are little-endian f32 blobs; k-NN is
/// brute-force cosine over the filtered candidate set, which is adequate at
/// repo scale. Access is serialized through an internal mutex.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteVectorStore {
    /// Open (or create) the store, running migrations.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::BackendUnavailable(format!("creating {}: {e}", dir.display())))?;
        let db_path = dir.join(DB_FILE);
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::BackendUnavailable(format!("opening {}: {e}", db_path.display())))?;
        let store = Self { conn: Mutex::new(conn), db_path };
        store.create_collection()?;
        Ok(store)
    }

    /// Open only if the database file already exists; read paths use this to
    /// avoid creating empty stores as a side effect.
    pub fn open_if_exists(dir: &Path) -> Result<Option<Self>> {
        if !dir.join(DB_FILE).exists() {
            return Ok(None);
        }
        Ok(Some(Self::open(dir)?))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn row_to_point(id: &str, vector: &[u8], payload: &str) -> Result<ContentPoint> {
        let id = Uuid::parse_str(id).map_err(Error::internal)?;
        let payload: Payload = serde_json::from_str(payload)?;
        Ok(ContentPoint { id, vector: blob_to_vec(vector), payload })
    }
}

fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Equality filters compile to SQL; the `hidden_branches` membership tests
/// are evaluated on the decoded payload.
fn sql_clause(filter: &PointFilter) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();
    if let Some(p) = &filter.file_path {
        clauses.push("file_path = ?");
        args.push(p.clone());
    }
    if let Some(l) = &filter.language {
        clauses.push("language = ?");
        args.push(l.clone());
    }
    if let Some(c) = &filter.commit_ref {
        clauses.push("commit_ref = ?");
        args.push(c.clone());
    }
    let sql = if clauses.is_empty() { String::new() } else { format!(" AND {}", clauses.join(" AND ")) };
    (sql, args)
}

impl VectorStore for SqliteVectorStore {
    fn upsert_batch(&self, points: &[ContentPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        let failed = || Error::StoreWriteFailed { failed_ids: points.iter().map(|p| p.id).collect() };

        let mut rows = Vec::with_capacity(points.len());
        for p in points {
            let payload = serde_json::to_string(&p.payload).map_err(|_| failed())?;
            rows.push((p.id.to_string(), p, payload));
        }

        conn.execute_batch("BEGIN").map_err(|_| failed())?;
        let result = (|| -> rusqlite::Result<()> {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO points (id, file_path, commit_ref, language, vector, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO NOTHING",
            )?;
            for (id, p, payload) in &rows {
                stmt.execute(params![
                    id,
                    p.payload.file_path,
                    p.payload.commit_ref,
                    p.payload.language,
                    vec_to_blob(&p.vector),
                    payload,
                ])?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT").map_err(|_| failed())?;
                Ok(())
            }
            Err(_) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(failed())
            }
        }
    }

    fn get(&self, id: PointId) -> Result<Option<ContentPoint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT id, vector, payload FROM points WHERE id = ?1")?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => {
                let id: String = row.get(0)?;
                let vector: Vec<u8> = row.get(1)?;
                let payload: String = row.get(2)?;
                Ok(Some(Self::row_to_point(&id, &vector, &payload)?))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, ids: &[PointId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN")?;
        {
            let mut stmt = conn.prepare_cached("DELETE FROM points WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![id.to_string()])?;
            }
        }
        conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn patch_payload(&self, id: PointId, patch: &PayloadPatch) -> Result<()> {
        let conn = self.conn.lock();
        let raw: Option<String> = {
            let mut stmt = conn.prepare_cached("SELECT payload FROM points WHERE id = ?1")?;
            let mut rows = stmt.query(params![id.to_string()])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        let Some(raw) = raw else {
            return Ok(());
        };
        let mut payload: Payload = serde_json::from_str(&raw)?;
        patch.apply(&mut payload);
        conn.execute(
            "UPDATE points SET payload = ?1 WHERE id = ?2",
            params![serde_json::to_string(&payload)?, id.to_string()],
        )?;
        Ok(())
    }

    fn scroll(&self, filter: &PointFilter, cursor: Option<u64>, limit: usize) -> Result<ScrollPage> {
        let conn = self.conn.lock();
        let (clause, args) = sql_clause(filter);
        let sql = format!(
            "SELECT rowid, id, vector, payload FROM points WHERE rowid > ?{clause} ORDER BY rowid LIMIT ?"
        );
        let mut stmt = conn.prepare(&sql)?;

        // Bare `?` placeholders bind left to right: cursor, filter args, limit.
        let cursor_arg = cursor.unwrap_or(0) as i64;
        let limit_arg = limit as i64;
        let mut bound: Vec<&dyn rusqlite::ToSql> = vec![&cursor_arg];
        for a in &args {
            bound.push(a);
        }
        bound.push(&limit_arg);
        let mut rows = stmt.query(&bound[..])?;

        let mut points = Vec::new();
        let mut last_rowid = None;
        let mut scanned = 0usize;
        while let Some(row) = rows.next()? {
            scanned += 1;
            let rowid: i64 = row.get(0)?;
            last_rowid = Some(rowid as u64);
            let id: String = row.get(1)?;
            let vector: Vec<u8> = row.get(2)?;
            let payload: String = row.get(3)?;
            let point = Self::row_to_point(&id, &vector, &payload)?;
            if filter.matches(&point.payload) {
                points.push(point);
            }
        }
        let next_cursor = if scanned < limit { None } else { last_rowid };
        Ok(ScrollPage { points, next_cursor })
    }

    fn search_knn(&self, vector: &[f32], k: usize, filter: &PointFilter) -> Result<Vec<ScoredPoint>> {
        let conn = self.conn.lock();
        let (clause, args) = sql_clause(filter);
        let sql = format!("SELECT id, vector, payload FROM points WHERE 1=1{clause}");
        let mut stmt = conn.prepare(&sql)?;
        let bound: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a as &dyn rusqlite::ToSql).collect();
        let mut rows = stmt.query(&bound[..])?;

        let mut scored = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let payload: String = row.get(2)?;
            let point = Self::row_to_point(&id, &blob, &payload)?;
            if !filter.matches(&point.payload) {
                continue;
            }
            let score = cosine_similarity(vector, &point.vector);
            scored.push(ScoredPoint { point, score });
        }
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM points", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    fn create_collection(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS points (
                id TEXT PRIMARY KEY,
                file_path TEXT NOT NULL,
                commit_ref TEXT NOT NULL,
                language TEXT,
                vector BLOB NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_points_file_path ON points(file_path);
            CREATE INDEX IF NOT EXISTS idx_points_commit_ref ON points(commit_ref);",
        )?;
        Ok(())
    }

    fn drop_collection(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("DELETE FROM points")?;
        Ok(())
    }
}

/// Distinct file paths with at least one visible point in `branch`; used by
/// status reporting.
impl SqliteVectorStore {
    pub fn visible_paths(&self, branch: &str) -> Result<HashSet<String>> {
        let mut paths = HashSet::new();
        super::scroll_all(self, &PointFilter::visible_in(branch), 512, |p| {
            paths.insert(p.payload.file_path.clone());
            Ok(())
        })?;
        Ok(paths)
    }
}
