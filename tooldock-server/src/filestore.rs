// Copyright 2025 Tooldock (https://github.com/tooldock)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Content-addressed file store with TTL and background GC.
//!
//! Metadata lives in `{root}/files.db` (SQLite, WAL); blobs are
//! UUID-named files with no extension under `{root}/blobs/`. Invariant:
//! every row has exactly one blob whose digest matches the row's, until
//! delete or GC. In-flight path holders may briefly see a blob whose row
//! was just deleted and must tolerate not-found on open.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sweep cadence for expired rows.
const GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Metadata for a stored file.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub sha256: String,
    pub path: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub expires_at: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

pub struct Store {
    conn: Mutex<Connection>,
    blob_dir: PathBuf,
    gc_token: CancellationToken,
}

impl Store {
    /// Open or create a store at the given base directory.
    pub fn new(base_dir: &Path) -> Result<Self, StoreError> {
        let blob_dir = base_dir.join("blobs");
        std::fs::create_dir_all(&blob_dir)?;

        let conn = Connection::open(base_dir.join("files.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                sha256 TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_files_expires ON files(expires_at) WHERE expires_at > 0;
            CREATE INDEX IF NOT EXISTS idx_files_sha256 ON files(sha256);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            blob_dir,
            gc_token: CancellationToken::new(),
        })
    }

    /// Start the background garbage collector.
    pub fn spawn_gc(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = self;
        let token = store.gc_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(GC_INTERVAL) => {}
                }
                let swept = store.run_gc_once();
                if swept > 0 {
                    debug!("GC removed {} expired files", swept);
                }
            }
        })
    }

    /// Stop the garbage collector.
    pub fn close(&self) {
        self.gc_token.cancel();
    }

    /// Copy a file into the store, streaming through a SHA-256
    /// computation, and insert its row. `ttl` of 0 means permanent;
    /// positive values are seconds until expiration.
    pub fn import(&self, source: &Path, name: &str, ttl: i64) -> Result<FileInfo, StoreError> {
        let conn = self.conn.lock();

        let mut src = std::fs::File::open(source)?;
        let id = uuid::Uuid::new_v4().to_string();
        let blob_path = self.blob_dir.join(&id);

        let result = (|| -> Result<FileInfo, StoreError> {
            let mut dst = std::fs::File::create(&blob_path)?;
            let mut hasher = Sha256::new();
            let mut buf = [0u8; 8192];
            let mut size: i64 = 0;
            loop {
                let n = src.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                dst.write_all(&buf[..n])?;
                size += n as i64;
            }
            let hash = hex::encode(hasher.finalize());

            let now = unix_now();
            let expires_at = if ttl > 0 { now + ttl } else { 0 };

            let name = if name.is_empty() {
                source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| id.clone())
            } else {
                name.to_string()
            };

            conn.execute(
                "INSERT INTO files (id, name, size, sha256, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, name, size, hash, now, expires_at],
            )?;

            Ok(FileInfo {
                id: id.clone(),
                name,
                size,
                sha256: hash,
                path: blob_path.display().to_string(),
                created_at: now,
                expires_at,
            })
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&blob_path);
        }
        result
    }

    /// Absolute blob path for a stored file. Only for trusted in-process
    /// callers; HTTP callers go through the content route.
    pub fn get_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM files WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        match exists {
            Some(_) => Ok(self.blob_dir.join(id)),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    pub fn info(&self, id: &str) -> Result<FileInfo, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, size, sha256, created_at, expires_at FROM files WHERE id = ?1",
            params![id],
            |row| self.row_to_info(row),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// List files ordered by creation descending. By default, expired
    /// rows are excluded.
    pub fn list(&self, include_expired: bool) -> Result<Vec<FileInfo>, StoreError> {
        let conn = self.conn.lock();
        let mut out = Vec::new();

        if include_expired {
            let mut stmt = conn.prepare(
                "SELECT id, name, size, sha256, created_at, expires_at FROM files
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([], |row| self.row_to_info(row))?;
            for row in rows {
                out.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, name, size, sha256, created_at, expires_at FROM files
                 WHERE expires_at = 0 OR expires_at > ?1
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![unix_now()], |row| self.row_to_info(row))?;
            for row in rows {
                out.push(row?);
            }
        }

        Ok(out)
    }

    fn row_to_info(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<FileInfo> {
        let id: String = row.get(0)?;
        Ok(FileInfo {
            path: self.blob_dir.join(&id).display().to_string(),
            id,
            name: row.get(1)?,
            size: row.get(2)?,
            sha256: row.get(3)?,
            created_at: row.get(4)?,
            expires_at: row.get(5)?,
        })
    }

    /// Update the display name.
    pub fn rename(&self, id: &str, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE files SET name = ?1 WHERE id = ?2",
            params![name, id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Reset the TTL. `ttl` of 0 marks the file permanent.
    pub fn set_ttl(&self, id: &str, ttl: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let expires_at = if ttl > 0 { unix_now() + ttl } else { 0 };
        let updated = conn.execute(
            "UPDATE files SET expires_at = ?1 WHERE id = ?2",
            params![expires_at, id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Remove the row, then the blob. A missing blob is tolerated.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        self.delete_locked(&conn, id)
    }

    fn delete_locked(&self, conn: &Connection, id: &str) -> Result<(), StoreError> {
        let deleted = conn.execute("DELETE FROM files WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let _ = std::fs::remove_file(self.blob_dir.join(id));
        Ok(())
    }

    /// Sweep rows with `0 < expires_at <= now`. Integrity failures are
    /// tolerated; the sweep is best-effort. Returns how many rows went.
    pub fn run_gc_once(&self) -> usize {
        let conn = self.conn.lock();

        let expired: Vec<String> = {
            let Ok(mut stmt) =
                conn.prepare("SELECT id FROM files WHERE expires_at > 0 AND expires_at <= ?1")
            else {
                return 0;
            };
            let result = match stmt.query_map(params![unix_now()], |row| row.get::<_, String>(0))
            {
                Ok(rows) => rows.flatten().collect(),
                Err(e) => {
                    warn!("GC query failed: {}", e);
                    return 0;
                }
            };
            result
        };

        let mut swept = 0;
        for id in expired {
            if self.delete_locked(&conn, &id).is_ok() {
                swept += 1;
            }
        }
        swept
    }

    /// Row count and total stored bytes.
    pub fn stats(&self) -> Result<(i64, i64), StoreError> {
        let conn = self.conn.lock();
        let stats = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM files",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(stats)
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
