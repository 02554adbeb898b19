//! Identities and their embeddings in one SQLite file.
//!
//! Embeddings are stored as little-endian `f32` blobs. Every write that
//! changes the identity list republishes it on a `watch` channel, which backs
//! [`IdentityStore::stream_identities`].

use crate::migrations::{self, backend};
use angler_core::{Embedding, EmbeddingRecord, IdentityId, IdentityRecord, IdentityStore, StoreError};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    identities_tx: watch::Sender<Vec<IdentityRecord>>,
}

fn row_to_identity(row: &Row) -> rusqlite::Result<IdentityRecord> {
    let count: i64 = row.get("declared_image_count")?;
    Ok(IdentityRecord {
        id: IdentityId(row.get("id")?),
        name: row.get("name")?,
        declared_image_count: count.max(0) as usize,
        created_at: row.get("created_at")?,
    })
}

fn row_to_embedding(row: &Row) -> rusqlite::Result<EmbeddingRecord> {
    let blob: Vec<u8> = row.get("vector")?;
    Ok(EmbeddingRecord {
        identity_id: IdentityId(row.get("identity_id")?),
        identity_name: row.get("identity_name")?,
        embedding: Embedding {
            values: blob_to_vector(&blob),
            model_version: row.get("model_version")?,
        },
    })
}

fn vector_to_blob(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(|e| backend("open database", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| backend("enable WAL", e))?;
        tracing::info!(path = %path.display(), "opened identity store");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| backend("open in-memory database", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        migrations::run_migrations(&mut conn)?;
        let identities = query_identities(&conn)?;
        let (identities_tx, _) = watch::channel(identities);
        Ok(Self {
            conn: Mutex::new(conn),
            identities_tx,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("connection lock poisoned".into()))
    }

    /// Republish the identity list after a committed write. A failed re-read
    /// leaves the previous list in place; the write itself still stands.
    fn publish(&self, conn: &Connection) {
        match query_identities(conn) {
            Ok(identities) => {
                self.identities_tx.send_replace(identities);
            }
            Err(error) => tracing::warn!(%error, "identity list not republished"),
        }
    }

    /// Every identity, oldest first.
    pub fn list_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        query_identities(&*self.conn()?)
    }

    pub fn get_identity(&self, id: &IdentityId) -> Result<Option<IdentityRecord>, StoreError> {
        self.conn()?
            .query_row(
                "SELECT id, name, declared_image_count, created_at FROM identities WHERE id = ?1",
                params![id.0],
                row_to_identity,
            )
            .optional()
            .map_err(|e| backend("get identity", e))
    }

    /// Embeddings of one identity in insertion order.
    pub fn embeddings_for(&self, id: &IdentityId) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT identity_id, identity_name, vector, model_version
                 FROM embeddings WHERE identity_id = ?1 ORDER BY id ASC",
            )
            .map_err(|e| backend("prepare embeddings query", e))?;
        let rows = stmt
            .query_map(params![id.0], row_to_embedding)
            .map_err(|e| backend("query embeddings", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| backend("read embedding row", e))
    }
}

fn query_identities(conn: &Connection) -> Result<Vec<IdentityRecord>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT id, name, declared_image_count, created_at FROM identities ORDER BY rowid ASC")
        .map_err(|e| backend("prepare identities query", e))?;
    let rows = stmt
        .query_map([], row_to_identity)
        .map_err(|e| backend("query identities", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| backend("read identity row", e))
}

impl IdentityStore for SqliteStore {
    fn create_identity(&self, name: &str, declared_count: usize) -> Result<IdentityRecord, StoreError> {
        let record = IdentityRecord {
            id: IdentityId(uuid::Uuid::new_v4().to_string()),
            name: name.to_string(),
            declared_image_count: declared_count,
            created_at: Utc::now().to_rfc3339(),
        };

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO identities (id, name, declared_image_count, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![record.id.0, record.name, declared_count as i64, record.created_at],
        )
        .map_err(|e| backend("insert identity", e))?;
        self.publish(&conn);

        tracing::debug!(identity = %record.id, name = %record.name, "identity created");
        Ok(record)
    }

    fn delete_identity(&self, id: &IdentityId) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let deleted = conn
            .execute("DELETE FROM identities WHERE id = ?1", params![id.0])
            .map_err(|e| backend("delete identity", e))?;
        if deleted == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        self.publish(&conn);
        Ok(())
    }

    fn append_embedding(&self, id: &IdentityId, name: &str, embedding: &Embedding) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO embeddings (identity_id, identity_name, dim, vector, model_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.0,
                    name,
                    embedding.dim() as i64,
                    vector_to_blob(&embedding.values),
                    embedding.model_version,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| backend("insert embedding", e))?;
        Ok(())
    }

    fn remove_embeddings(&self, id: &IdentityId) -> Result<usize, StoreError> {
        self.conn()?
            .execute("DELETE FROM embeddings WHERE identity_id = ?1", params![id.0])
            .map_err(|e| backend("delete embeddings", e))
    }

    fn count_identities(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))
            .map_err(|e| backend("count identities", e))?;
        Ok(count.max(0) as usize)
    }

    fn stream_identities(&self) -> watch::Receiver<Vec<IdentityRecord>> {
        self.identities_tx.subscribe()
    }
}
