use angler_core::StoreError;
use rusqlite::{Connection, Transaction};

const CURRENT_SCHEMA_VERSION: i32 = 1;

pub(crate) fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| backend("read user_version", e))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::Backend(format!(
            "database version ({version}) is newer than supported schema ({CURRENT_SCHEMA_VERSION})"
        )));
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction().map_err(|e| backend("open migration transaction", e))?;
    while version < CURRENT_SCHEMA_VERSION {
        let next = version + 1;
        apply_migration(&tx, next)?;
        tracing::info!(version = next, "applied schema migration");
        version = next;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .map_err(|e| backend("update user_version", e))?;
    tx.commit().map_err(|e| backend("commit migrations", e))?;

    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<(), StoreError> {
    let sql = match version {
        1 => include_str!("schemas/schema_v1.sql"),
        other => {
            return Err(StoreError::Backend(format!("no migration for schema version {other}")));
        }
    };
    tx.execute_batch(sql)
        .map_err(|e| backend(&format!("migration to version {version}"), e))
}

pub(crate) fn backend(what: &str, e: rusqlite::Error) -> StoreError {
    StoreError::Backend(format!("{what}: {e}"))
}
