//! C15 — applies embedded `.sql` scripts in lexicographic order, recording
//! each in a journal table so a script never runs twice. Mirrors the
//! teacher's `app_storage::migrations::run_migrations_at`.

use std::path::Path;

use include_dir::{include_dir, Dir};
use rusqlite::{Connection, OptionalExtension};

use knowbase_core::error::{KbError, KbResult};

static MIGRATIONS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/src/migrations");

fn to_storage_err(context: &str) -> impl Fn(rusqlite::Error) -> KbError + '_ {
    move |e| KbError::storage(format!("{context}: {e}"))
}

fn ensure_journal(conn: &Connection) -> KbResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migration (name TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
        [],
    )
    .map_err(to_storage_err("failed to create migration journal"))?;
    Ok(())
}

fn is_applied(conn: &Connection, name: &str) -> KbResult<bool> {
    conn.query_row(
        "SELECT 1 FROM schema_migration WHERE name = ?1",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map_err(to_storage_err("failed to query migration journal"))
    .map(|row| row.is_some())
}

fn run_migrations(conn: &mut Connection) -> KbResult<()> {
    conn.pragma_update(None, "foreign_keys", 1)
        .map_err(to_storage_err("failed to enable foreign keys"))?;
    ensure_journal(conn)?;

    let mut scripts: Vec<_> = MIGRATIONS.files().collect();
    scripts.sort_by_key(|f| f.path().to_path_buf());

    for script in scripts {
        let name = script
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| KbError::storage("migration script has no file name"))?;

        if is_applied(conn, name)? {
            continue;
        }

        let sql = script
            .contents_utf8()
            .ok_or_else(|| KbError::storage(format!("migration {name} is not valid utf-8")))?;

        tracing::debug!(migration = name, "applying schema migration");
        let tx = conn
            .transaction()
            .map_err(to_storage_err("failed to open migration transaction"))?;
        tx.execute_batch(sql)
            .map_err(|e| KbError::storage(format!("migration {name} failed: {e}")))?;
        tx.execute(
            "INSERT INTO schema_migration (name, applied_at) VALUES (?1, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
            [name],
        )
        .map_err(to_storage_err("failed to record migration"))?;
        tx.commit()
            .map_err(to_storage_err("failed to commit migration"))?;
    }

    Ok(())
}

pub fn run_migrations_at(db_path: &Path) -> KbResult<Connection> {
    let mut conn = Connection::open(db_path)
        .map_err(|e| KbError::storage(format!("failed to open database at {}: {e}", db_path.display())))?;
    run_migrations(&mut conn)?;
    Ok(conn)
}

pub fn run_migrations_in_memory() -> KbResult<Connection> {
    let mut conn = Connection::open_in_memory()
        .map_err(|e| KbError::storage(format!("failed to open in-memory database: {e}")))?;
    run_migrations(&mut conn)?;
    Ok(conn)
}
