//! Library / user / permission persistence, grounded the same way as
//! [`crate::knowledge_store::SqliteKnowledgeStore`].

use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use knowbase_core::error::{KbError, KbResult};
use knowbase_core::model::{Library, LibraryFile, LibraryPermission, PermissionKind, User};
use knowbase_core::ports::LibraryStore;

pub struct SqliteLibraryStore {
    conn: Mutex<Connection>,
}

impl SqliteLibraryStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

fn to_storage_err(context: &'static str) -> impl Fn(rusqlite::Error) -> KbError {
    move |e| KbError::storage(format!("{context}: {e}"))
}

fn parse_uuid(raw: &str) -> KbResult<Uuid> {
    Uuid::from_str(raw).map_err(|e| KbError::integrity(format!("invalid uuid '{raw}': {e}")))
}

fn parse_timestamp(raw: &str) -> KbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KbError::integrity(format!("invalid timestamp '{raw}': {e}")))
}

fn permission_to_i64(kind: PermissionKind) -> i64 {
    match kind {
        PermissionKind::None => 0,
        PermissionKind::Read => 1,
        PermissionKind::Write => 2,
        PermissionKind::Admin => 3,
    }
}

fn permission_from_i64(value: i64) -> KbResult<PermissionKind> {
    match value {
        0 => Ok(PermissionKind::None),
        1 => Ok(PermissionKind::Read),
        2 => Ok(PermissionKind::Write),
        3 => Ok(PermissionKind::Admin),
        other => Err(KbError::integrity(format!("unknown permission kind {other}"))),
    }
}

impl LibraryStore for SqliteLibraryStore {
    fn get_user(&self, id: Uuid) -> KbResult<Option<User>> {
        let conn = self.conn.lock().expect("library store mutex poisoned");
        let raw = conn
            .query_row(
                "SELECT id, email, password_hash, first_name, last_name, is_active,
                        last_login_at, created_at, updated_at
                 FROM user WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()
            .map_err(to_storage_err("failed to load user"))?;

        let Some((id, email, password_hash, first_name, last_name, active, last_login_at, created_at, updated_at)) = raw else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare("SELECT role FROM user_role WHERE user_id = ?1")
            .map_err(to_storage_err("failed to prepare role query"))?;
        let roles = stmt
            .query_map(params![id.clone()], |row| row.get::<_, String>(0))
            .map_err(to_storage_err("failed to query roles"))?
            .collect::<rusqlite::Result<_>>()
            .map_err(to_storage_err("failed to read role rows"))?;

        Ok(Some(User {
            id: parse_uuid(&id)?,
            email,
            password_hash,
            first_name,
            last_name,
            active,
            last_login_at: last_login_at.map(|s| parse_timestamp(&s)).transpose()?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            roles,
        }))
    }

    fn add_library(&self, library: &Library) -> KbResult<()> {
        let conn = self.conn.lock().expect("library store mutex poisoned");
        conn.execute(
            "INSERT INTO library (id, name, description, owner_id, is_public, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                library.id.to_string(),
                library.name,
                library.description,
                library.owner_id.to_string(),
                library.is_public,
                library.created_at.to_rfc3339(),
                library.updated_at.to_rfc3339(),
            ],
        )
        .map_err(to_storage_err("failed to insert library"))?;
        Ok(())
    }

    fn get_library(&self, id: Uuid) -> KbResult<Option<Library>> {
        let conn = self.conn.lock().expect("library store mutex poisoned");
        conn.query_row(
            "SELECT id, name, description, owner_id, is_public, created_at, updated_at
             FROM library WHERE id = ?1",
            params![id.to_string()],
            library_from_row,
        )
        .optional()
        .map_err(to_storage_err("failed to load library"))?
        .transpose()
    }

    fn delete_library(&self, id: Uuid) -> KbResult<()> {
        let mut conn = self.conn.lock().expect("library store mutex poisoned");
        let tx = conn
            .transaction()
            .map_err(to_storage_err("failed to open delete-library transaction"))?;
        let key = id.to_string();
        tx.execute(
            "DELETE FROM library_permission WHERE library_id = ?1",
            params![key],
        )
        .map_err(to_storage_err("failed to delete permissions"))?;
        tx.execute(
            "DELETE FROM library_file WHERE library_id = ?1",
            params![key],
        )
        .map_err(to_storage_err("failed to delete library files"))?;
        tx.execute("DELETE FROM library WHERE id = ?1", params![key])
            .map_err(to_storage_err("failed to delete library"))?;
        tx.commit()
            .map_err(to_storage_err("failed to commit library deletion"))?;
        Ok(())
    }

    fn get_permission(
        &self,
        library_id: Uuid,
        user_id: Uuid,
    ) -> KbResult<Option<LibraryPermission>> {
        let conn = self.conn.lock().expect("library store mutex poisoned");
        conn.query_row(
            "SELECT id, library_id, user_id, kind, granted_by_user_id, created_at
             FROM library_permission WHERE library_id = ?1 AND user_id = ?2",
            params![library_id.to_string(), user_id.to_string()],
            permission_from_row,
        )
        .optional()
        .map_err(to_storage_err("failed to load permission"))?
        .transpose()
    }

    fn upsert_permission(&self, permission: &LibraryPermission) -> KbResult<()> {
        let conn = self.conn.lock().expect("library store mutex poisoned");
        conn.execute(
            "INSERT INTO library_permission (id, library_id, user_id, kind, granted_by_user_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(library_id, user_id) DO UPDATE SET
                kind = excluded.kind, granted_by_user_id = excluded.granted_by_user_id",
            params![
                permission.id.to_string(),
                permission.library_id.to_string(),
                permission.user_id.to_string(),
                permission_to_i64(permission.kind),
                permission.granted_by_user_id.to_string(),
                permission.created_at.to_rfc3339(),
            ],
        )
        .map_err(to_storage_err("failed to upsert permission"))?;
        Ok(())
    }

    fn revoke_permission(&self, library_id: Uuid, user_id: Uuid) -> KbResult<()> {
        let conn = self.conn.lock().expect("library store mutex poisoned");
        conn.execute(
            "DELETE FROM library_permission WHERE library_id = ?1 AND user_id = ?2",
            params![library_id.to_string(), user_id.to_string()],
        )
        .map_err(to_storage_err("failed to revoke permission"))?;
        Ok(())
    }

    fn add_library_file(&self, file: &LibraryFile) -> KbResult<()> {
        let conn = self.conn.lock().expect("library store mutex poisoned");
        conn.execute(
            "INSERT INTO library_file (id, library_id, original_file_name, content_type,
                                       size_in_bytes, relative_path, hash, uploaded_by_user_id,
                                       uploaded_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                file.id.to_string(),
                file.library_id.to_string(),
                file.original_file_name,
                file.content_type,
                file.size_in_bytes,
                file.relative_path,
                file.hash,
                file.uploaded_by_user_id.to_string(),
                file.uploaded_at.to_rfc3339(),
                file.created_at.to_rfc3339(),
                file.updated_at.to_rfc3339(),
            ],
        )
        .map_err(to_storage_err("failed to insert library_file"))?;
        Ok(())
    }

    fn get_library_file(&self, id: Uuid) -> KbResult<Option<LibraryFile>> {
        let conn = self.conn.lock().expect("library store mutex poisoned");
        conn.query_row(
            "SELECT id, library_id, original_file_name, content_type, size_in_bytes,
                    relative_path, hash, uploaded_by_user_id, uploaded_at, created_at, updated_at
             FROM library_file WHERE id = ?1",
            params![id.to_string()],
            library_file_from_row,
        )
        .optional()
        .map_err(to_storage_err("failed to load library_file"))?
        .transpose()
    }

    fn list_library_files(&self, library_id: Uuid) -> KbResult<Vec<LibraryFile>> {
        let conn = self.conn.lock().expect("library store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, library_id, original_file_name, content_type, size_in_bytes,
                        relative_path, hash, uploaded_by_user_id, uploaded_at, created_at, updated_at
                 FROM library_file WHERE library_id = ?1 ORDER BY uploaded_at ASC",
            )
            .map_err(to_storage_err("failed to prepare library_file listing"))?;
        let rows = stmt
            .query_map(params![library_id.to_string()], library_file_from_row)
            .map_err(to_storage_err("failed to query library files"))?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row.map_err(to_storage_err("failed to read library_file row"))??);
        }
        Ok(files)
    }

    fn delete_library_file(&self, id: Uuid) -> KbResult<()> {
        let conn = self.conn.lock().expect("library store mutex poisoned");
        conn.execute(
            "DELETE FROM library_file WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(to_storage_err("failed to delete library_file"))?;
        Ok(())
    }
}

fn library_from_row(row: &Row<'_>) -> rusqlite::Result<KbResult<Library>> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let description: Option<String> = row.get(2)?;
    let owner_id: String = row.get(3)?;
    let is_public: bool = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok((|| {
        Ok(Library {
            id: parse_uuid(&id)?,
            name,
            description,
            owner_id: parse_uuid(&owner_id)?,
            is_public,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    })())
}

fn permission_from_row(row: &Row<'_>) -> rusqlite::Result<KbResult<LibraryPermission>> {
    let id: String = row.get(0)?;
    let library_id: String = row.get(1)?;
    let user_id: String = row.get(2)?;
    let kind: i64 = row.get(3)?;
    let granted_by_user_id: String = row.get(4)?;
    let created_at: String = row.get(5)?;

    Ok((|| {
        Ok(LibraryPermission {
            id: parse_uuid(&id)?,
            library_id: parse_uuid(&library_id)?,
            user_id: parse_uuid(&user_id)?,
            kind: permission_from_i64(kind)?,
            granted_by_user_id: parse_uuid(&granted_by_user_id)?,
            created_at: parse_timestamp(&created_at)?,
        })
    })())
}

fn library_file_from_row(row: &Row<'_>) -> rusqlite::Result<KbResult<LibraryFile>> {
    let id: String = row.get(0)?;
    let library_id: String = row.get(1)?;
    let original_file_name: String = row.get(2)?;
    let content_type: String = row.get(3)?;
    let size_in_bytes: i64 = row.get(4)?;
    let relative_path: String = row.get(5)?;
    let hash: Vec<u8> = row.get(6)?;
    let uploaded_by_user_id: String = row.get(7)?;
    let uploaded_at: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok((|| {
        Ok(LibraryFile {
            id: parse_uuid(&id)?,
            library_id: parse_uuid(&library_id)?,
            original_file_name,
            content_type,
            size_in_bytes: size_in_bytes as u64,
            relative_path,
            hash,
            uploaded_by_user_id: parse_uuid(&uploaded_by_user_id)?,
            uploaded_at: parse_timestamp(&uploaded_at)?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    })())
}
