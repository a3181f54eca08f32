//! C8 — sqlite-backed system of record for knowledge files, sections and
//! chunks. Grounded on the teacher's `app-storage/src/vault.rs` query
//! style (named params, `.optional()`, `Context`-free error mapping here
//! replaced by `KbError::storage`).

use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use knowbase_core::error::{KbError, KbResult};
use knowbase_core::model::{
    KnowledgeFile, KnowledgeFileChunk, KnowledgeFileSection, KnowledgeFileStatus,
};
use knowbase_core::ports::KnowledgeStore;

use crate::codec::{decode_embedding, encode_embedding};

pub struct SqliteKnowledgeStore {
    conn: Mutex<Connection>,
}

impl SqliteKnowledgeStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

fn status_to_i64(status: KnowledgeFileStatus) -> i64 {
    match status {
        KnowledgeFileStatus::Pending => 0,
        KnowledgeFileStatus::Indexing => 1,
        KnowledgeFileStatus::Indexed => 2,
        KnowledgeFileStatus::Failed => 3,
    }
}

fn status_from_i64(value: i64) -> KbResult<KnowledgeFileStatus> {
    match value {
        0 => Ok(KnowledgeFileStatus::Pending),
        1 => Ok(KnowledgeFileStatus::Indexing),
        2 => Ok(KnowledgeFileStatus::Indexed),
        3 => Ok(KnowledgeFileStatus::Failed),
        other => Err(KbError::integrity(format!("unknown knowledge_file status {other}"))),
    }
}

fn parse_uuid(raw: &str) -> KbResult<Uuid> {
    Uuid::from_str(raw).map_err(|e| KbError::integrity(format!("invalid uuid '{raw}': {e}")))
}

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<(String, Vec<u8>, Option<String>, i64, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn to_file(raw: (String, Vec<u8>, Option<String>, i64, String)) -> KbResult<KnowledgeFile> {
    let (id, hash, processed_at, status, name) = raw;
    Ok(KnowledgeFile {
        id: parse_uuid(&id)?,
        name,
        hash,
        processed_at: processed_at
            .map(|s| {
                chrono::DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .map_err(|e| KbError::integrity(format!("invalid processed_at timestamp: {e}")))
            })
            .transpose()?,
        status: status_from_i64(status)?,
    })
}

fn to_storage_err(context: &'static str) -> impl Fn(rusqlite::Error) -> KbError {
    move |e| KbError::storage(format!("{context}: {e}"))
}

impl KnowledgeStore for SqliteKnowledgeStore {
    fn add_file(&self, file: &KnowledgeFile) -> KbResult<()> {
        let conn = self.conn.lock().expect("knowledge store mutex poisoned");
        conn.execute(
            "INSERT INTO knowledge_file (id, name, hash, processed_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, hash = excluded.hash,
                processed_at = excluded.processed_at, status = excluded.status",
            params![
                file.id.to_string(),
                file.name,
                file.hash,
                file.processed_at.map(|t| t.to_rfc3339()),
                status_to_i64(file.status),
            ],
        )
        .map_err(to_storage_err("failed to upsert knowledge_file"))?;
        Ok(())
    }

    fn get_file_by_id(&self, id: Uuid) -> KbResult<Option<KnowledgeFile>> {
        let conn = self.conn.lock().expect("knowledge store mutex poisoned");
        let raw = conn
            .query_row(
                "SELECT id, hash, processed_at, status, name FROM knowledge_file WHERE id = ?1",
                params![id.to_string()],
                row_to_file,
            )
            .optional()
            .map_err(to_storage_err("failed to load knowledge_file"))?;
        raw.map(to_file).transpose()
    }

    fn update_file(&self, file: &KnowledgeFile) -> KbResult<()> {
        self.add_file(file)
    }

    fn file_exists(&self, id: Uuid) -> KbResult<bool> {
        Ok(self.get_file_by_id(id)?.is_some())
    }

    fn list_knowledge_file_ids(&self) -> KbResult<Vec<Uuid>> {
        let conn = self.conn.lock().expect("knowledge store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT id FROM knowledge_file")
            .map_err(to_storage_err("failed to prepare knowledge_file id scan"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(to_storage_err("failed to scan knowledge_file ids"))?;
        rows.map(|raw| {
            let raw = raw.map_err(to_storage_err("failed to read knowledge_file id"))?;
            parse_uuid(&raw)
        })
        .collect()
    }

    fn add_section(&self, section: &KnowledgeFileSection) -> KbResult<()> {
        let conn = self.conn.lock().expect("knowledge store mutex poisoned");
        conn.execute(
            "INSERT INTO knowledge_section (id, file_id, section_index, summary, additional_context)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                section.id.to_string(),
                section.file_id.to_string(),
                section.section_index,
                section.summary,
                section.additional_context,
            ],
        )
        .map_err(to_storage_err("failed to insert knowledge_section"))?;
        Ok(())
    }

    fn get_section_by_index(
        &self,
        file_id: Uuid,
        section_index: u32,
    ) -> KbResult<Option<KnowledgeFileSection>> {
        let conn = self.conn.lock().expect("knowledge store mutex poisoned");
        conn.query_row(
            "SELECT id, file_id, section_index, summary, additional_context
             FROM knowledge_section WHERE file_id = ?1 AND section_index = ?2",
            params![file_id.to_string(), section_index],
            section_from_row,
        )
        .optional()
        .map_err(to_storage_err("failed to load knowledge_section"))?
        .transpose()
    }

    fn get_sections_for_file(&self, file_id: Uuid) -> KbResult<Vec<KnowledgeFileSection>> {
        let conn = self.conn.lock().expect("knowledge store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, file_id, section_index, summary, additional_context
                 FROM knowledge_section WHERE file_id = ?1 ORDER BY section_index ASC",
            )
            .map_err(to_storage_err("failed to prepare section query"))?;
        let rows = stmt
            .query_map(params![file_id.to_string()], section_from_row)
            .map_err(to_storage_err("failed to query sections"))?;

        let mut sections = Vec::new();
        for row in rows {
            sections.push(row.map_err(to_storage_err("failed to read section row"))??);
        }
        Ok(sections)
    }

    fn add_chunk(&self, chunk: &KnowledgeFileChunk) -> KbResult<()> {
        let conn = self.conn.lock().expect("knowledge store mutex poisoned");
        conn.execute(
            "INSERT INTO knowledge_chunk (id, section_id, chunk_index, content, embedding, file_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                chunk.id.to_string(),
                chunk.section_id.to_string(),
                chunk.chunk_index,
                chunk.content,
                chunk.embedding.as_ref().map(|e| encode_embedding(e)),
                chunk.file_id.to_string(),
            ],
        )
        .map_err(to_storage_err("failed to insert knowledge_chunk"))?;
        Ok(())
    }

    fn get_chunks_for_section(&self, section_id: Uuid) -> KbResult<Vec<KnowledgeFileChunk>> {
        let conn = self.conn.lock().expect("knowledge store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, section_id, file_id, chunk_index, content, embedding
                 FROM knowledge_chunk WHERE section_id = ?1 ORDER BY chunk_index ASC",
            )
            .map_err(to_storage_err("failed to prepare chunk query"))?;
        let rows = stmt
            .query_map(params![section_id.to_string()], chunk_from_row)
            .map_err(to_storage_err("failed to query chunks"))?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.map_err(to_storage_err("failed to read chunk row"))??);
        }
        Ok(chunks)
    }

    fn get_chunks_by_ids(&self, ids: &[Uuid]) -> KbResult<Vec<KnowledgeFileChunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().expect("knowledge store mutex poisoned");
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT id, section_id, file_id, chunk_index, content, embedding
             FROM knowledge_chunk WHERE id IN ({placeholders})"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(to_storage_err("failed to prepare chunk-by-ids query"))?;
        let id_strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let params = rusqlite::params_from_iter(id_strings.iter());
        let rows = stmt
            .query_map(params, chunk_from_row)
            .map_err(to_storage_err("failed to query chunks by id"))?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.map_err(to_storage_err("failed to read chunk row"))??);
        }
        Ok(chunks)
    }

    fn delete_by_file(&self, file_id: Uuid) -> KbResult<()> {
        let mut conn = self.conn.lock().expect("knowledge store mutex poisoned");
        let tx = conn
            .transaction()
            .map_err(to_storage_err("failed to open purge transaction"))?;
        let id = file_id.to_string();
        tx.execute(
            "DELETE FROM knowledge_chunk WHERE file_id = ?1",
            params![id],
        )
        .map_err(to_storage_err("failed to delete chunks"))?;
        tx.execute(
            "DELETE FROM knowledge_section WHERE file_id = ?1",
            params![id],
        )
        .map_err(to_storage_err("failed to delete sections"))?;
        tx.commit()
            .map_err(to_storage_err("failed to commit purge"))?;
        Ok(())
    }

    fn delete_file(&self, file_id: Uuid) -> KbResult<()> {
        let mut conn = self.conn.lock().expect("knowledge store mutex poisoned");
        let tx = conn
            .transaction()
            .map_err(to_storage_err("failed to open delete-file transaction"))?;
        let id = file_id.to_string();
        tx.execute(
            "DELETE FROM knowledge_chunk WHERE file_id = ?1",
            params![id],
        )
        .map_err(to_storage_err("failed to delete chunks"))?;
        tx.execute(
            "DELETE FROM knowledge_section WHERE file_id = ?1",
            params![id],
        )
        .map_err(to_storage_err("failed to delete sections"))?;
        tx.execute("DELETE FROM knowledge_file WHERE id = ?1", params![id])
            .map_err(to_storage_err("failed to delete knowledge_file"))?;
        tx.commit()
            .map_err(to_storage_err("failed to commit file deletion"))?;
        Ok(())
    }
}

fn section_from_row(row: &Row<'_>) -> rusqlite::Result<KbResult<KnowledgeFileSection>> {
    let id: String = row.get(0)?;
    let file_id: String = row.get(1)?;
    let section_index: u32 = row.get(2)?;
    let summary: Option<String> = row.get(3)?;
    let additional_context: Option<String> = row.get(4)?;

    Ok((|| {
        Ok(KnowledgeFileSection {
            id: parse_uuid(&id)?,
            file_id: parse_uuid(&file_id)?,
            section_index,
            summary,
            additional_context,
        })
    })())
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<KbResult<KnowledgeFileChunk>> {
    let id: String = row.get(0)?;
    let section_id: String = row.get(1)?;
    let file_id: String = row.get(2)?;
    let chunk_index: u32 = row.get(3)?;
    let content: String = row.get(4)?;
    let embedding: Option<Vec<u8>> = row.get(5)?;

    Ok((|| {
        Ok(KnowledgeFileChunk {
            id: parse_uuid(&id)?,
            section_id: parse_uuid(&section_id)?,
            file_id: parse_uuid(&file_id)?,
            chunk_index,
            content,
            embedding: embedding.map(|bytes| decode_embedding(&bytes)),
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations_in_memory;
    use chrono::Utc;

    fn store() -> SqliteKnowledgeStore {
        SqliteKnowledgeStore::new(run_migrations_in_memory().unwrap())
    }

    fn sample_file() -> KnowledgeFile {
        KnowledgeFile {
            id: Uuid::new_v4(),
            name: "report.md".to_string(),
            hash: vec![1, 2, 3],
            processed_at: None,
            status: KnowledgeFileStatus::Pending,
        }
    }

    #[test]
    fn given_new_file_when_added_then_it_can_be_fetched_by_id() {
        let store = store();
        let file = sample_file();
        store.add_file(&file).unwrap();

        let fetched = store.get_file_by_id(file.id).unwrap().unwrap();
        assert_eq!(fetched.name, file.name);
        assert_eq!(fetched.status, KnowledgeFileStatus::Pending);
    }

    #[test]
    fn given_missing_file_when_fetched_then_none() {
        let store = store();
        assert!(store.get_file_by_id(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn given_several_files_when_listing_ids_then_every_file_is_returned() {
        let store = store();
        let a = sample_file();
        let b = sample_file();
        store.add_file(&a).unwrap();
        store.add_file(&b).unwrap();

        let mut ids = store.list_knowledge_file_ids().unwrap();
        ids.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn given_existing_file_when_updated_then_status_and_processed_at_change() {
        let store = store();
        let mut file = sample_file();
        store.add_file(&file).unwrap();

        file.status = KnowledgeFileStatus::Indexed;
        file.processed_at = Some(Utc::now());
        store.update_file(&file).unwrap();

        let fetched = store.get_file_by_id(file.id).unwrap().unwrap();
        assert_eq!(fetched.status, KnowledgeFileStatus::Indexed);
        assert!(fetched.processed_at.is_some());
    }

    #[test]
    fn given_section_and_chunks_when_persisted_then_they_are_ordered_by_index() {
        let store = store();
        let file = sample_file();
        store.add_file(&file).unwrap();

        let section = KnowledgeFileSection {
            id: Uuid::new_v4(),
            file_id: file.id,
            section_index: 0,
            summary: None,
            additional_context: None,
        };
        store.add_section(&section).unwrap();

        for i in (0..3).rev() {
            store
                .add_chunk(&KnowledgeFileChunk {
                    id: Uuid::new_v4(),
                    section_id: section.id,
                    file_id: file.id,
                    chunk_index: i,
                    content: format!("chunk {i}"),
                    embedding: Some(vec![0.1, 0.2, 0.3]),
                })
                .unwrap();
        }

        let chunks = store.get_chunks_for_section(section.id).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.windows(2).all(|w| w[0].chunk_index < w[1].chunk_index));
        assert_eq!(chunks[0].embedding.as_ref().unwrap(), &vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn given_file_with_sections_and_chunks_when_deleted_by_file_then_all_are_purged() {
        let store = store();
        let file = sample_file();
        store.add_file(&file).unwrap();

        let section = KnowledgeFileSection {
            id: Uuid::new_v4(),
            file_id: file.id,
            section_index: 0,
            summary: None,
            additional_context: None,
        };
        store.add_section(&section).unwrap();
        store
            .add_chunk(&KnowledgeFileChunk {
                id: Uuid::new_v4(),
                section_id: section.id,
                file_id: file.id,
                chunk_index: 0,
                content: "hello".to_string(),
                embedding: None,
            })
            .unwrap();

        store.delete_by_file(file.id).unwrap();

        assert!(store.get_sections_for_file(file.id).unwrap().is_empty());
        assert!(store.get_chunks_for_section(section.id).unwrap().is_empty());
    }

    #[test]
    fn given_existing_file_when_deleted_then_the_file_row_itself_is_gone() {
        let store = store();
        let file = sample_file();
        store.add_file(&file).unwrap();

        store.delete_file(file.id).unwrap();

        assert!(store.get_file_by_id(file.id).unwrap().is_none());
        assert!(!store.file_exists(file.id).unwrap());
    }
}
