use std::io::Read;

use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::error::KbResult;
use crate::model::{
    KnowledgeFile, KnowledgeFileChunk, KnowledgeFileSection, Library, LibraryFile,
    LibraryPermission, User,
};

/// C1 — counts tokens in a string. Pure and inexpensive; no cancellation
/// signal needed because implementations never perform I/O.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> KbResult<usize>;
}

/// C2 — maps text to a fixed-dimension, unit-normalised vector.
/// Implementations must tolerate transient failures with a bounded retry
/// (spec §6); callers that need a retry budget should use
/// [`crate::retry::with_bounded_retry`] around `embed`.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str, cancel: &CancellationToken) -> KbResult<Vec<f32>>;

    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;
}

/// C8 — the system of record for knowledge files, sections and chunks.
/// One method cluster per entity (spec §4.9); implementations are
/// responsible for the `(file_id, section_index)` / `(section_id,
/// chunk_index)` uniqueness invariants.
pub trait KnowledgeStore: Send + Sync {
    fn add_file(&self, file: &KnowledgeFile) -> KbResult<()>;
    fn get_file_by_id(&self, id: Uuid) -> KbResult<Option<KnowledgeFile>>;
    fn update_file(&self, file: &KnowledgeFile) -> KbResult<()>;
    fn file_exists(&self, id: Uuid) -> KbResult<bool>;

    /// Every known file id, for rehydrating C9 on startup (spec §4.5,
    /// §7: the vector store is rebuilt from the chunk rows on reload).
    fn list_knowledge_file_ids(&self) -> KbResult<Vec<Uuid>>;

    fn add_section(&self, section: &KnowledgeFileSection) -> KbResult<()>;
    fn get_section_by_index(
        &self,
        file_id: Uuid,
        section_index: u32,
    ) -> KbResult<Option<KnowledgeFileSection>>;
    fn get_sections_for_file(&self, file_id: Uuid) -> KbResult<Vec<KnowledgeFileSection>>;

    fn add_chunk(&self, chunk: &KnowledgeFileChunk) -> KbResult<()>;
    fn get_chunks_for_section(&self, section_id: Uuid) -> KbResult<Vec<KnowledgeFileChunk>>;
    fn get_chunks_by_ids(&self, ids: &[Uuid]) -> KbResult<Vec<KnowledgeFileChunk>>;

    /// Transactionally removes every section, chunk and (via the caller's
    /// own follow-up call into C9) vector-store entry for `file_id`.
    fn delete_by_file(&self, file_id: Uuid) -> KbResult<()>;

    /// As [`KnowledgeStore::delete_by_file`], but also removes the
    /// `knowledge_file` row itself. Used when a file is being removed from
    /// its library entirely, as opposed to purged ahead of a re-index.
    fn delete_file(&self, file_id: Uuid) -> KbResult<()>;
}

/// Library/user/permission persistence, grounded the same way as
/// [`KnowledgeStore`] but kept as a separate trait since a deployment may
/// source identity/library metadata from a different system than the
/// knowledge store proper.
pub trait LibraryStore: Send + Sync {
    fn get_user(&self, id: Uuid) -> KbResult<Option<User>>;

    fn add_library(&self, library: &Library) -> KbResult<()>;
    fn get_library(&self, id: Uuid) -> KbResult<Option<Library>>;
    fn delete_library(&self, id: Uuid) -> KbResult<()>;

    fn get_permission(&self, library_id: Uuid, user_id: Uuid) -> KbResult<Option<LibraryPermission>>;
    fn upsert_permission(&self, permission: &LibraryPermission) -> KbResult<()>;
    fn revoke_permission(&self, library_id: Uuid, user_id: Uuid) -> KbResult<()>;

    fn add_library_file(&self, file: &LibraryFile) -> KbResult<()>;
    fn get_library_file(&self, id: Uuid) -> KbResult<Option<LibraryFile>>;
    fn list_library_files(&self, library_id: Uuid) -> KbResult<Vec<LibraryFile>>;
    fn delete_library_file(&self, id: Uuid) -> KbResult<()>;
}

/// C9 — an in-memory mirror of chunk embeddings. Truth lives in
/// [`KnowledgeStore`]; this is a derived index rehydrated from chunk rows
/// on startup (spec §4.5).
pub trait ChunkVectorStore: Send + Sync {
    fn add(&self, chunk_id: Uuid, vector: &[f32]) -> KbResult<()>;
    fn remove(&self, chunk_id: Uuid) -> KbResult<()>;
    /// Descending cosine similarity, ties broken by ascending `chunk_id`,
    /// at most `k` results.
    fn search(&self, query: &[f32], k: usize) -> KbResult<Vec<(Uuid, f32)>>;
}

/// C14 — content-addressed-by-path blob storage rooted at
/// `FILE_STORAGE_BASE_PATH` (spec §6).
pub trait BlobStore: Send + Sync {
    fn write_at_offset(&self, relative_path: &str, offset: u64, data: &[u8]) -> KbResult<()>;
    fn open_read(&self, relative_path: &str) -> KbResult<Box<dyn Read>>;
    fn size(&self, relative_path: &str) -> KbResult<u64>;
    fn mv(&self, from_relative_path: &str, to_relative_path: &str) -> KbResult<()>;
    fn delete(&self, relative_path: &str) -> KbResult<()>;
    fn exists(&self, relative_path: &str) -> KbResult<bool>;
}
