//! Facade wiring every collaborator (C1-C15) into the operations exposed
//! to external callers (spec §6, §9.2). Grounded on the teacher's
//! `local-api-core`/`local-api` service-module layout: one struct holding
//! `Arc<dyn Port>` collaborators, one method per externally-exposed
//! operation, authorization checked at the top of every method that
//! touches a specific library.

use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use knowbase_auth::LibraryAuthorizer;
use knowbase_core::cancel::CancellationToken;
use knowbase_core::error::{KbError, KbResult};
use knowbase_core::model::{
    KnowledgeFileStatus, LibraryFile, LibraryPermission, PermissionKind,
};
use knowbase_core::ports::{BlobStore, KnowledgeStore, LibraryStore};
use knowbase_indexer::Indexer;
use knowbase_ollama::{Cl100kTokenizer, OllamaEmbedder};
use knowbase_search::{SearchResult, Searcher};
use knowbase_storage::{
    migrations, InMemoryChunkVectorStore, LocalBlobStore, SqliteKnowledgeStore, SqliteLibraryStore,
};
use knowbase_upload::{UploadSessionManager, UploadStatusSnapshot};

use crate::config::Config;

/// Per-chunk token budget for C5 (spec §4.3 lists section/chunk constants
/// as one knob set; this one isn't part of the external configuration key
/// table, so it's a fixed internal constant rather than a `Config` field).
const CHUNK_MAX_TOKENS_PER_CHUNK: usize = 512;

/// A library file paired with its indexing state, if any (§9.2
/// `get_file_info`: "the `LibraryFile` plus its `KnowledgeFile`
/// status/`processed_at` if indexed").
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub file: LibraryFile,
    pub status: Option<KnowledgeFileStatus>,
    pub processed_at: Option<DateTime<Utc>>,
}

const CONTEXT_SECTION_START: &str = "--- START OF NEW CONTEXT SECTION ---";
const CONTEXT_SECTION_END: &str = "--- END OF CONTEXT SEARCH RESULT ---";

pub struct KnowledgeBaseService {
    auth: Arc<LibraryAuthorizer>,
    library_store: Arc<dyn LibraryStore>,
    knowledge_store: Arc<dyn KnowledgeStore>,
    blobs: Arc<dyn BlobStore>,
    indexer: Arc<Indexer>,
    uploads: Arc<UploadSessionManager>,
    searcher: Arc<Searcher>,
}

impl KnowledgeBaseService {
    /// Wires the facade over already-constructed collaborators. Tests and
    /// alternate deployments build their own adapters and call this
    /// directly instead of [`KnowledgeBaseService::connect`].
    pub fn new(
        auth: Arc<LibraryAuthorizer>,
        library_store: Arc<dyn LibraryStore>,
        knowledge_store: Arc<dyn KnowledgeStore>,
        blobs: Arc<dyn BlobStore>,
        indexer: Arc<Indexer>,
        uploads: Arc<UploadSessionManager>,
        searcher: Arc<Searcher>,
    ) -> Arc<Self> {
        uploads.start_janitor();
        Arc::new(Self {
            auth,
            library_store,
            knowledge_store,
            blobs,
            indexer,
            uploads,
            searcher,
        })
    }

    /// Builds the reference deployment: sqlite storage, a local-filesystem
    /// blob store, and an Ollama-backed embedder/tokenizer, per §0.3.
    ///
    /// The in-memory chunk vector index (C9) is rebuilt from the chunk
    /// rows already on disk (spec §4.5, §7), so a restart against a
    /// non-empty database doesn't need a re-index to make existing files
    /// searchable again.
    pub fn connect(config: &Config) -> KbResult<Arc<Self>> {
        let db_path = config.sqlite_db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let knowledge_store: Arc<dyn KnowledgeStore> =
            Arc::new(SqliteKnowledgeStore::new(migrations::run_migrations_at(&db_path)?));
        let library_store: Arc<dyn LibraryStore> =
            Arc::new(SqliteLibraryStore::new(migrations::run_migrations_at(&db_path)?));

        let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(config.file_storage_base_path.clone()));
        let known_file_ids = knowledge_store.list_knowledge_file_ids()?;
        let vectors = Arc::new(InMemoryChunkVectorStore::rehydrate(&*knowledge_store, &known_file_ids)?);
        let embedder = Arc::new(OllamaEmbedder::connect(
            &config.ollama_base_url,
            config.ollama_embedding_model.clone(),
        )?);
        let tokenizer = Arc::new(Cl100kTokenizer);

        let indexer = Arc::new(Indexer::new(
            knowledge_store.clone(),
            vectors.clone(),
            blobs.clone(),
            embedder.clone(),
            tokenizer.clone(),
            config.section.clone(),
            CHUNK_MAX_TOKENS_PER_CHUNK,
        ));

        let auth = Arc::new(LibraryAuthorizer::new(library_store.clone()));
        let uploads = Arc::new(UploadSessionManager::new(
            auth.clone(),
            library_store.clone(),
            blobs.clone(),
            indexer.clone(),
            config.max_file_size_bytes,
            config.upload_session_ttl,
        ));
        let searcher = Arc::new(Searcher::new(embedder, vectors, knowledge_store.clone()));

        Ok(Self::new(auth, library_store, knowledge_store, blobs, indexer, uploads, searcher))
    }

    // ---- C11 chunked upload -------------------------------------------

    pub fn initiate_chunked_upload(
        &self,
        user_id: Uuid,
        library_id: Uuid,
        original_file_name: String,
        content_type: String,
        total_size: u64,
        chunk_size: u64,
    ) -> KbResult<Uuid> {
        self.uploads.initiate(
            user_id,
            library_id,
            original_file_name,
            content_type,
            total_size,
            chunk_size,
        )
    }

    pub fn upload_chunk(&self, session_id: Uuid, chunk_number: u32, data: &[u8]) -> KbResult<()> {
        self.uploads.upload_chunk(session_id, chunk_number, data)
    }

    pub fn complete_chunked_upload(&self, session_id: Uuid, cancel: &CancellationToken) -> KbResult<Uuid> {
        self.uploads.complete(session_id, cancel)
    }

    pub fn get_upload_status(&self, session_id: Uuid) -> KbResult<UploadStatusSnapshot> {
        self.uploads.get_status(session_id)
    }

    pub fn cancel_chunked_upload(&self, session_id: Uuid) -> KbResult<()> {
        self.uploads.cancel(session_id)
    }

    // ---- file management (§9.2) ----------------------------------------

    pub fn list_files(&self, user_id: Uuid, library_id: Uuid) -> KbResult<Vec<LibraryFile>> {
        self.auth.validate_access(user_id, library_id, PermissionKind::Read, "list_files")?;
        let mut files = self.library_store.list_library_files(library_id)?;
        files.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(files)
    }

    pub fn get_file_info(&self, user_id: Uuid, library_id: Uuid, file_id: Uuid) -> KbResult<FileInfo> {
        self.auth.validate_access(user_id, library_id, PermissionKind::Read, "get_file_info")?;
        let file = self.owned_library_file(library_id, file_id)?;
        let knowledge = self.knowledge_store.get_file_by_id(file_id)?;
        Ok(FileInfo {
            file,
            status: knowledge.as_ref().map(|k| k.status),
            processed_at: knowledge.and_then(|k| k.processed_at),
        })
    }

    pub fn download_file(&self, user_id: Uuid, library_id: Uuid, file_id: Uuid) -> KbResult<Box<dyn Read>> {
        self.auth.validate_access(user_id, library_id, PermissionKind::Read, "download_file")?;
        let file = self.owned_library_file(library_id, file_id)?;
        self.blobs.open_read(&file.relative_path)
    }

    /// Deletes the `LibraryFile` row, its blob, and (if indexed) the
    /// `KnowledgeFile` and every section/chunk/vector entry it owns.
    pub fn delete_file(&self, user_id: Uuid, library_id: Uuid, file_id: Uuid) -> KbResult<()> {
        self.auth.validate_access(user_id, library_id, PermissionKind::Write, "delete_file")?;
        let file = self.owned_library_file(library_id, file_id)?;

        self.indexer.purge(file_id)?;
        self.blobs.delete(&file.relative_path)?;
        self.library_store.delete_library_file(file_id)
    }

    /// Deletes every file in the library (each individually purged as in
    /// [`KnowledgeBaseService::delete_file`]), then the library's
    /// permissions and the library row itself.
    pub fn delete_library(&self, user_id: Uuid, library_id: Uuid) -> KbResult<()> {
        self.auth.validate_access(user_id, library_id, PermissionKind::Admin, "delete_library")?;

        for file in self.library_store.list_library_files(library_id)? {
            if let Err(error) = self.indexer.purge(file.id) {
                tracing::warn!(file_id = %file.id, %error, "failed to purge indexed data during library deletion");
            }
            if let Err(error) = self.blobs.delete(&file.relative_path) {
                tracing::warn!(file_id = %file.id, %error, "failed to delete blob during library deletion");
            }
        }

        self.library_store.delete_library(library_id)
    }

    fn owned_library_file(&self, library_id: Uuid, file_id: Uuid) -> KbResult<LibraryFile> {
        let file = self
            .library_store
            .get_library_file(file_id)?
            .ok_or_else(|| KbError::not_found("library file"))?;
        if file.library_id != library_id {
            return Err(KbError::not_found("library file"));
        }
        Ok(file)
    }

    // ---- C12 permissions -------------------------------------------------

    pub fn grant_permission(
        &self,
        actor_user_id: Uuid,
        library_id: Uuid,
        target_user_id: Uuid,
        kind: PermissionKind,
    ) -> KbResult<()> {
        self.auth
            .validate_access(actor_user_id, library_id, PermissionKind::Admin, "grant_permission")?;
        self.library_store.upsert_permission(&LibraryPermission {
            id: Uuid::new_v4(),
            library_id,
            user_id: target_user_id,
            kind,
            granted_by_user_id: actor_user_id,
            created_at: Utc::now(),
        })
    }

    pub fn revoke_permission(&self, actor_user_id: Uuid, library_id: Uuid, target_user_id: Uuid) -> KbResult<()> {
        self.auth
            .validate_access(actor_user_id, library_id, PermissionKind::Admin, "revoke_permission")?;
        self.library_store.revoke_permission(library_id, target_user_id)
    }

    pub fn effective_permission(&self, user_id: Uuid, library_id: Uuid) -> PermissionKind {
        self.auth.effective_permission(user_id, library_id)
    }

    // ---- C13 search --------------------------------------------------

    /// Searches a single library (spec's non-goal of "cross-library
    /// federated search" rules out a combined-ranking multi-library call;
    /// §9.4 #1 requires an authenticated `user_id` for every search).
    /// Authorization failures are folded into the same
    /// `SearchResult{success=false}` shape C13 uses for internal failures,
    /// since neither is retryable by the same principal and both are
    /// reported back through one channel.
    pub fn search(
        &self,
        user_id: Uuid,
        library_id: Uuid,
        query: &str,
        k: usize,
        cancel: &CancellationToken,
    ) -> SearchResult {
        if let Err(error) = self.auth.validate_access(user_id, library_id, PermissionKind::Read, "search") {
            return unauthorized_search_result(error);
        }

        let result = self.searcher.search(query, k, cancel);
        if !result.success {
            return result;
        }

        let library_file_ids: HashSet<Uuid> = match self.library_store.list_library_files(library_id) {
            Ok(files) => files.into_iter().map(|f| f.id).collect(),
            Err(error) => return unauthorized_search_result(error),
        };

        let entries: Vec<_> = result
            .entries
            .into_iter()
            .filter(|entry| library_file_ids.contains(&entry.section.file_id))
            .collect();
        let context = render_context(&entries);

        SearchResult {
            success: true,
            retryable: false,
            error: None,
            entries,
            context,
        }
    }
}

fn unauthorized_search_result(error: KbError) -> SearchResult {
    SearchResult {
        success: false,
        retryable: error.retryable(),
        error: Some(error.to_string()),
        entries: Vec::new(),
        context: String::new(),
    }
}

fn render_context(entries: &[knowbase_search::RelevanceRatedEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(CONTEXT_SECTION_START);
        out.push('\n');
        for chunk in &entry.chunks {
            out.push_str(&chunk.content);
            out.push('\n');
        }
        out.push_str(CONTEXT_SECTION_END);
        out.push('\n');
    }
    out
}
