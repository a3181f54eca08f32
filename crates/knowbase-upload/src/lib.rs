//! C11 — the chunked upload session state machine (spec §4.7): `initiate`
//! opens a session over a temp blob, `upload_chunk` appends to it,
//! `complete` finalises it into a `LibraryFile` and hands it to the
//! indexer (C10), `cancel` purges it, and a background janitor thread
//! reaps sessions past `expires_at`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use knowbase_auth::LibraryAuthorizer;
use knowbase_core::cancel::CancellationToken;
use knowbase_core::error::{KbError, KbResult};
use knowbase_core::hashing::StreamHasher;
use knowbase_core::model::{ChunkedUploadSession, IndexOutcome, LibraryFile, PermissionKind};
use knowbase_core::ports::{BlobStore, LibraryStore};
use knowbase_indexer::{FileSource, Indexer};

const MAX_CHUNK_SIZE_BYTES: u64 = 50 * 1024 * 1024;
const JANITOR_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadSessionStatus {
    Open,
    Complete,
}

#[derive(Debug, Clone)]
pub struct UploadStatusSnapshot {
    pub session_id: Uuid,
    pub status: UploadSessionStatus,
    pub uploaded_chunk_count: u32,
    pub total_chunks: u32,
}

struct Janitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct UploadSessionManager {
    auth: Arc<LibraryAuthorizer>,
    library_store: Arc<dyn LibraryStore>,
    blobs: Arc<dyn BlobStore>,
    indexer: Arc<Indexer>,
    max_file_size_bytes: u64,
    ttl: Duration,
    sessions: Arc<RwLock<HashMap<Uuid, ChunkedUploadSession>>>,
    janitor: Mutex<Option<Janitor>>,
}

impl UploadSessionManager {
    pub fn new(
        auth: Arc<LibraryAuthorizer>,
        library_store: Arc<dyn LibraryStore>,
        blobs: Arc<dyn BlobStore>,
        indexer: Arc<Indexer>,
        max_file_size_bytes: u64,
        ttl: Duration,
    ) -> Self {
        Self {
            auth,
            library_store,
            blobs,
            indexer,
            max_file_size_bytes,
            ttl,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            janitor: Mutex::new(None),
        }
    }

    /// Starts the background janitor thread that reaps expired sessions
    /// and purges their temp blobs. Idempotent: a second call is a no-op
    /// while one is already running.
    pub fn start_janitor(self: &Arc<Self>) {
        let mut guard = self.janitor.lock().unwrap();
        if guard.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<()>();
        let manager = Arc::clone(self);
        let stop_for_thread = Arc::clone(&stop);

        let handle = thread::spawn(move || loop {
            match rx.recv_timeout(JANITOR_SWEEP_INTERVAL) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Timeout) => {
                    if stop_for_thread.load(Ordering::SeqCst) {
                        break;
                    }
                    manager.reap_expired();
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        });

        drop(tx);
        *guard = Some(Janitor {
            stop,
            handle: Some(handle),
        });
    }

    fn reap_expired(&self) {
        let now = Utc::now();
        let expired: Vec<ChunkedUploadSession> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .values()
                .filter(|s| s.expires_at <= now)
                .cloned()
                .collect()
        };

        for session in expired {
            tracing::debug!(session_id = %session.session_id, "reaping expired upload session");
            if let Err(error) = self.blobs.delete(&session.temp_blob_path) {
                tracing::warn!(session_id = %session.session_id, %error, "failed to purge expired session blob");
            }
            self.sessions.write().unwrap().remove(&session.session_id);
        }
    }

    pub fn initiate(
        &self,
        user_id: Uuid,
        library_id: Uuid,
        original_file_name: String,
        content_type: String,
        total_size: u64,
        chunk_size: u64,
    ) -> KbResult<Uuid> {
        self.auth
            .validate_access(user_id, library_id, PermissionKind::Write, "initiate_chunked_upload")?;

        if total_size == 0 || total_size > self.max_file_size_bytes {
            return Err(KbError::input_invalid("total_size out of range"));
        }
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE_BYTES.min(total_size) {
            return Err(KbError::input_invalid("chunk_size out of range"));
        }

        let session_id = Uuid::new_v4();
        let now = Utc::now();
        let session = ChunkedUploadSession {
            session_id,
            library_id,
            original_file_name,
            content_type,
            total_size,
            chunk_size,
            uploaded_by_user_id: user_id,
            created_at: now,
            expires_at: now + self.ttl,
            temp_blob_path: format!("libraries/{library_id}/.uploads/{session_id}"),
            uploaded_chunks: Default::default(),
        };

        self.sessions.write().unwrap().insert(session_id, session);
        Ok(session_id)
    }

    pub fn upload_chunk(&self, session_id: Uuid, chunk_number: u32, data: &[u8]) -> KbResult<()> {
        let (temp_blob_path, offset) = {
            let mut sessions = self.sessions.write().unwrap();
            let session = self.live_session_mut(&mut sessions, session_id)?;

            if session.is_complete() {
                return Err(KbError::conflict("upload session already complete"));
            }
            if chunk_number >= session.total_chunks() {
                return Err(KbError::input_invalid("chunk_number out of range"));
            }
            if session.uploaded_chunks.contains(&chunk_number) {
                return Err(KbError::conflict("chunk already uploaded"));
            }

            let offset = chunk_number as u64 * session.chunk_size;
            session.uploaded_chunks.insert(chunk_number);
            (session.temp_blob_path.clone(), offset)
        };

        self.blobs.write_at_offset(&temp_blob_path, offset, data)
    }

    pub fn complete(&self, session_id: Uuid, cancel: &CancellationToken) -> KbResult<Uuid> {
        let session = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .get(&session_id)
                .cloned()
                .ok_or_else(|| KbError::not_found("upload session"))?
        };

        if !session.is_complete() {
            return Err(KbError::conflict("upload session is not yet complete"));
        }

        match self.try_complete(&session, cancel) {
            Ok(file_id) => {
                self.sessions.write().unwrap().remove(&session_id);
                Ok(file_id)
            }
            Err(error) => {
                let _ = self.blobs.delete(&session.temp_blob_path);
                Err(error)
            }
        }
    }

    fn try_complete(&self, session: &ChunkedUploadSession, cancel: &CancellationToken) -> KbResult<Uuid> {
        let actual_size = self.blobs.size(&session.temp_blob_path)?;
        if actual_size != session.total_size {
            return Err(KbError::integrity("uploaded blob size does not match total_size"));
        }

        let hash = StreamHasher::hash_reader(self.blobs.open_read(&session.temp_blob_path)?)?;

        let file_id = Uuid::new_v4();
        let relative_path = format!(
            "libraries/{}/{}/{}",
            session.library_id, file_id, session.original_file_name
        );

        let now = Utc::now();
        let library_file = LibraryFile {
            id: file_id,
            library_id: session.library_id,
            original_file_name: session.original_file_name.clone(),
            content_type: session.content_type.clone(),
            size_in_bytes: session.total_size,
            relative_path: relative_path.clone(),
            hash,
            uploaded_by_user_id: session.uploaded_by_user_id,
            uploaded_at: now,
            created_at: now,
            updated_at: now,
        };
        self.library_store.add_library_file(&library_file)?;

        self.blobs.mv(&session.temp_blob_path, &relative_path)?;

        let source = FileSource {
            file_id,
            name: session.original_file_name.clone(),
            relative_path,
        };
        match self.indexer.index(&source, cancel) {
            IndexOutcome::Indexed { .. } | IndexOutcome::UpToDate { .. } => Ok(file_id),
            IndexOutcome::InProgress => Err(KbError::conflict("file is already being indexed")),
            IndexOutcome::Failed { reason, .. } => Err(KbError::storage(format!("indexing failed: {reason}"))),
        }
    }

    pub fn cancel(&self, session_id: Uuid) -> KbResult<()> {
        let session = self
            .sessions
            .write()
            .unwrap()
            .remove(&session_id)
            .ok_or_else(|| KbError::not_found("upload session"))?;

        self.blobs.delete(&session.temp_blob_path)
    }

    pub fn get_status(&self, session_id: Uuid) -> KbResult<UploadStatusSnapshot> {
        let mut sessions = self.sessions.write().unwrap();
        let session = self.live_session_mut(&mut sessions, session_id)?;

        let status = if session.is_complete() {
            UploadSessionStatus::Complete
        } else {
            UploadSessionStatus::Open
        };

        Ok(UploadStatusSnapshot {
            session_id,
            status,
            uploaded_chunk_count: session.uploaded_chunks.len() as u32,
            total_chunks: session.total_chunks(),
        })
    }

    /// Looks up a session, lazily evicting (and returning `NotFound` for)
    /// one whose `expires_at` has already passed even if the janitor
    /// hasn't swept it yet.
    fn live_session_mut<'a>(
        &self,
        sessions: &'a mut HashMap<Uuid, ChunkedUploadSession>,
        session_id: Uuid,
    ) -> KbResult<&'a mut ChunkedUploadSession> {
        let expired = sessions
            .get(&session_id)
            .map(|s| s.expires_at <= Utc::now())
            .unwrap_or(false);

        if expired {
            sessions.remove(&session_id);
        }

        sessions.get_mut(&session_id).ok_or_else(|| KbError::not_found("upload session"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowbase_core::model::{Library, LibraryPermission};
    use knowbase_core::ports::{ChunkVectorStore, Embedder, KnowledgeStore};
    use knowbase_pipeline::SectionReaderConfig;
    use std::collections::HashMap as StdHashMap;
    use std::io::Cursor;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeLibraryStore {
        libraries: StdMutex<StdHashMap<Uuid, Library>>,
        files: StdMutex<StdHashMap<Uuid, LibraryFile>>,
    }

    impl LibraryStore for FakeLibraryStore {
        fn get_user(&self, _id: Uuid) -> KbResult<Option<knowbase_core::model::User>> {
            Ok(None)
        }
        fn add_library(&self, library: &Library) -> KbResult<()> {
            self.libraries.lock().unwrap().insert(library.id, library.clone());
            Ok(())
        }
        fn get_library(&self, id: Uuid) -> KbResult<Option<Library>> {
            Ok(self.libraries.lock().unwrap().get(&id).cloned())
        }
        fn delete_library(&self, id: Uuid) -> KbResult<()> {
            self.libraries.lock().unwrap().remove(&id);
            Ok(())
        }
        fn get_permission(&self, _library_id: Uuid, _user_id: Uuid) -> KbResult<Option<LibraryPermission>> {
            Ok(None)
        }
        fn upsert_permission(&self, _permission: &LibraryPermission) -> KbResult<()> {
            Ok(())
        }
        fn revoke_permission(&self, _library_id: Uuid, _user_id: Uuid) -> KbResult<()> {
            Ok(())
        }
        fn add_library_file(&self, file: &LibraryFile) -> KbResult<()> {
            self.files.lock().unwrap().insert(file.id, file.clone());
            Ok(())
        }
        fn get_library_file(&self, id: Uuid) -> KbResult<Option<LibraryFile>> {
            Ok(self.files.lock().unwrap().get(&id).cloned())
        }
        fn list_library_files(&self, library_id: Uuid) -> KbResult<Vec<LibraryFile>> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .values()
                .filter(|f| f.library_id == library_id)
                .cloned()
                .collect())
        }
        fn delete_library_file(&self, id: Uuid) -> KbResult<()> {
            self.files.lock().unwrap().remove(&id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBlobStore {
        blobs: StdMutex<StdHashMap<String, Vec<u8>>>,
    }

    impl BlobStore for FakeBlobStore {
        fn write_at_offset(&self, relative_path: &str, offset: u64, data: &[u8]) -> KbResult<()> {
            let mut blobs = self.blobs.lock().unwrap();
            let buf = blobs.entry(relative_path.to_string()).or_default();
            let end = offset as usize + data.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[offset as usize..end].copy_from_slice(data);
            Ok(())
        }
        fn open_read(&self, relative_path: &str) -> KbResult<Box<dyn std::io::Read>> {
            let data = self
                .blobs
                .lock()
                .unwrap()
                .get(relative_path)
                .cloned()
                .ok_or_else(|| KbError::not_found("blob"))?;
            Ok(Box::new(Cursor::new(data)))
        }
        fn size(&self, relative_path: &str) -> KbResult<u64> {
            Ok(self.blobs.lock().unwrap().get(relative_path).map(|b| b.len() as u64).unwrap_or(0))
        }
        fn mv(&self, from: &str, to: &str) -> KbResult<()> {
            let mut blobs = self.blobs.lock().unwrap();
            let data = blobs.remove(from).ok_or_else(|| KbError::not_found("blob"))?;
            blobs.insert(to.to_string(), data);
            Ok(())
        }
        fn delete(&self, relative_path: &str) -> KbResult<()> {
            self.blobs.lock().unwrap().remove(relative_path);
            Ok(())
        }
        fn exists(&self, relative_path: &str) -> KbResult<bool> {
            Ok(self.blobs.lock().unwrap().contains_key(relative_path))
        }
    }

    struct WordCountTokenizer;

    impl knowbase_core::ports::Tokenizer for WordCountTokenizer {
        fn count_tokens(&self, text: &str) -> KbResult<usize> {
            Ok(text.split_whitespace().count().max(1))
        }
    }

    struct FixedEmbedder;

    impl Embedder for FixedEmbedder {
        fn embed(&self, _text: &str, _cancel: &CancellationToken) -> KbResult<Vec<f32>> {
            Ok(vec![1.0, 0.0, 0.0])
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dimensions(&self) -> usize {
            3
        }
    }

    #[derive(Default)]
    struct FakeKnowledgeStore {
        files: StdMutex<StdHashMap<Uuid, knowbase_core::model::KnowledgeFile>>,
        sections: StdMutex<StdHashMap<Uuid, Vec<knowbase_core::model::KnowledgeFileSection>>>,
        chunks: StdMutex<StdHashMap<Uuid, Vec<knowbase_core::model::KnowledgeFileChunk>>>,
    }

    impl KnowledgeStore for FakeKnowledgeStore {
        fn add_file(&self, file: &knowbase_core::model::KnowledgeFile) -> KbResult<()> {
            self.files.lock().unwrap().insert(file.id, file.clone());
            Ok(())
        }
        fn get_file_by_id(&self, id: Uuid) -> KbResult<Option<knowbase_core::model::KnowledgeFile>> {
            Ok(self.files.lock().unwrap().get(&id).cloned())
        }
        fn update_file(&self, file: &knowbase_core::model::KnowledgeFile) -> KbResult<()> {
            self.files.lock().unwrap().insert(file.id, file.clone());
            Ok(())
        }
        fn file_exists(&self, id: Uuid) -> KbResult<bool> {
            Ok(self.files.lock().unwrap().contains_key(&id))
        }
        fn list_knowledge_file_ids(&self) -> KbResult<Vec<Uuid>> {
            Ok(self.files.lock().unwrap().keys().copied().collect())
        }
        fn add_section(&self, section: &knowbase_core::model::KnowledgeFileSection) -> KbResult<()> {
            self.sections.lock().unwrap().entry(section.file_id).or_default().push(section.clone());
            Ok(())
        }
        fn get_section_by_index(
            &self,
            _file_id: Uuid,
            _section_index: u32,
        ) -> KbResult<Option<knowbase_core::model::KnowledgeFileSection>> {
            Ok(None)
        }
        fn get_sections_for_file(&self, file_id: Uuid) -> KbResult<Vec<knowbase_core::model::KnowledgeFileSection>> {
            Ok(self.sections.lock().unwrap().get(&file_id).cloned().unwrap_or_default())
        }
        fn add_chunk(&self, chunk: &knowbase_core::model::KnowledgeFileChunk) -> KbResult<()> {
            self.chunks.lock().unwrap().entry(chunk.section_id).or_default().push(chunk.clone());
            Ok(())
        }
        fn get_chunks_for_section(&self, section_id: Uuid) -> KbResult<Vec<knowbase_core::model::KnowledgeFileChunk>> {
            Ok(self.chunks.lock().unwrap().get(&section_id).cloned().unwrap_or_default())
        }
        fn get_chunks_by_ids(&self, ids: &[Uuid]) -> KbResult<Vec<knowbase_core::model::KnowledgeFileChunk>> {
            let chunks = self.chunks.lock().unwrap();
            Ok(chunks.values().flatten().filter(|c| ids.contains(&c.id)).cloned().collect())
        }
        fn delete_file(&self, file_id: Uuid) -> KbResult<()> {
            self.delete_by_file(file_id)?;
            self.files.lock().unwrap().remove(&file_id);
            Ok(())
        }
        fn delete_by_file(&self, file_id: Uuid) -> KbResult<()> {
            if let Some(sections) = self.sections.lock().unwrap().remove(&file_id) {
                let mut chunks = self.chunks.lock().unwrap();
                for section in sections {
                    chunks.remove(&section.id);
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeVectorStore {
        vectors: StdMutex<StdHashMap<Uuid, Vec<f32>>>,
    }

    impl ChunkVectorStore for FakeVectorStore {
        fn add(&self, chunk_id: Uuid, vector: &[f32]) -> KbResult<()> {
            self.vectors.lock().unwrap().insert(chunk_id, vector.to_vec());
            Ok(())
        }
        fn remove(&self, chunk_id: Uuid) -> KbResult<()> {
            self.vectors.lock().unwrap().remove(&chunk_id);
            Ok(())
        }
        fn search(&self, _query: &[f32], _k: usize) -> KbResult<Vec<(Uuid, f32)>> {
            Ok(Vec::new())
        }
    }

    fn build_manager() -> (UploadSessionManager, Uuid, Uuid) {
        let owner = Uuid::new_v4();
        let library_id = Uuid::new_v4();
        let library_store = Arc::new(FakeLibraryStore::default());
        library_store.add_library(&Library {
            id: library_id,
            name: "Lib".to_string(),
            description: None,
            owner_id: owner,
            is_public: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }).unwrap();

        let auth = Arc::new(LibraryAuthorizer::new(library_store.clone()));
        let blobs = Arc::new(FakeBlobStore::default());
        let indexer = Arc::new(Indexer::new(
            Arc::new(FakeKnowledgeStore::default()),
            Arc::new(FakeVectorStore::default()),
            blobs.clone(),
            Arc::new(FixedEmbedder),
            Arc::new(WordCountTokenizer),
            SectionReaderConfig {
                minimum_chunks_per_section: 1,
                minimum_tokens_per_section: 1,
                ..SectionReaderConfig::default()
            },
            500,
        ));

        let manager = UploadSessionManager::new(
            auth,
            library_store,
            blobs,
            indexer,
            10 * 1024 * 1024,
            Duration::from_secs(3600),
        );
        (manager, owner, library_id)
    }

    #[test]
    fn given_non_owner_when_initiating_then_unauthorized() {
        let (manager, _owner, library_id) = build_manager();
        let result = manager.initiate(
            Uuid::new_v4(),
            library_id,
            "doc.md".to_string(),
            "text/markdown".to_string(),
            100,
            50,
        );
        assert!(result.is_err());
    }

    #[test]
    fn given_full_upload_when_completed_then_file_is_indexed() {
        let (manager, owner, library_id) = build_manager();
        let content = b"Hello world. This document has enough words to form a chunk and section.";
        let chunk_size = 20u64;

        let session_id = manager
            .initiate(
                owner,
                library_id,
                "doc.md".to_string(),
                "text/markdown".to_string(),
                content.len() as u64,
                chunk_size,
            )
            .unwrap();

        for (i, piece) in content.chunks(chunk_size as usize).enumerate() {
            manager.upload_chunk(session_id, i as u32, piece).unwrap();
        }

        let status = manager.get_status(session_id).unwrap();
        assert_eq!(status.status, UploadSessionStatus::Complete);

        let file_id = manager.complete(session_id, &CancellationToken::new()).unwrap();
        assert_ne!(file_id, Uuid::nil());

        assert!(manager.get_status(session_id).is_err());
    }

    #[test]
    fn given_duplicate_chunk_when_uploading_then_conflict_error() {
        let (manager, owner, library_id) = build_manager();
        let session_id = manager
            .initiate(owner, library_id, "doc.md".to_string(), "text/markdown".to_string(), 40, 20)
            .unwrap();

        manager.upload_chunk(session_id, 0, &[0u8; 20]).unwrap();
        let result = manager.upload_chunk(session_id, 0, &[0u8; 20]);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), knowbase_core::error::KbErrorKind::Conflict);
    }

    #[test]
    fn given_cancelled_session_when_getting_status_then_not_found() {
        let (manager, owner, library_id) = build_manager();
        let session_id = manager
            .initiate(owner, library_id, "doc.md".to_string(), "text/markdown".to_string(), 40, 20)
            .unwrap();

        manager.cancel(session_id).unwrap();
        assert!(manager.get_status(session_id).is_err());
    }
}
