//! C10 — orchestrates C4 through C9 into one idempotent `index()` call
//! (spec §4.4): hash the blob, skip unchanged files, purge-then-rebuild
//! sections/chunks/vectors, persist section-by-section.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use knowbase_core::cancel::CancellationToken;
use knowbase_core::hashing::StreamHasher;
use knowbase_core::model::{IndexOutcome, KnowledgeFile, KnowledgeFileChunk, KnowledgeFileSection, KnowledgeFileStatus};
use knowbase_core::ports::{BlobStore, ChunkVectorStore, Embedder, KnowledgeStore, Tokenizer};
use knowbase_pipeline::{ChunkReader, ChunkReaderConfig, SectionReader, SectionReaderConfig, SegmentReader};

/// Identifies the blob an `index()` call should read, independent of how
/// it got there (chunked upload completion, a backfill job, ...).
#[derive(Debug, Clone)]
pub struct FileSource {
    pub file_id: Uuid,
    pub name: String,
    pub relative_path: String,
}

pub struct Indexer {
    store: Arc<dyn KnowledgeStore>,
    vectors: Arc<dyn ChunkVectorStore>,
    blobs: Arc<dyn BlobStore>,
    embedder: Arc<dyn Embedder>,
    tokenizer: Arc<dyn Tokenizer>,
    section_config: SectionReaderConfig,
    chunk_max_tokens_per_chunk: usize,
    in_progress: Mutex<HashSet<Uuid>>,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        vectors: Arc<dyn ChunkVectorStore>,
        blobs: Arc<dyn BlobStore>,
        embedder: Arc<dyn Embedder>,
        tokenizer: Arc<dyn Tokenizer>,
        section_config: SectionReaderConfig,
        chunk_max_tokens_per_chunk: usize,
    ) -> Self {
        Self {
            store,
            vectors,
            blobs,
            embedder,
            tokenizer,
            section_config,
            chunk_max_tokens_per_chunk,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    /// Never returns `Err`: every failure mode is folded into
    /// `IndexOutcome::Failed` per spec §4.4 step 6.
    pub fn index(&self, source: &FileSource, cancel: &CancellationToken) -> IndexOutcome {
        if !self.in_progress.lock().unwrap().insert(source.file_id) {
            return IndexOutcome::InProgress;
        }

        let outcome = self.index_locked(source, cancel);

        self.in_progress.lock().unwrap().remove(&source.file_id);
        outcome
    }

    fn index_locked(&self, source: &FileSource, cancel: &CancellationToken) -> IndexOutcome {
        match self.try_index(source, cancel) {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(file_id = %source.file_id, error = %error, "indexing failed");
                self.mark_failed(source);
                IndexOutcome::Failed {
                    file_id: source.file_id,
                    reason: error.to_string(),
                }
            }
        }
    }

    fn mark_failed(&self, source: &FileSource) {
        let _ = self.store.delete_by_file(source.file_id);
        let failed = KnowledgeFile {
            id: source.file_id,
            name: source.name.clone(),
            hash: Vec::new(),
            processed_at: None,
            status: KnowledgeFileStatus::Failed,
        };
        let _ = self.store.update_file(&failed);
    }

    fn try_index(
        &self,
        source: &FileSource,
        cancel: &CancellationToken,
    ) -> knowbase_core::error::KbResult<IndexOutcome> {
        let hash = StreamHasher::hash_reader(self.blobs.open_read(&source.relative_path)?)?;

        let existing = self.store.get_file_by_id(source.file_id)?;
        if let Some(existing) = &existing {
            if existing.hash == hash {
                return Ok(IndexOutcome::UpToDate {
                    file_id: source.file_id,
                });
            }
        }

        self.purge_existing(source.file_id)?;

        let indexing = KnowledgeFile {
            id: source.file_id,
            name: source.name.clone(),
            hash: hash.clone(),
            processed_at: None,
            status: KnowledgeFileStatus::Indexing,
        };
        if existing.is_some() {
            self.store.update_file(&indexing)?;
        } else {
            self.store.add_file(&indexing)?;
        }

        self.rebuild_sections(source, cancel)?;

        let indexed = KnowledgeFile {
            id: source.file_id,
            name: source.name.clone(),
            hash,
            processed_at: Some(Utc::now()),
            status: KnowledgeFileStatus::Indexed,
        };
        self.store.update_file(&indexed)?;

        Ok(IndexOutcome::Indexed {
            file_id: source.file_id,
        })
    }

    fn purge_existing(&self, file_id: Uuid) -> knowbase_core::error::KbResult<()> {
        self.remove_vectors_for_file(file_id)?;
        self.store.delete_by_file(file_id)
    }

    fn remove_vectors_for_file(&self, file_id: Uuid) -> knowbase_core::error::KbResult<()> {
        for section in self.store.get_sections_for_file(file_id)? {
            for chunk in self.store.get_chunks_for_section(section.id)? {
                self.vectors.remove(chunk.id)?;
            }
        }
        Ok(())
    }

    /// Removes a file and every section/chunk/vector entry it owns.
    /// Unlike the re-index purge this also drops the `knowledge_file` row
    /// itself — used when a file is being removed from its library, not
    /// rebuilt in place.
    pub fn purge(&self, file_id: Uuid) -> knowbase_core::error::KbResult<()> {
        self.remove_vectors_for_file(file_id)?;
        self.store.delete_file(file_id)
    }

    fn rebuild_sections(
        &self,
        source: &FileSource,
        cancel: &CancellationToken,
    ) -> knowbase_core::error::KbResult<()> {
        let reader = self.blobs.open_read(&source.relative_path)?;
        let segments = SegmentReader::with_markdown_preset(reader);
        let chunk_config = ChunkReaderConfig::new(self.chunk_max_tokens_per_chunk);
        let chunks = ChunkReader::new(segments, Arc::clone(&self.tokenizer), chunk_config);
        let mut sections = SectionReader::new(
            chunks,
            Arc::clone(&self.embedder),
            Arc::clone(&self.tokenizer),
            self.section_config.clone(),
        );

        let mut section_index = 0u32;
        while let Some(pending) = sections.next_section(cancel)? {
            let section_id = Uuid::new_v4();
            self.store.add_section(&KnowledgeFileSection {
                id: section_id,
                file_id: source.file_id,
                section_index,
                summary: None,
                additional_context: None,
            })?;

            for (chunk_index, pending_chunk) in pending.chunks.into_iter().enumerate() {
                let chunk_id = Uuid::new_v4();
                self.store.add_chunk(&KnowledgeFileChunk {
                    id: chunk_id,
                    section_id,
                    file_id: source.file_id,
                    chunk_index: chunk_index as u32,
                    content: pending_chunk.content,
                    embedding: Some(pending_chunk.embedding.clone()),
                })?;
                self.vectors.add(chunk_id, &pending_chunk.embedding)?;
            }

            section_index += 1;
        }

        Ok(())
    }
}
