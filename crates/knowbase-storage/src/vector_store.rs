//! C9 — in-memory linear-scan chunk vector store (spec §4.5). Deliberately
//! not backed by a SQL vector extension: the spec calls for "a contiguous
//! array of normalised vectors", rehydrated from the chunk store on
//! reload, not a persisted index of its own. See DESIGN.md for the note on
//! dropping the teacher's `sqlite-vec` dependency.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use knowbase_core::error::{KbError, KbResult};
use knowbase_core::ports::{ChunkVectorStore, KnowledgeStore};
use knowbase_core::vector::cosine;

pub struct InMemoryChunkVectorStore {
    entries: RwLock<HashMap<Uuid, Vec<f32>>>,
}

impl InMemoryChunkVectorStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuilds the index from every embedded chunk currently in `store`
    /// (spec §4.5: "derived on reload by rehydration from the chunk
    /// store"). `file_ids` is the complete set of files to scan.
    pub fn rehydrate(store: &dyn KnowledgeStore, file_ids: &[Uuid]) -> KbResult<Self> {
        let rehydrated = Self::new();
        for &file_id in file_ids {
            for section in store.get_sections_for_file(file_id)? {
                for chunk in store.get_chunks_for_section(section.id)? {
                    if let Some(embedding) = chunk.embedding {
                        rehydrated.add(chunk.id, &embedding)?;
                    }
                }
            }
        }
        Ok(rehydrated)
    }
}

impl Default for InMemoryChunkVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkVectorStore for InMemoryChunkVectorStore {
    fn add(&self, chunk_id: Uuid, vector: &[f32]) -> KbResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| KbError::storage("chunk vector store lock poisoned"))?;

        if let Some(existing_dim) = entries.values().next().map(|v| v.len()) {
            if existing_dim != vector.len() {
                return Err(KbError::integrity(format!(
                    "vector dimension mismatch: store holds {existing_dim}, got {}",
                    vector.len()
                )));
            }
        }

        entries.insert(chunk_id, vector.to_vec());
        Ok(())
    }

    fn remove(&self, chunk_id: Uuid) -> KbResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| KbError::storage("chunk vector store lock poisoned"))?;
        entries.remove(&chunk_id);
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> KbResult<Vec<(Uuid, f32)>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| KbError::storage("chunk vector store lock poisoned"))?;

        if let Some(existing_dim) = entries.values().next().map(|v| v.len()) {
            if existing_dim != query.len() {
                return Err(KbError::integrity(format!(
                    "vector dimension mismatch: store holds {existing_dim}, query has {}",
                    query.len()
                )));
            }
        }

        let mut scored: Vec<(Uuid, f32)> = entries
            .iter()
            .map(|(&id, vector)| (id, cosine(vector, query)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }
}
