//! C13 — embeds a query, retrieves the closest chunks, groups them into
//! their owning sections and scores each section's relevance.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use knowbase_core::cancel::CancellationToken;
use knowbase_core::error::KbError;
use knowbase_core::model::{KnowledgeFileChunk, KnowledgeFileSection};
use knowbase_core::ports::{ChunkVectorStore, Embedder, KnowledgeStore};
use knowbase_core::vector::{mean, sigmoid, stddev};

const CONTEXT_SECTION_START: &str = "--- START OF NEW CONTEXT SECTION ---";
const CONTEXT_SECTION_END: &str = "--- END OF CONTEXT SEARCH RESULT ---";

#[derive(Debug, Clone, PartialEq)]
pub struct SectionRelevanceMetrics {
    pub max_sim: f32,
    pub mean_top_k: f32,
    pub coverage: f32,
    pub normalized_score: f32,
    pub composite: f32,
    pub relevance_score: u32,
}

#[derive(Debug, Clone)]
pub struct RelevanceRatedEntry {
    pub section: KnowledgeFileSection,
    pub chunks: Vec<KnowledgeFileChunk>,
    pub metrics: SectionRelevanceMetrics,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub success: bool,
    pub retryable: bool,
    pub error: Option<String>,
    pub entries: Vec<RelevanceRatedEntry>,
    pub context: String,
}

impl SearchResult {
    fn failure(error: String, retryable: bool) -> Self {
        Self {
            success: false,
            retryable,
            error: Some(error),
            entries: Vec::new(),
            context: String::new(),
        }
    }
}

pub struct Searcher {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn ChunkVectorStore>,
    store: Arc<dyn KnowledgeStore>,
}

impl Searcher {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn ChunkVectorStore>,
        store: Arc<dyn KnowledgeStore>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            store,
        }
    }

    pub fn search(&self, query: &str, k: usize, cancel: &CancellationToken) -> SearchResult {
        match self.try_search(query, k, cancel) {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(%error, "search failed");
                SearchResult::failure(error.to_string(), error.retryable())
            }
        }
    }

    fn try_search(
        &self,
        query: &str,
        k: usize,
        cancel: &CancellationToken,
    ) -> knowbase_core::error::KbResult<SearchResult> {
        let query_vector = self.embedder.embed(query, cancel)?;
        let hits = self.vectors.search(&query_vector, k)?;
        if hits.is_empty() {
            return Ok(SearchResult {
                success: true,
                retryable: false,
                error: None,
                entries: Vec::new(),
                context: String::new(),
            });
        }

        let hit_ids: Vec<Uuid> = hits.iter().map(|(id, _)| *id).collect();
        let chunks = self.store.get_chunks_by_ids(&hit_ids)?;
        let chunk_by_id: HashMap<Uuid, KnowledgeFileChunk> =
            chunks.into_iter().map(|c| (c.id, c)).collect();

        let clamped_hits: Vec<(Uuid, f32)> = hits
            .into_iter()
            .filter(|(id, _)| chunk_by_id.contains_key(id))
            .map(|(id, cos)| (id, cos.clamp(0.0, 1.0)))
            .collect();

        let global_values: Vec<f32> = clamped_hits.iter().map(|(_, v)| *v).collect();
        let mu_g = mean(&global_values);
        let sigma_g = stddev(&global_values);

        let mut hits_by_section: HashMap<Uuid, (Uuid, Vec<f32>)> = HashMap::new();
        for (id, cos) in &clamped_hits {
            let chunk = &chunk_by_id[id];
            hits_by_section
                .entry(chunk.section_id)
                .or_insert_with(|| (chunk.file_id, Vec::new()))
                .1
                .push(*cos);
        }

        let mut sections_by_file: HashMap<Uuid, Vec<KnowledgeFileSection>> = HashMap::new();
        let mut entries = Vec::new();
        for (section_id, (file_id, hit_values)) in hits_by_section {
            let sections = match sections_by_file.get(&file_id) {
                Some(sections) => sections,
                None => {
                    let sections = self.store.get_sections_for_file(file_id)?;
                    sections_by_file.entry(file_id).or_insert(sections)
                }
            };
            let Some(section) = sections.iter().find(|s| s.id == section_id).cloned() else {
                continue;
            };
            let all_chunks = self.store.get_chunks_for_section(section_id)?;
            let metrics = score_section(&hit_values, all_chunks.len(), mu_g, sigma_g);

            entries.push(RelevanceRatedEntry {
                section,
                chunks: all_chunks,
                metrics,
            });
        }

        entries.sort_by(|a, b| {
            b.metrics
                .composite
                .partial_cmp(&a.metrics.composite)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.metrics
                        .normalized_score
                        .partial_cmp(&a.metrics.normalized_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.section.file_id.cmp(&b.section.file_id))
                .then_with(|| a.section.section_index.cmp(&b.section.section_index))
        });

        let context = render_context(&entries);

        Ok(SearchResult {
            success: true,
            retryable: false,
            error: None,
            entries,
            context,
        })
    }
}

fn score_section(hit_values: &[f32], total_chunks: usize, mu_g: f32, sigma_g: f32) -> SectionRelevanceMetrics {
    let max_sim = hit_values.iter().cloned().fold(0.0f32, f32::max);

    let mut sorted_desc = hit_values.to_vec();
    sorted_desc.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let top_k = &sorted_desc[..sorted_desc.len().min(3)];
    let mean_top_k = mean(top_k);

    let coverage = if total_chunks == 0 {
        0.0
    } else {
        (hit_values.iter().sum::<f32>() / total_chunks as f32).sqrt()
    };

    let denom = sigma_g.max(1e-12);
    let mean_z = mean(
        &hit_values
            .iter()
            .map(|h| (h - mu_g) / denom)
            .collect::<Vec<_>>(),
    );
    let normalized_score = 100.0 * sigmoid(mean_z);

    let composite = 0.55 * max_sim + 0.35 * mean_top_k + 0.10 * coverage;
    let relevance_score = (100.0 * composite).round() as u32;

    SectionRelevanceMetrics {
        max_sim,
        mean_top_k,
        coverage,
        normalized_score,
        composite,
        relevance_score,
    }
}

fn render_context(entries: &[RelevanceRatedEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(CONTEXT_SECTION_START);
        out.push('\n');
        for chunk in &entry.chunks {
            out.push_str(&chunk.content);
        }
        out.push('\n');
        out.push_str(CONTEXT_SECTION_END);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowbase_core::error::KbResult;
    use knowbase_core::model::KnowledgeFile;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedEmbedder {
        vector: Vec<f32>,
    }

    impl Embedder for FixedEmbedder {
        fn embed(&self, _text: &str, _cancel: &CancellationToken) -> KbResult<Vec<f32>> {
            Ok(self.vector.clone())
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dimensions(&self) -> usize {
            self.vector.len()
        }
    }

    struct FailingEmbedder;

    impl Embedder for FailingEmbedder {
        fn embed(&self, _text: &str, _cancel: &CancellationToken) -> KbResult<Vec<f32>> {
            Err(KbError::embedding("model unreachable"))
        }
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dimensions(&self) -> usize {
            0
        }
    }

    struct FixedVectorStore {
        hits: Vec<(Uuid, f32)>,
    }

    impl ChunkVectorStore for FixedVectorStore {
        fn add(&self, _chunk_id: Uuid, _vector: &[f32]) -> KbResult<()> {
            Ok(())
        }
        fn remove(&self, _chunk_id: Uuid) -> KbResult<()> {
            Ok(())
        }
        fn search(&self, _query: &[f32], k: usize) -> KbResult<Vec<(Uuid, f32)>> {
            Ok(self.hits.iter().take(k).cloned().collect())
        }
    }

    #[derive(Default)]
    struct FakeKnowledgeStore {
        sections: Mutex<HashMap<Uuid, Vec<KnowledgeFileSection>>>,
        chunks: Mutex<HashMap<Uuid, Vec<KnowledgeFileChunk>>>,
        by_id: Mutex<HashMap<Uuid, KnowledgeFileChunk>>,
    }

    impl FakeKnowledgeStore {
        fn seed_section(&self, section: KnowledgeFileSection, chunks: Vec<KnowledgeFileChunk>) {
            self.sections
                .lock()
                .unwrap()
                .entry(section.file_id)
                .or_default()
                .push(section.clone());
            for chunk in &chunks {
                self.by_id.lock().unwrap().insert(chunk.id, chunk.clone());
            }
            self.chunks.lock().unwrap().insert(section.id, chunks);
        }
    }

    impl KnowledgeStore for FakeKnowledgeStore {
        fn add_file(&self, _file: &KnowledgeFile) -> KbResult<()> {
            Ok(())
        }
        fn get_file_by_id(&self, _id: Uuid) -> KbResult<Option<KnowledgeFile>> {
            Ok(None)
        }
        fn update_file(&self, _file: &KnowledgeFile) -> KbResult<()> {
            Ok(())
        }
        fn file_exists(&self, _id: Uuid) -> KbResult<bool> {
            Ok(true)
        }
        fn list_knowledge_file_ids(&self) -> KbResult<Vec<Uuid>> {
            Ok(Vec::new())
        }
        fn add_section(&self, _section: &KnowledgeFileSection) -> KbResult<()> {
            Ok(())
        }
        fn get_section_by_index(
            &self,
            _file_id: Uuid,
            _section_index: u32,
        ) -> KbResult<Option<KnowledgeFileSection>> {
            Ok(None)
        }
        fn get_sections_for_file(&self, file_id: Uuid) -> KbResult<Vec<KnowledgeFileSection>> {
            Ok(self.sections.lock().unwrap().get(&file_id).cloned().unwrap_or_default())
        }
        fn add_chunk(&self, _chunk: &KnowledgeFileChunk) -> KbResult<()> {
            Ok(())
        }
        fn get_chunks_for_section(&self, section_id: Uuid) -> KbResult<Vec<KnowledgeFileChunk>> {
            Ok(self.chunks.lock().unwrap().get(&section_id).cloned().unwrap_or_default())
        }
        fn get_chunks_by_ids(&self, ids: &[Uuid]) -> KbResult<Vec<KnowledgeFileChunk>> {
            let by_id = self.by_id.lock().unwrap();
            Ok(ids.iter().filter_map(|id| by_id.get(id).cloned()).collect())
        }
        fn delete_by_file(&self, _file_id: Uuid) -> KbResult<()> {
            Ok(())
        }
        fn delete_file(&self, _file_id: Uuid) -> KbResult<()> {
            Ok(())
        }
    }

    fn chunk(section_id: Uuid, file_id: Uuid, index: u32, content: &str) -> KnowledgeFileChunk {
        KnowledgeFileChunk {
            id: Uuid::new_v4(),
            section_id,
            file_id,
            chunk_index: index,
            content: content.to_string(),
            embedding: None,
        }
    }

    fn section(file_id: Uuid, index: u32) -> KnowledgeFileSection {
        KnowledgeFileSection {
            id: Uuid::new_v4(),
            file_id,
            section_index: index,
            summary: None,
            additional_context: None,
        }
    }

    #[test]
    fn given_no_hits_when_searching_then_empty_successful_result() {
        let embedder = Arc::new(FixedEmbedder { vector: vec![1.0, 0.0] });
        let vectors = Arc::new(FixedVectorStore { hits: Vec::new() });
        let store = Arc::new(FakeKnowledgeStore::default());
        let searcher = Searcher::new(embedder, vectors, store);

        let result = searcher.search("anything", 5, &CancellationToken::new());
        assert!(result.success);
        assert!(result.entries.is_empty());
        assert_eq!(result.context, "");
    }

    #[test]
    fn given_two_sections_when_searching_then_best_matching_section_ranks_first() {
        let file_id = Uuid::new_v4();
        let strong_section = section(file_id, 0);
        let weak_section = section(file_id, 1);

        let strong_chunks: Vec<_> = (0..3)
            .map(|i| chunk(strong_section.id, file_id, i, "strong content "))
            .collect();
        let weak_chunks = vec![chunk(weak_section.id, file_id, 0, "weak content ")];

        let store = Arc::new(FakeKnowledgeStore::default());
        store.seed_section(strong_section.clone(), strong_chunks.clone());
        store.seed_section(weak_section.clone(), weak_chunks.clone());

        let hits = vec![
            (strong_chunks[0].id, 0.95),
            (strong_chunks[1].id, 0.9),
            (strong_chunks[2].id, 0.92),
            (weak_chunks[0].id, 0.2),
        ];

        let embedder = Arc::new(FixedEmbedder { vector: vec![1.0, 0.0] });
        let vectors = Arc::new(FixedVectorStore { hits });
        let searcher = Searcher::new(embedder, vectors, store);

        let result = searcher.search("query", 10, &CancellationToken::new());
        assert!(result.success);
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.entries[0].section.id, strong_section.id);
        assert!(result.entries[0].metrics.composite > result.entries[1].metrics.composite);

        let start_idx = result.context.find(CONTEXT_SECTION_START).unwrap();
        assert!(result.context[start_idx..].contains("strong content"));
    }

    #[test]
    fn given_embedder_failure_when_searching_then_retryable_failure_result() {
        let embedder = Arc::new(FailingEmbedder);
        let vectors = Arc::new(FixedVectorStore { hits: Vec::new() });
        let store = Arc::new(FakeKnowledgeStore::default());
        let searcher = Searcher::new(embedder, vectors, store);

        let result = searcher.search("query", 5, &CancellationToken::new());
        assert!(!result.success);
        assert!(result.retryable);
        assert!(result.error.is_some());
    }

    #[test]
    fn given_hit_values_when_scoring_section_then_composite_blends_the_three_signals() {
        let metrics = score_section(&[0.9, 0.8, 0.7], 3, 0.5, 0.2);
        assert!((metrics.max_sim - 0.9).abs() < 1e-6);
        let expected_mean_top = (0.9 + 0.8 + 0.7) / 3.0;
        assert!((metrics.mean_top_k - expected_mean_top).abs() < 1e-6);
        let expected_coverage = (2.4f32 / 3.0).sqrt();
        assert!((metrics.coverage - expected_coverage).abs() < 1e-6);
        let expected_composite = 0.55 * 0.9 + 0.35 * expected_mean_top + 0.10 * expected_coverage;
        assert!((metrics.composite - expected_composite).abs() < 1e-6);
    }
}
