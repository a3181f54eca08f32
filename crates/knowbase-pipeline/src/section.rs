//! C6 — groups chunks into semantically coherent sections via embedding
//! similarity statistics. The analytical core of the indexing pipeline.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;

use knowbase_core::cancel::CancellationToken;
use knowbase_core::error::KbResult;
use knowbase_core::ports::{Embedder, Tokenizer};
use knowbase_core::retry::{with_bounded_retry, RetryPolicy};
use knowbase_core::vector::{cosine, mean, normalize, stddev, RunningCentroid};

use crate::chunk::{ChunkReader, ChunkReaderConfig, default_stop_signals};

#[derive(Debug, Clone)]
pub struct SectionReaderConfig {
    pub max_tokens_per_section: usize,
    pub lookahead_buffer_size: usize,
    pub std_dev_multiplier: f32,
    pub minimum_similarity_threshold: f32,
    pub token_strictness_threshold: f32,
    pub minimum_chunks_per_section: usize,
    pub minimum_tokens_per_section: usize,
    pub stop_signals: Vec<&'static str>,
}

impl Default for SectionReaderConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_section: 2048,
            lookahead_buffer_size: 150,
            std_dev_multiplier: 1.0,
            minimum_similarity_threshold: 0.65,
            token_strictness_threshold: 0.75,
            minimum_chunks_per_section: 2,
            minimum_tokens_per_section: 64,
            stop_signals: default_stop_signals(),
        }
    }
}

/// A chunk produced by the pipeline before it has been assigned storage
/// identifiers; the indexer (C10) turns these into persisted rows.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChunk {
    pub content: String,
    pub embedding: Vec<f32>,
    pub tokens: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSection {
    pub chunks: Vec<PendingChunk>,
}

impl PendingSection {
    pub fn total_tokens(&self) -> usize {
        self.chunks.iter().map(|c| c.tokens).sum()
    }
}

pub struct SectionReader<R> {
    chunks: ChunkReader<R>,
    embedder: Arc<dyn Embedder>,
    tokenizer: Arc<dyn Tokenizer>,
    config: SectionReaderConfig,
    retry_policy: RetryPolicy,
    lookahead: VecDeque<PendingChunk>,
    pipeline_exhausted: bool,
    emitted: Vec<PendingChunk>,
    emitted_tokens: usize,
    centroid: RunningCentroid,
    finished: bool,
}

impl<R: Read> SectionReader<R> {
    pub fn new(
        chunks: ChunkReader<R>,
        embedder: Arc<dyn Embedder>,
        tokenizer: Arc<dyn Tokenizer>,
        config: SectionReaderConfig,
    ) -> Self {
        let dim = embedder.dimensions();
        Self {
            chunks,
            embedder,
            tokenizer,
            config,
            retry_policy: RetryPolicy::default(),
            lookahead: VecDeque::new(),
            pipeline_exhausted: false,
            emitted: Vec::new(),
            emitted_tokens: 0,
            centroid: RunningCentroid::new(dim),
            finished: false,
        }
    }

    /// Pulls chunks from C5 until the lookahead buffer holds
    /// `lookahead_buffer_size` items or the chunk reader is exhausted,
    /// embedding (and unit-normalising) each newly seen chunk.
    fn refill_lookahead(&mut self, cancel: &CancellationToken) -> KbResult<()> {
        while !self.pipeline_exhausted && self.lookahead.len() < self.config.lookahead_buffer_size
        {
            cancel.check()?;

            let Some(content) = self.chunks.next_chunk(cancel)? else {
                self.pipeline_exhausted = true;
                break;
            };

            let tokens = self.tokenizer.count_tokens(&content)?;
            let mut embedding = with_bounded_retry(self.retry_policy, cancel, || {
                self.embedder.embed(&content, cancel)
            })?;
            normalize(&mut embedding)?;

            self.lookahead.push_back(PendingChunk {
                content,
                embedding,
                tokens,
            });
        }

        Ok(())
    }

    fn adjacent_similarities(&self) -> Vec<f32> {
        self.lookahead
            .iter()
            .zip(self.lookahead.iter().skip(1))
            .map(|(a, b)| cosine(&a.embedding, &b.embedding))
            .collect()
    }

    fn effective_threshold(&self) -> f32 {
        let similarities = self.adjacent_similarities();
        let mu = mean(&similarities);
        let sigma = stddev(&similarities);
        let tau = (mu - self.config.std_dev_multiplier * sigma)
            .max(self.config.minimum_similarity_threshold);

        let t = self.config.token_strictness_threshold;
        let f = self.emitted_tokens as f32 / self.config.max_tokens_per_section as f32;

        if f >= t && t < 1.0 {
            let ramp = ((f - t) / (1.0 - t)).clamp(0.0, 1.0).powi(2);
            tau + (1.0 - tau) * ramp
        } else {
            tau
        }
    }

    fn should_split(&self, next: &PendingChunk) -> bool {
        if self.emitted.len() < self.config.minimum_chunks_per_section
            || self.emitted_tokens < self.config.minimum_tokens_per_section
        {
            return false;
        }

        let f = self.emitted_tokens as f32 / self.config.max_tokens_per_section as f32;
        if f >= 1.0 {
            return true;
        }

        let has_stop_signal = self
            .config
            .stop_signals
            .iter()
            .any(|signal| next.content.contains(signal));
        if has_stop_signal {
            return true;
        }

        let centroid = self.centroid.centroid();
        let similarity = cosine(&centroid, &next.embedding);
        similarity < self.effective_threshold()
    }

    fn take_section(&mut self) -> PendingSection {
        self.emitted_tokens = 0;
        self.centroid = RunningCentroid::new(self.centroid.centroid().len());
        PendingSection {
            chunks: std::mem::take(&mut self.emitted),
        }
    }

    /// Returns the next section, or `Ok(None)` once the underlying stream
    /// is exhausted and every chunk has been emitted.
    pub fn next_section(&mut self, cancel: &CancellationToken) -> KbResult<Option<PendingSection>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            cancel.check()?;
            self.refill_lookahead(cancel)?;

            let Some(next) = self.lookahead.front() else {
                self.finished = true;
                if self.emitted.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_section()));
            };

            if self.emitted.is_empty() {
                let chunk = self.lookahead.pop_front().expect("checked above");
                self.emitted_tokens += chunk.tokens;
                self.centroid.push(&chunk.embedding);
                self.emitted.push(chunk);
                continue;
            }

            if self.should_split(next) {
                return Ok(Some(self.take_section()));
            }

            let chunk = self.lookahead.pop_front().expect("checked above");
            self.emitted_tokens += chunk.tokens;
            self.centroid.push(&chunk.embedding);
            self.emitted.push(chunk);
        }
    }
}
