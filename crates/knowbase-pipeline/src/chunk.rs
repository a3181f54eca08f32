//! C5 — packs segments into token-bounded chunks, honouring stop signals.

use std::io::Read;
use std::sync::Arc;

use knowbase_core::cancel::CancellationToken;
use knowbase_core::error::KbResult;
use knowbase_core::ports::Tokenizer;

use crate::segment::SegmentReader;

/// Substrings that, when observed inside a segment, force the current
/// accumulator to be emitted before that segment starts (spec §4.2).
pub fn default_stop_signals() -> Vec<&'static str> {
    vec!["\n# ", "```", "**"]
}

#[derive(Debug, Clone)]
pub struct ChunkReaderConfig {
    pub max_tokens_per_chunk: usize,
    pub stop_signals: Vec<&'static str>,
}

impl ChunkReaderConfig {
    pub fn new(max_tokens_per_chunk: usize) -> Self {
        Self {
            max_tokens_per_chunk,
            stop_signals: default_stop_signals(),
        }
    }
}

pub struct ChunkReader<R> {
    segments: SegmentReader<R>,
    tokenizer: Arc<dyn Tokenizer>,
    config: ChunkReaderConfig,
    accumulator: Vec<String>,
    accumulated_tokens: usize,
    finished: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(segments: SegmentReader<R>, tokenizer: Arc<dyn Tokenizer>, config: ChunkReaderConfig) -> Self {
        Self {
            segments,
            tokenizer,
            config,
            accumulator: Vec::new(),
            accumulated_tokens: 0,
            finished: false,
        }
    }

    fn flush(&mut self) -> String {
        self.accumulated_tokens = 0;
        self.accumulator.drain(..).collect::<Vec<_>>().join("")
    }

    pub fn next_chunk(&mut self, cancel: &CancellationToken) -> KbResult<Option<String>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            cancel.check()?;

            let segment = match self.segments.next_segment(cancel)? {
                Some(segment) => segment,
                None => {
                    self.finished = true;
                    if self.accumulator.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(self.flush()));
                }
            };

            let segment_tokens = self.tokenizer.count_tokens(&segment)?;
            let has_stop_signal = self
                .config
                .stop_signals
                .iter()
                .any(|signal| segment.contains(signal));

            if has_stop_signal && !self.accumulator.is_empty() {
                let emitted = self.flush();
                self.accumulator.push(segment);
                self.accumulated_tokens = segment_tokens;
                return Ok(Some(emitted));
            }

            if self.accumulator.is_empty() && segment_tokens > self.config.max_tokens_per_chunk {
                return Ok(Some(segment));
            }

            if !self.accumulator.is_empty()
                && self.accumulated_tokens + segment_tokens > self.config.max_tokens_per_chunk
            {
                let emitted = self.flush();
                self.accumulator.push(segment);
                self.accumulated_tokens = segment_tokens;
                return Ok(Some(emitted));
            }

            self.accumulator.push(segment);
            self.accumulated_tokens += segment_tokens;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentReader;

    struct WordCountTokenizer;

    impl Tokenizer for WordCountTokenizer {
        fn count_tokens(&self, text: &str) -> KbResult<usize> {
            Ok(text.split_whitespace().count())
        }
    }

    fn chunk_all(content: &str, max_tokens: usize) -> Vec<String> {
        let segments = SegmentReader::with_markdown_preset(content.as_bytes());
        let mut reader = ChunkReader::new(
            segments,
            Arc::new(WordCountTokenizer),
            ChunkReaderConfig::new(max_tokens),
        );
        let cancel = CancellationToken::new();
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk(&cancel).unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn given_empty_stream_when_chunking_then_yields_no_chunks() {
        assert!(chunk_all("", 100).is_empty());
    }

    #[test]
    fn given_short_content_when_chunking_then_single_chunk_is_produced() {
        let chunks = chunk_all("one two three", 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "one two three");
    }

    #[test]
    fn given_many_small_sentences_when_chunking_then_multiple_chunks_are_produced() {
        let content = "A short sentence goes here. ".repeat(500);
        let chunks = chunk_all(&content, 10);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| !c.trim().is_empty()));
        assert_eq!(chunks.join(""), content);
    }

    #[test]
    fn given_oversized_single_segment_when_chunking_then_it_is_emitted_alone() {
        let huge_sentence = format!("{}.", "word ".repeat(200));
        let chunks = chunk_all(&huge_sentence, 5);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], huge_sentence);
    }

    #[test]
    fn given_stop_signal_when_chunking_then_accumulator_flushes_before_it() {
        let content = "Intro text here. This has **bold** word next.";
        let chunks = chunk_all(content, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "Intro text here. ");
        assert!(chunks[1].contains("**bold**"));
    }

    #[test]
    fn given_chunks_when_rejoined_then_original_content_is_preserved() {
        let content = "First. Second. Third paragraph goes here with more words to pack.";
        let chunks = chunk_all(content, 4);
        assert_eq!(chunks.join(""), content);
    }
}
