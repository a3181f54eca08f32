//! C4 — lazy segmentation of a text stream on ordered break markers.

use std::io::Read;

use knowbase_core::cancel::CancellationToken;
use knowbase_core::error::KbResult;

const REFILL_BYTES: usize = 8 * 1024;

/// A break marker. `LineStart` only matches right after a `\n` (never at
/// buffer offset 0, which is never a cut point — see [`SegmentReader::next`]);
/// the cut falls *before* the marker, so the marker opens the next segment.
/// `Inline` matches anywhere; the cut falls *after* the marker, so the
/// terminator stays with the segment it closes.
#[derive(Debug, Clone, Copy)]
pub enum BreakMarker {
    LineStart(&'static str),
    Inline(&'static str),
}

/// The markdown preset named in spec §4.1: headings, blank lines, list
/// bullets, fenced code, hard line breaks, sentence terminators.
pub fn markdown_preset() -> Vec<BreakMarker> {
    vec![
        BreakMarker::LineStart("###### "),
        BreakMarker::LineStart("##### "),
        BreakMarker::LineStart("#### "),
        BreakMarker::LineStart("### "),
        BreakMarker::LineStart("## "),
        BreakMarker::LineStart("# "),
        BreakMarker::Inline("\n\n"),
        BreakMarker::LineStart("- "),
        BreakMarker::LineStart("* "),
        BreakMarker::LineStart("```"),
        BreakMarker::Inline("  \n"),
        BreakMarker::Inline(". "),
        BreakMarker::Inline("? "),
        BreakMarker::Inline("! "),
    ]
}

/// Finds the earliest valid cut position in `buffer` across `markers`.
/// Ties broken by marker order. Returns `None` if no marker occurs.
fn find_cut(buffer: &str, markers: &[BreakMarker]) -> Option<usize> {
    let mut best: Option<usize> = None;

    for marker in markers {
        let candidate = match marker {
            BreakMarker::LineStart(pattern) => find_line_start_cut(buffer, pattern),
            BreakMarker::Inline(pattern) => buffer.find(pattern).map(|at| at + pattern.len()),
        };

        let Some(candidate) = candidate.filter(|&c| c > 0 && c < buffer.len()) else {
            continue;
        };

        let replace = match best {
            Some(current) => candidate < current,
            None => true,
        };
        if replace {
            best = Some(candidate);
        }
    }

    best
}

fn find_line_start_cut(buffer: &str, pattern: &str) -> Option<usize> {
    let bytes = buffer.as_bytes();
    let mut search_from = 0;

    while let Some(relative) = buffer[search_from..].find(pattern) {
        let at = search_from + relative;
        if at > 0 && bytes[at - 1] == b'\n' {
            return Some(at);
        }
        search_from = at + 1;
        if search_from >= buffer.len() {
            break;
        }
    }

    None
}

/// Pulls bytes from an underlying reader and yields segments one at a time.
/// Non-restartable: once `next()` returns `Ok(None)` every subsequent call
/// does the same.
pub struct SegmentReader<R> {
    reader: R,
    markers: Vec<BreakMarker>,
    buffer: String,
    leftover: Vec<u8>,
    exhausted: bool,
    finished: bool,
}

impl<R: Read> SegmentReader<R> {
    pub fn new(reader: R, markers: Vec<BreakMarker>) -> Self {
        Self {
            reader,
            markers,
            buffer: String::new(),
            leftover: Vec::new(),
            exhausted: false,
            finished: false,
        }
    }

    pub fn with_markdown_preset(reader: R) -> Self {
        Self::new(reader, markdown_preset())
    }

    /// Returns the next segment, or `Ok(None)` at end of stream. Segments
    /// preserve original whitespace verbatim (lossless reassembly modulo
    /// segmentation, per spec §4.1).
    pub fn next_segment(&mut self, cancel: &CancellationToken) -> KbResult<Option<String>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            cancel.check()?;

            if let Some(cut) = find_cut(&self.buffer, &self.markers) {
                let segment = self.buffer[..cut].to_string();
                self.buffer.drain(..cut);
                return Ok(Some(segment));
            }

            if self.exhausted {
                self.finished = true;
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.buffer)));
            }

            self.refill()?;
        }
    }

    fn refill(&mut self) -> KbResult<()> {
        let mut chunk = vec![0u8; REFILL_BYTES];
        let read = self.reader.read(&mut chunk)?;

        if read == 0 {
            self.exhausted = true;
            return Ok(());
        }

        self.leftover.extend_from_slice(&chunk[..read]);

        match std::str::from_utf8(&self.leftover) {
            Ok(valid) => {
                self.buffer.push_str(valid);
                self.leftover.clear();
            }
            Err(error) => {
                let valid_up_to = error.valid_up_to();
                let valid = std::str::from_utf8(&self.leftover[..valid_up_to])
                    .expect("prefix validated by from_utf8 error");
                self.buffer.push_str(valid);
                self.leftover.drain(..valid_up_to);
            }
        }

        Ok(())
    }
}
