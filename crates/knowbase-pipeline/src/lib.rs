pub mod chunk;
pub mod section;
pub mod segment;

pub use chunk::{ChunkReader, ChunkReaderConfig};
pub use section::{PendingChunk, PendingSection, SectionReader, SectionReaderConfig};
pub use segment::{BreakMarker, SegmentReader};
