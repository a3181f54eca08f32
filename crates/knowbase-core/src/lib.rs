pub mod cancel;
pub mod error;
pub mod hashing;
pub mod model;
pub mod ports;
pub mod retry;
pub mod vector;

pub use cancel::CancellationToken;
pub use error::{KbError, KbErrorKind, KbResult};
pub use ports::{BlobStore, ChunkVectorStore, Embedder, KnowledgeStore, LibraryStore, Tokenizer};
