pub mod blob_store;
pub mod codec;
pub mod knowledge_store;
pub mod library_store;
pub mod migrations;
pub mod vector_store;

pub use blob_store::LocalBlobStore;
pub use knowledge_store::SqliteKnowledgeStore;
pub use library_store::SqliteLibraryStore;
pub use vector_store::InMemoryChunkVectorStore;
