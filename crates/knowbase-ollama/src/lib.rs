pub mod embedder;
pub mod tokenizer;

pub use embedder::OllamaEmbedder;
pub use tokenizer::Cl100kTokenizer;
