pub mod config;
pub mod logging;
pub mod service;

pub use config::Config;
pub use logging::install_tracing_subscriber;
pub use service::{FileInfo, KnowledgeBaseService};
