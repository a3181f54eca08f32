use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Ordered so that `effective >= required` (spec §4.8) is a plain comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionKind {
    None,
    Read,
    Write,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub roles: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Library {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: Uuid,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryPermission {
    pub id: Uuid,
    pub library_id: Uuid,
    pub user_id: Uuid,
    pub kind: PermissionKind,
    pub granted_by_user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryFile {
    pub id: Uuid,
    pub library_id: Uuid,
    pub original_file_name: String,
    pub content_type: String,
    pub size_in_bytes: u64,
    pub relative_path: String,
    pub hash: Vec<u8>,
    pub uploaded_by_user_id: Uuid,
    pub uploaded_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnowledgeFileStatus {
    Pending,
    Indexing,
    Indexed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeFile {
    pub id: Uuid,
    pub name: String,
    pub hash: Vec<u8>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: KnowledgeFileStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeFileSection {
    pub id: Uuid,
    pub file_id: Uuid,
    pub section_index: u32,
    pub summary: Option<String>,
    pub additional_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeFileChunk {
    pub id: Uuid,
    pub section_id: Uuid,
    pub file_id: Uuid,
    pub chunk_index: u32,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedUploadSession {
    pub session_id: Uuid,
    pub library_id: Uuid,
    pub original_file_name: String,
    pub content_type: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub uploaded_by_user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub temp_blob_path: String,
    pub uploaded_chunks: HashSet<u32>,
}

impl ChunkedUploadSession {
    pub fn total_chunks(&self) -> u32 {
        (self.total_size.div_ceil(self.chunk_size)) as u32
    }

    pub fn is_complete(&self) -> bool {
        let total = self.total_chunks();
        total > 0 && (0..total).all(|n| self.uploaded_chunks.contains(&n))
    }
}

/// Outcome of an `index()` call (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed { file_id: Uuid },
    UpToDate { file_id: Uuid },
    InProgress,
    Failed { file_id: Uuid, reason: String },
}
