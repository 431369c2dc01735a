use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed name of the first post in every thread directory.
pub const ROOT_FILENAME: &str = "0000_root.md";
pub const TOMBSTONE_SUFFIX: &str = ".tomb";
pub const POST_EXTENSION: &str = ".md";
/// Per-category metadata file.
pub const CATEGORY_META_FILE: &str = "META.toml";
/// Forum metadata at the repository root.
pub const FORUM_META_FILE: &str = "FORUM.toml";
pub const KEYS_DIR: &str = "keys";
pub const REQUESTS_DIR: &str = "requests";
pub const KEY_EXTENSION: &str = ".pub";

/// Outcome of checking a post's signature against the key store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigStatus {
    Valid,
    Invalid,
    /// No key on file for the author (also the state of a freshly parsed,
    /// not yet verified post).
    Missing,
    /// Signature is fine but `parent` matches no post in the thread.
    Orphaned,
}

impl SigStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigStatus::Valid => "valid",
            SigStatus::Invalid => "invalid",
            SigStatus::Missing => "missing",
            SigStatus::Orphaned => "orphaned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Post {
    pub author: String,
    /// Author fingerprint (first 8 chars of the base64 public key).
    pub pubkey: String,
    pub timestamp: DateTime<Utc>,
    /// Timestamp exactly as written in the file; this is what gets signed.
    pub timestamp_raw: String,
    /// sha-256 hex of the parent file's bytes, empty for thread roots.
    pub parent: String,
    pub signature: String,
    pub body: String,
    pub filename: String,
    /// sha-256 hex of the raw file this post was read from; empty for posts
    /// that only exist in memory.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_hash: String,
    pub sig_status: SigStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig_error: Option<String>,
}

impl Post {
    /// Stand-in for a file that failed to parse, so the thread still renders.
    pub fn placeholder(filename: &str, error: impl ToString) -> Self {
        Self {
            author: String::new(),
            pubkey: String::new(),
            timestamp: DateTime::<Utc>::MIN_UTC,
            timestamp_raw: String::new(),
            parent: String::new(),
            signature: String::new(),
            body: String::new(),
            filename: filename.to_string(),
            content_hash: String::new(),
            sig_status: SigStatus::Invalid,
            sig_error: Some(error.to_string()),
        }
    }

    pub fn is_root(&self) -> bool {
        self.filename == ROOT_FILENAME
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub category_slug: String,
    pub thread_slug: String,
    /// Root first (when present), then ascending timestamp.
    pub posts: Vec<Post>,
    pub has_root: bool,
}

impl Thread {
    pub fn root(&self) -> Option<&Post> {
        if self.has_root { self.posts.first() } else { None }
    }

    pub fn replies(&self) -> &[Post] {
        if self.has_root { &self.posts[1..] } else { &self.posts }
    }
}

/// Cheap list-view summary: only the root is parsed.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadScan {
    pub slug: String,
    pub root: Post,
    pub reply_count: usize,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Category {
    pub slug: String,
    pub name: String,
    pub description: String,
    /// Sorted; only directories that contain a root post.
    pub thread_slugs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Full base64 public key of the admin.
    #[serde(default)]
    pub admin_pubkey: String,
    #[serde(default)]
    pub auto_approve_keys: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub username: String,
    pub public_key: String,
}
