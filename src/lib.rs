pub mod config;
pub mod crypto;
pub mod error;
pub mod git;
pub mod membership;
pub mod models;
pub mod post;
pub mod repo;
pub mod service;
pub mod store;
pub mod thread;

// Re-export commonly used items for tests / external users
pub use crypto::Identity;
pub use error::{Error, ErrorKind, Result};
pub use repo::{Repo, RepoError};
pub use service::{ForumService, ForumStatus, SyncReport};
pub use thread::{ForumReader, WorkingTree};
