use std::time::Duration;

use crate::crypto::CryptoError;
use crate::git::GitError;
use crate::membership::MembershipError;
use crate::repo::RepoError;
use crate::thread::ForumError;

/// Coarse classification for surfaces that need to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Forbidden,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)] Repo(#[from] RepoError),
    #[error(transparent)] Forum(#[from] ForumError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error("forum is not initialised")] NotInitialised,
    #[error("forum is already initialised")] AlreadyInitialised,
    #[error("no identity loaded")] NoIdentity,
    #[error("{} timed out after {}s", .0, .1.as_secs())] Timeout(&'static str, Duration),
    #[error("background task failed: {0}")] Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Repo(e) => repo_kind(e),
            Error::Forum(e) => forum_kind(e),
            Error::Crypto(_) => ErrorKind::BadRequest,
            Error::NotInitialised | Error::NoIdentity => ErrorKind::Unavailable,
            Error::AlreadyInitialised => ErrorKind::Conflict,
            Error::Timeout(..) => ErrorKind::Unavailable,
            Error::Task(_) => ErrorKind::Internal,
        }
    }
}

fn forum_kind(e: &ForumError) -> ErrorKind {
    match e {
        ForumError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        ForumError::MissingCategoryMeta(_) => ErrorKind::NotFound,
        ForumError::InvalidSlug(_) => ErrorKind::BadRequest,
        _ => ErrorKind::Internal,
    }
}

fn repo_kind(e: &RepoError) -> ErrorKind {
    match e {
        RepoError::NotAdmin(_) => ErrorKind::Forbidden,
        RepoError::InvalidSlug(_) | RepoError::InvalidFilename(_) | RepoError::Crypto(_) => ErrorKind::BadRequest,
        RepoError::CategoryNotFound(_) | RepoError::ThreadNotFound(_) | RepoError::PostNotFound(_) => ErrorKind::NotFound,
        RepoError::CategoryExists(_)
        | RepoError::ThreadExists(_)
        | RepoError::PostExists(_)
        | RepoError::AlreadyTombstoned(_)
        | RepoError::AlreadyInitialised(_) => ErrorKind::Conflict,
        RepoError::Membership(MembershipError::NotPending(_)) => ErrorKind::NotFound,
        RepoError::Membership(MembershipError::AlreadyApproved(_) | MembershipError::AlreadyPending(_)) => {
            ErrorKind::Conflict
        }
        RepoError::Forum(f) => forum_kind(f),
        RepoError::Git(GitError::MergeConflict { .. } | GitError::PushRejected { .. }) => ErrorKind::Conflict,
        RepoError::Git(GitError::Timeout { .. } | GitError::NoRemote(_)) => ErrorKind::Unavailable,
        _ => ErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(Error::from(RepoError::NotAdmin("bob".into())).kind(), ErrorKind::Forbidden);
        assert_eq!(Error::from(RepoError::ThreadExists("g/t".into())).kind(), ErrorKind::Conflict);
        assert_eq!(
            Error::from(RepoError::Membership(MembershipError::NotPending("x".into()))).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(Error::from(ForumError::MissingCategoryMeta("c".into())).kind(), ErrorKind::NotFound);
        assert_eq!(Error::NotInitialised.kind(), ErrorKind::Unavailable);
        assert_eq!(Error::Timeout("sync", Duration::from_secs(30)).to_string(), "sync timed out after 30s");
    }
}
