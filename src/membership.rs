//! Join-request lifecycle: `none -> pending -> {approved, rejected}`.
//!
//! Transitions only touch the two stores; committing the resulting files is
//! the caller's business.

use tracing::info;

use crate::models::JoinRequest;
use crate::store::{JoinRequestStore, KeyStore, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum MembershipError {
    #[error("@{0} is already approved")] AlreadyApproved(String),
    #[error("a join request for @{0} is already pending")] AlreadyPending(String),
    #[error("no pending join request for @{0}")] NotPending(String),
    #[error(transparent)] Store(#[from] StoreError),
}

pub type MembershipResult<T> = Result<T, MembershipError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    None,
    Pending,
    Approved,
}

/// An approved key wins over a leftover request file.
pub fn state<R, K>(requests: &R, keys: &K, username: &str) -> MembershipResult<RequestState>
where
    R: JoinRequestStore + ?Sized,
    K: KeyStore + ?Sized,
{
    if keys.has_key(username)? {
        Ok(RequestState::Approved)
    } else if requests.get(username)?.is_some() {
        Ok(RequestState::Pending)
    } else {
        Ok(RequestState::None)
    }
}

/// Record a pending request. Never overwrites an existing request or key.
pub fn submit<R, K>(requests: &R, keys: &K, username: &str, public_key: &str) -> MembershipResult<JoinRequest>
where
    R: JoinRequestStore + ?Sized,
    K: KeyStore + ?Sized,
{
    match state(requests, keys, username)? {
        RequestState::Approved => return Err(MembershipError::AlreadyApproved(username.to_string())),
        RequestState::Pending => return Err(MembershipError::AlreadyPending(username.to_string())),
        RequestState::None => {}
    }
    let request = JoinRequest { username: username.to_string(), public_key: public_key.trim().to_string() };
    requests.put(&request)?;
    info!(username, "join request submitted");
    Ok(request)
}

/// Move the pending key into the key store, then drop the request. On
/// success the key is present and the request is gone.
pub fn approve<R, K>(requests: &R, keys: &K, username: &str) -> MembershipResult<JoinRequest>
where
    R: JoinRequestStore + ?Sized,
    K: KeyStore + ?Sized,
{
    let request = requests
        .get(username)?
        .ok_or_else(|| MembershipError::NotPending(username.to_string()))?;
    if keys.has_key(username)? {
        return Err(MembershipError::AlreadyApproved(username.to_string()));
    }
    keys.put_key(&request.username, &request.public_key)?;
    requests.remove(username)?;
    info!(username, "join request approved");
    Ok(request)
}

/// Drop the pending request; no key is written.
pub fn reject<R>(requests: &R, username: &str) -> MembershipResult<JoinRequest>
where
    R: JoinRequestStore + ?Sized,
{
    let request = requests
        .get(username)?
        .ok_or_else(|| MembershipError::NotPending(username.to_string()))?;
    requests.remove(username)?;
    info!(username, "join request rejected");
    Ok(request)
}

/// Pending requests whose username has no approved key yet.
pub fn list_pending<R, K>(requests: &R, keys: &K) -> MembershipResult<Vec<JoinRequest>>
where
    R: JoinRequestStore + ?Sized,
    K: KeyStore + ?Sized,
{
    let mut pending = Vec::new();
    for request in requests.list()? {
        if !keys.has_key(&request.username)? {
            pending.push(request);
        }
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::inmem::{InMemKeyStore, InMemRequestStore};

    fn stores() -> (InMemRequestStore, InMemKeyStore) {
        (InMemRequestStore::new(), InMemKeyStore::new().with_key("admin", "ADMINKEY"))
    }

    #[test]
    fn submit_then_approve() {
        let (reqs, keys) = stores();
        submit(&reqs, &keys, "bob", "BOBKEY").unwrap();
        assert_eq!(state(&reqs, &keys, "bob").unwrap(), RequestState::Pending);
        assert_eq!(list_pending(&reqs, &keys).unwrap().len(), 1);

        approve(&reqs, &keys, "bob").unwrap();
        assert_eq!(keys.public_key("bob").unwrap().as_deref(), Some("BOBKEY"));
        assert!(reqs.get("bob").unwrap().is_none());
        assert!(list_pending(&reqs, &keys).unwrap().is_empty());
    }

    #[test]
    fn submit_then_reject() {
        let (reqs, keys) = stores();
        submit(&reqs, &keys, "bob", "BOBKEY").unwrap();
        reject(&reqs, "bob").unwrap();
        assert!(keys.public_key("bob").unwrap().is_none());
        assert!(list_pending(&reqs, &keys).unwrap().is_empty());
        assert_eq!(state(&reqs, &keys, "bob").unwrap(), RequestState::None);
    }

    #[test]
    fn policy_violations_do_not_overwrite() {
        let (reqs, keys) = stores();
        assert!(matches!(submit(&reqs, &keys, "admin", "X"), Err(MembershipError::AlreadyApproved(_))));
        submit(&reqs, &keys, "bob", "FIRST").unwrap();
        assert!(matches!(submit(&reqs, &keys, "bob", "SECOND"), Err(MembershipError::AlreadyPending(_))));
        assert_eq!(reqs.get("bob").unwrap().unwrap().public_key, "FIRST");
        assert!(matches!(approve(&reqs, &keys, "carol"), Err(MembershipError::NotPending(_))));
        assert!(matches!(reject(&reqs, "carol"), Err(MembershipError::NotPending(_))));
    }

    #[test]
    fn stale_request_for_approved_user_is_not_pending() {
        let (reqs, keys) = stores();
        reqs.put(&JoinRequest { username: "admin".into(), public_key: "OLD".into() }).unwrap();
        submit(&reqs, &keys, "carol", "CAROLKEY").unwrap();

        let pending = list_pending(&reqs, &keys).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].username, "carol");
        assert!(matches!(approve(&reqs, &keys, "admin"), Err(MembershipError::AlreadyApproved(_))));
        assert_eq!(keys.public_key("admin").unwrap().as_deref(), Some("ADMINKEY"));
    }
}
