//! Process-level forum state shared by every caller in one process.
//!
//! The repository handle, the identity and the last sync time live behind a
//! single mutex. Git work runs on the blocking pool; a caller that cannot get
//! the lock within the git timeout gets an error and nothing runs. Reads go
//! through a separate [`ForumReader`] handle so they keep answering while a
//! slow pull or push holds the lock.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::crypto::Identity;
use crate::error::{Error, Result};
use crate::git::MergeOutcome;
use crate::models::{Category, ForumMeta, JoinRequest, Post, Thread, ThreadScan};
use crate::repo::{Repo, RepoError};
use crate::store::KeyStore;
use crate::thread::ForumReader;

/// Name reported before a forum exists.
pub const UNINITIALISED_NAME: &str = "gitboard";

#[derive(Debug, Clone, Serialize)]
pub struct ForumStatus {
    pub username: Option<String>,
    pub fingerprint: Option<String>,
    pub is_admin: bool,
    pub forum_name: String,
    pub remote_url: Option<String>,
    pub synced: bool,
    pub initialized: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// `None` when no remote is configured.
    pub pulled: Option<MergeOutcome>,
    pub approved: Vec<String>,
    pub pushed: bool,
}

struct State {
    repo: Option<Repo>,
    identity: Option<Identity>,
    last_sync_at: Option<DateTime<Utc>>,
}

impl State {
    fn repo(&self) -> Result<&Repo> {
        self.repo.as_ref().ok_or(Error::NotInitialised)
    }

    fn identity(&self) -> Result<&Identity> {
        self.identity.as_ref().ok_or(Error::NoIdentity)
    }

    fn both(&self) -> Result<(&Repo, &Identity)> {
        Ok((self.repo()?, self.identity()?))
    }

    /// Push if a remote is configured; failures are only logged.
    fn push_best_effort(&self, after: &str) -> bool {
        let Ok(repo) = self.repo() else { return false };
        match repo.remote_url() {
            Ok(Some(_)) => match repo.push() {
                Ok(()) => true,
                Err(e) => {
                    warn!(after, error = %e, "push failed; changes stay local until the next sync");
                    false
                }
            },
            Ok(None) => false,
            Err(e) => {
                warn!(after, error = %e, "cannot read remote");
                false
            }
        }
    }

    /// Approve every pending request when the forum allows it and we are
    /// the admin. Individual failures are logged and skipped.
    fn auto_approve(&self) -> Vec<String> {
        let Ok((repo, id)) = self.both() else { return Vec::new() };
        let allowed = match repo.read_meta() {
            Ok(meta) => meta.auto_approve_keys && id.owns_public_key(&meta.admin_pubkey),
            Err(e) => {
                warn!(error = %e, "read forum metadata");
                false
            }
        };
        if !allowed {
            return Vec::new();
        }
        let requests = match repo.join_requests() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "list join requests");
                return Vec::new();
            }
        };
        let mut approved = Vec::new();
        for req in requests {
            match repo.approve_join_request(id, &req.username) {
                Ok(_) => {
                    info!(username = %req.username, "auto-approved join request");
                    approved.push(req.username);
                }
                Err(e) => warn!(username = %req.username, error = %e, "auto-approve failed"),
            }
        }
        approved
    }
}

#[derive(Clone)]
pub struct ForumService {
    state: Arc<Mutex<State>>,
    reader: Arc<RwLock<Option<Arc<dyn ForumReader>>>>,
    config: Arc<ServiceConfig>,
}

impl ForumService {
    /// Pick up whatever already exists on disk: an identity file and/or a
    /// repository. Neither is required; `setup` or `join` create them.
    pub fn open(config: ServiceConfig) -> Result<Self> {
        let identity = if config.identity_path.exists() {
            Some(Identity::load(&config.identity_path)?)
        } else {
            None
        };
        let repo = if config.repo_path.join(".git").exists() {
            Some(Repo::open(&config.repo_path)?.with_sync(config.sync.clone()))
        } else {
            None
        };
        let service = Self {
            state: Arc::new(Mutex::new(State { repo: None, identity, last_sync_at: None })),
            reader: Arc::new(RwLock::new(None)),
            config: Arc::new(config),
        };
        if let Some(repo) = repo {
            service.install(&mut service.lock(), repo);
        }
        Ok(service)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install(&self, state: &mut State, repo: Repo) {
        let tree: Arc<dyn ForumReader> = Arc::new(repo.tree().clone());
        *self.reader.write().unwrap_or_else(PoisonError::into_inner) = Some(tree);
        state.repo = Some(repo);
    }

    /// Run `f` with the state locked, on the blocking pool. The configured
    /// git timeout bounds the wait for the lock only: an operation that gets
    /// the lock too late is dropped before doing anything, and one that
    /// starts runs to completion, its network steps bounded by libgit2
    /// deadlines.
    async fn with_state<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ForumService, &mut State) -> Result<T> + Send + 'static,
    {
        let this = self.clone();
        let timeout = self.config.sync.timeout;
        let queued = Instant::now();
        tokio::task::spawn_blocking(move || {
            let mut state = this.lock();
            if queued.elapsed() > timeout {
                warn!(op, ?timeout, "gave up waiting for the forum lock");
                return Err(Error::Timeout(op, timeout));
            }
            f(&this, &mut *state)
        })
        .await?
    }

    async fn with_reader<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ForumReader) -> Result<T> + Send + 'static,
    {
        let reader = self
            .reader
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotInitialised)?;
        tokio::task::spawn_blocking(move || f(reader.as_ref())).await?
    }

    pub async fn status(&self) -> Result<ForumStatus> {
        self.with_state("status", |_, state| {
            let mut status = ForumStatus {
                username: state.identity.as_ref().map(|id| id.username.clone()),
                fingerprint: state.identity.as_ref().map(Identity::fingerprint),
                is_admin: false,
                forum_name: UNINITIALISED_NAME.to_string(),
                remote_url: None,
                synced: true,
                initialized: false,
                last_sync_at: state.last_sync_at,
            };
            if let Some(repo) = &state.repo {
                status.initialized = true;
                match repo.read_meta() {
                    Ok(meta) => {
                        status.forum_name = meta.name;
                        status.is_admin = state
                            .identity
                            .as_ref()
                            .is_some_and(|id| !meta.admin_pubkey.is_empty() && id.owns_public_key(&meta.admin_pubkey));
                    }
                    Err(e) => warn!(error = %e, "read forum metadata"),
                }
                let sync = repo.sync_status().map_err(Error::from)?;
                status.synced = sync.synced;
                status.remote_url = sync.remote_url;
            }
            Ok(status)
        })
        .await
    }

    /// Create a new forum with the local identity (generated and saved on
    /// first use) as its admin. With a remote, the first commit is pushed
    /// on a best-effort basis.
    pub async fn setup(&self, username: &str, forum_name: &str, remote_url: Option<&str>) -> Result<()> {
        let username = username.to_string();
        let forum_name = forum_name.to_string();
        let remote_url = remote_url.map(str::to_string);
        self.with_state("setup", move |svc, state| {
            if state.repo.is_some() {
                return Err(Error::AlreadyInitialised);
            }
            let id = svc.identity_or_create(state, &username)?;
            let meta = ForumMeta { name: forum_name, admin_pubkey: id.public_key_b64(), ..ForumMeta::default() };
            let repo = Repo::init(&svc.config.repo_path, meta, &id)?.with_sync(svc.config.sync.clone());
            if let Some(url) = remote_url {
                match repo.add_remote(&url) {
                    Ok(()) => {
                        if let Err(e) = repo.push() {
                            warn!(error = %e, "initial push failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "add remote"),
                }
            }
            svc.install(state, repo);
            Ok(())
        })
        .await
    }

    /// Clone an existing forum and ask to join it. The request is pushed on
    /// a best-effort basis; users who already hold a key skip the request.
    pub async fn join(&self, url: &str, username: &str) -> Result<Option<JoinRequest>> {
        let url = url.to_string();
        let username = username.to_string();
        self.with_state("join", move |svc, state| {
            if state.repo.is_some() {
                return Err(Error::AlreadyInitialised);
            }
            let id = svc.identity_or_create(state, &username)?;
            let repo = Repo::clone_from(&url, &svc.config.repo_path, svc.config.sync.clone())?;
            let request = if repo.key_store().has_key(&id.username).map_err(RepoError::from)? {
                None
            } else {
                Some(repo.submit_join_request(&id)?)
            };
            svc.install(state, repo);
            if request.is_some() {
                state.push_best_effort("join request");
            }
            Ok(request)
        })
        .await
    }

    fn identity_or_create(&self, state: &mut State, username: &str) -> Result<Identity> {
        if let Some(id) = &state.identity {
            return Ok(id.clone());
        }
        let (id, created) = Identity::load_or_create(&self.config.identity_path, username)?;
        if created {
            info!(username = %id.username, path = %self.config.identity_path.display(), "identity created");
        }
        state.identity = Some(id.clone());
        Ok(id)
    }

    /// Pull (errors returned), record the sync time, auto-approve pending
    /// requests if configured, then push (errors logged).
    pub async fn sync(&self) -> Result<SyncReport> {
        self.with_state("sync", |_, state| {
            let repo = state.repo()?;
            let has_remote = repo.remote_url()?.is_some();
            let pulled = if has_remote {
                Some(repo.pull(state.identity.as_ref())?)
            } else {
                None
            };
            state.last_sync_at = Some(Utc::now());
            let approved = state.auto_approve();
            let pushed = has_remote && state.push_best_effort("sync");
            Ok(SyncReport { pulled, approved, pushed })
        })
        .await
    }

    pub async fn post_reply(&self, category: &str, thread: &str, body: &str) -> Result<Post> {
        let (category, thread, body) = (category.to_string(), thread.to_string(), body.to_string());
        self.with_state("reply", move |_, state| {
            let (repo, id) = state.both()?;
            let post = repo.reply(id, &category, &thread, &body)?;
            state.push_best_effort("reply");
            Ok(post)
        })
        .await
    }

    pub async fn new_thread(&self, category: &str, slug: &str, body: &str) -> Result<Post> {
        let (category, slug, body) = (category.to_string(), slug.to_string(), body.to_string());
        self.with_state("new thread", move |_, state| {
            let (repo, id) = state.both()?;
            let post = repo.create_thread(id, &category, &slug, &body)?;
            state.push_best_effort("new thread");
            Ok(post)
        })
        .await
    }

    pub async fn create_category(&self, slug: &str, name: &str, description: &str) -> Result<Category> {
        let (slug, name, description) = (slug.to_string(), name.to_string(), description.to_string());
        self.with_state("create category", move |_, state| {
            let (repo, id) = state.both()?;
            let category = repo.create_category(id, &slug, &name, &description)?;
            state.push_best_effort("create category");
            Ok(category)
        })
        .await
    }

    pub async fn delete_post(&self, category: &str, thread: &str, filename: &str) -> Result<Post> {
        let (category, thread, filename) = (category.to_string(), thread.to_string(), filename.to_string());
        self.with_state("delete post", move |_, state| {
            let (repo, id) = state.both()?;
            let tomb = repo.delete_post(id, &category, &thread, &filename)?;
            state.push_best_effort("delete post");
            Ok(tomb)
        })
        .await
    }

    pub async fn pending_requests(&self) -> Result<Vec<JoinRequest>> {
        self.with_state("join requests", |_, state| Ok(state.repo()?.join_requests()?)).await
    }

    pub async fn submit_request(&self) -> Result<JoinRequest> {
        self.with_state("submit request", |_, state| {
            let (repo, id) = state.both()?;
            let request = repo.submit_join_request(id)?;
            state.push_best_effort("submit request");
            Ok(request)
        })
        .await
    }

    pub async fn approve(&self, username: &str) -> Result<JoinRequest> {
        let username = username.to_string();
        self.with_state("approve", move |_, state| {
            let (repo, id) = state.both()?;
            let request = repo.approve_join_request(id, &username)?;
            state.push_best_effort("approve");
            Ok(request)
        })
        .await
    }

    pub async fn reject(&self, username: &str) -> Result<JoinRequest> {
        let username = username.to_string();
        self.with_state("reject", move |_, state| {
            let (repo, id) = state.both()?;
            let request = repo.reject_join_request(id, &username)?;
            state.push_best_effort("reject");
            Ok(request)
        })
        .await
    }

    pub async fn add_key(&self, username: &str, public_key: &str) -> Result<()> {
        let (username, public_key) = (username.to_string(), public_key.to_string());
        self.with_state("add key", move |_, state| {
            let (repo, id) = state.both()?;
            repo.write_public_key(id, &username, &public_key)?;
            state.push_best_effort("add key");
            Ok(())
        })
        .await
    }

    pub async fn categories(&self) -> Result<Vec<Category>> {
        self.with_reader(|r| Ok(r.load_categories()?)).await
    }

    pub async fn scan_threads(&self, category: &str) -> Result<Vec<ThreadScan>> {
        let category = category.to_string();
        self.with_reader(move |r| Ok(r.scan_threads(&category)?)).await
    }

    pub async fn load_thread(&self, category: &str, thread: &str) -> Result<Thread> {
        let (category, thread) = (category.to_string(), thread.to_string());
        self.with_reader(move |r| Ok(r.load_thread(&category, &thread)?)).await
    }

    pub fn repo_path(&self) -> &Path {
        &self.config.repo_path
    }
}
