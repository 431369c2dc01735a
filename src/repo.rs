//! Forum repository: every mutation is written into the working tree and
//! committed as its own commit, scoped to the files it touched and authored
//! by the acting identity.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::crypto::{self, CryptoError, Identity};
use crate::git::{Git, GitError, MergeOutcome, SyncStatus};
use crate::membership::{self, MembershipError};
use crate::models::*;
use crate::post::{self, ParseError};
use crate::store::fs::{FsKeyStore, FsRequestStore};
use crate::store::{KeyStore, StoreError};
use crate::thread::{self, ForumError, ForumReader, WorkingTree};

const MERGE_AUTHOR: &str = "gitboard";

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error(transparent)] Git(#[from] GitError),
    #[error("{}: {source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("decode {}: {source}", .path.display())]
    Decode { path: PathBuf, source: toml::de::Error },
    #[error("encode metadata: {0}")] Encode(#[from] toml::ser::Error),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Membership(#[from] MembershipError),
    #[error(transparent)] Forum(#[from] ForumError),
    #[error(transparent)] Parse(#[from] ParseError),
    #[error("{} already holds a repository", .0.display())] AlreadyInitialised(PathBuf),
    #[error("@{0} is not the forum admin")] NotAdmin(String),
    #[error("invalid slug {0:?}: use lowercase letters, digits and hyphens")] InvalidSlug(String),
    #[error("category {0:?} already exists")] CategoryExists(String),
    #[error("category {0:?} not found")] CategoryNotFound(String),
    #[error("thread {0} already exists")] ThreadExists(String),
    #[error("thread {0} not found")] ThreadNotFound(String),
    #[error("invalid post filename {0:?}")] InvalidFilename(String),
    #[error("post {0} not found")] PostNotFound(String),
    #[error("post {0} already exists")] PostExists(String),
    #[error("post {0} is already deleted")] AlreadyTombstoned(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

fn key_file(dir: &str, username: &str) -> PathBuf {
    Path::new(dir).join(format!("{username}{KEY_EXTENSION}"))
}

fn checked_slug(slug: &str) -> RepoResult<&str> {
    if thread::is_valid_slug(slug) {
        Ok(slug)
    } else {
        Err(RepoError::InvalidSlug(slug.to_string()))
    }
}

#[derive(Debug)]
pub struct Repo {
    git: Git,
    tree: WorkingTree,
    sync: SyncConfig,
}

impl Repo {
    /// Create a forum at `path`: FORUM.toml plus the founder's key, in one
    /// commit. An empty `admin_pubkey` is filled with the founder's key.
    pub fn init(path: &Path, mut meta: ForumMeta, founder: &Identity) -> RepoResult<Self> {
        if path.join(".git").exists() {
            return Err(RepoError::AlreadyInitialised(path.to_path_buf()));
        }
        std::fs::create_dir_all(path)
            .map_err(|source| RepoError::Io { path: path.to_path_buf(), source })?;
        let repo = Self::from_git(Git::init(path)?);

        if meta.admin_pubkey.is_empty() {
            meta.admin_pubkey = founder.public_key_b64();
        }
        repo.write_meta(&meta)?;
        repo.tree.keys().put_key(&founder.username, &founder.public_key_b64())?;
        repo.commit_files(
            founder,
            &format!("Initialise forum {:?}", meta.name),
            &[PathBuf::from(FORUM_META_FILE), key_file(KEYS_DIR, &founder.username)],
        )?;
        info!(path = %path.display(), admin = %founder.username, "forum initialised");
        Ok(repo)
    }

    pub fn open(path: &Path) -> RepoResult<Self> {
        Ok(Self::from_git(Git::open(path)?))
    }

    pub fn clone_from(url: &str, path: &Path, sync: SyncConfig) -> RepoResult<Self> {
        let git = Git::clone_remote(url, path, sync.timeout)?;
        Ok(Self::from_git(git).with_sync(sync))
    }

    fn from_git(git: Git) -> Self {
        let tree = WorkingTree::new(git.workdir());
        Self { git, tree, sync: SyncConfig::default() }
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn path(&self) -> &Path {
        self.git.workdir()
    }

    pub fn tree(&self) -> &WorkingTree {
        &self.tree
    }

    pub fn key_store(&self) -> &FsKeyStore {
        self.tree.keys()
    }

    pub fn request_store(&self) -> FsRequestStore {
        self.tree.requests()
    }

    // --- metadata & authorization ---

    pub fn read_meta(&self) -> RepoResult<ForumMeta> {
        let path = self.path().join(FORUM_META_FILE);
        let raw = std::fs::read_to_string(&path)
            .map_err(|source| RepoError::Io { path: path.clone(), source })?;
        toml::from_str(&raw).map_err(|source| RepoError::Decode { path, source })
    }

    fn write_meta(&self, meta: &ForumMeta) -> RepoResult<()> {
        self.write_file(Path::new(FORUM_META_FILE), toml::to_string(meta)?.as_bytes())
    }

    pub fn update_meta(&self, admin: &Identity, meta: &ForumMeta) -> RepoResult<()> {
        self.require_admin(admin)?;
        self.write_meta(meta)?;
        self.commit_files(admin, "Update forum metadata", &[PathBuf::from(FORUM_META_FILE)])?;
        Ok(())
    }

    /// Full public-key comparison; the fingerprint is never enough.
    pub fn is_admin(&self, identity: &Identity) -> RepoResult<bool> {
        let meta = self.read_meta()?;
        Ok(!meta.admin_pubkey.is_empty() && identity.owns_public_key(&meta.admin_pubkey))
    }

    fn require_admin(&self, identity: &Identity) -> RepoResult<()> {
        if self.is_admin(identity)? {
            Ok(())
        } else {
            Err(RepoError::NotAdmin(identity.username.clone()))
        }
    }

    // --- commits ---

    fn write_file(&self, rel: &Path, bytes: &[u8]) -> RepoResult<()> {
        let path = self.path().join(rel);
        let io_err = |source| RepoError::Io { path: path.clone(), source };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        std::fs::write(&path, bytes).map_err(io_err)
    }

    /// Commit the current state of `paths` (relative to the working tree):
    /// files that exist are staged, files that are gone are removed.
    pub fn commit_files(&self, actor: &Identity, message: &str, paths: &[PathBuf]) -> RepoResult<()> {
        let (add, remove): (Vec<PathBuf>, Vec<PathBuf>) =
            paths.iter().cloned().partition(|p| self.path().join(p).exists());
        let oid = self.git.commit(&actor.username, message, &add, &remove)?;
        info!(%oid, author = %actor.username, message, "commit");
        Ok(())
    }

    /// Write `post` into `category/thread` under its own filename and commit
    /// it. An existing file is never overwritten.
    pub fn commit_post(&self, actor: &Identity, category: &str, thread: &str, post: &Post) -> RepoResult<PathBuf> {
        self.tree.thread_dir(category, thread)?;
        if post.filename.is_empty() || post.filename.contains(['/', '\\']) {
            return Err(RepoError::InvalidFilename(post.filename.clone()));
        }
        let rel = Path::new(category).join(thread).join(&post.filename);
        if self.path().join(&rel).exists() {
            return Err(RepoError::PostExists(rel.display().to_string()));
        }
        self.write_file(&rel, &post::format(post))?;
        self.commit_files(actor, &format!("Post {}", rel.display()), std::slice::from_ref(&rel))?;
        Ok(rel)
    }

    // --- content ---

    /// Admin only. The slug is checked before anything touches disk.
    pub fn create_category(&self, admin: &Identity, slug: &str, name: &str, description: &str) -> RepoResult<Category> {
        self.require_admin(admin)?;
        let slug = checked_slug(slug)?;
        if self.path().join(slug).exists() {
            return Err(RepoError::CategoryExists(slug.to_string()));
        }
        let meta = CategoryMeta { name: name.to_string(), description: description.to_string() };
        let rel = Path::new(slug).join(CATEGORY_META_FILE);
        self.write_file(&rel, toml::to_string(&meta)?.as_bytes())?;
        self.commit_files(admin, &format!("New category {slug}"), &[rel])?;
        Ok(self.tree.load_category(slug)?)
    }

    pub fn create_thread(&self, actor: &Identity, category: &str, slug: &str, body: &str) -> RepoResult<Post> {
        let slug = checked_slug(slug)?;
        if !self.tree.category_dir(category)?.join(CATEGORY_META_FILE).is_file() {
            return Err(RepoError::CategoryNotFound(category.to_string()));
        }
        let dir = self.tree.thread_dir(category, slug)?;
        if dir.exists() {
            return Err(RepoError::ThreadExists(format!("{category}/{slug}")));
        }
        let mut root = post::sign_post(actor, "", body);
        root.filename = ROOT_FILENAME.to_string();
        self.commit_post(actor, category, slug, &root)?;
        Ok(root)
    }

    /// Reply to a thread; `parent` is the hash of the root file's bytes.
    pub fn reply(&self, actor: &Identity, category: &str, thread: &str, body: &str) -> RepoResult<Post> {
        let root_path = self.tree.thread_dir(category, thread)?.join(ROOT_FILENAME);
        let root = match std::fs::read(&root_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepoError::ThreadNotFound(format!("{category}/{thread}")))
            }
            Err(source) => return Err(RepoError::Io { path: root_path, source }),
        };
        let mut reply = post::sign_post(actor, &post::post_hash(&root), body);
        reply.filename = post::new_reply_filename(body);
        self.commit_post(actor, category, thread, &reply)?;
        Ok(reply)
    }

    /// Admin only: commit `X.tomb` next to post `X`.
    pub fn delete_post(&self, admin: &Identity, category: &str, thread: &str, filename: &str) -> RepoResult<Post> {
        self.require_admin(admin)?;
        let dir = self.tree.thread_dir(category, thread)?;
        let rel = format!("{category}/{thread}/{filename}");
        if !post::is_post_filename(filename) || filename.contains(['/', '\\']) {
            return Err(RepoError::InvalidFilename(filename.to_string()));
        }
        let target = match std::fs::read(dir.join(filename)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(RepoError::PostNotFound(rel)),
            Err(source) => return Err(RepoError::Io { path: dir.join(filename), source }),
        };
        let mut tomb = post::sign_tombstone(admin, &target);
        tomb.filename = post::tombstone_filename(filename);
        if dir.join(&tomb.filename).exists() {
            return Err(RepoError::AlreadyTombstoned(rel));
        }
        self.commit_post(admin, category, thread, &tomb)?;
        info!(post = %rel, "post tombstoned");
        Ok(tomb)
    }

    pub fn categories(&self) -> RepoResult<Vec<String>> {
        Ok(self.tree.categories()?)
    }

    pub fn load_categories(&self) -> RepoResult<Vec<Category>> {
        Ok(self.tree.load_categories()?)
    }

    // --- keys & membership ---

    /// Admin only: trust `public_key` for `username` directly. A user who
    /// already has a key keeps it.
    pub fn write_public_key(&self, admin: &Identity, username: &str, public_key: &str) -> RepoResult<()> {
        self.require_admin(admin)?;
        crypto::decode_public_key(public_key)?;
        if self.key_store().has_key(username)? {
            return Err(MembershipError::AlreadyApproved(username.to_string()).into());
        }
        self.key_store().put_key(username, public_key)?;
        self.commit_files(admin, &format!("Add key for @{username}"), &[key_file(KEYS_DIR, username)])?;
        Ok(())
    }

    pub fn submit_join_request(&self, identity: &Identity) -> RepoResult<JoinRequest> {
        let request = membership::submit(
            &self.request_store(),
            self.key_store(),
            &identity.username,
            &identity.public_key_b64(),
        )?;
        self.commit_files(
            identity,
            &format!("Join request from @{}", identity.username),
            &[key_file(REQUESTS_DIR, &identity.username)],
        )?;
        Ok(request)
    }

    /// Key added and request removed in the same commit.
    pub fn approve_join_request(&self, admin: &Identity, username: &str) -> RepoResult<JoinRequest> {
        self.require_admin(admin)?;
        let request = membership::approve(&self.request_store(), self.key_store(), username)?;
        self.commit_files(
            admin,
            &format!("Approve @{username}"),
            &[key_file(KEYS_DIR, username), key_file(REQUESTS_DIR, username)],
        )?;
        Ok(request)
    }

    pub fn reject_join_request(&self, admin: &Identity, username: &str) -> RepoResult<JoinRequest> {
        self.require_admin(admin)?;
        let request = membership::reject(&self.request_store(), username)?;
        self.commit_files(admin, &format!("Reject @{username}"), &[key_file(REQUESTS_DIR, username)])?;
        Ok(request)
    }

    /// Pending requests, excluding anyone who already has a key.
    pub fn join_requests(&self) -> RepoResult<Vec<JoinRequest>> {
        Ok(membership::list_pending(&self.request_store(), self.key_store())?)
    }

    // --- sync ---

    pub fn remote_url(&self) -> RepoResult<Option<String>> {
        Ok(self.git.remote_url(&self.sync.remote)?)
    }

    /// Point the configured remote at `url`, replacing what was there.
    pub fn add_remote(&self, url: &str) -> RepoResult<()> {
        self.git.set_remote(&self.sync.remote, url)?;
        info!(remote = %self.sync.remote, url, "remote set");
        Ok(())
    }

    pub fn sync_status(&self) -> RepoResult<SyncStatus> {
        Ok(self.git.sync_status(&self.sync.remote)?)
    }

    pub fn is_synced(&self) -> RepoResult<bool> {
        Ok(self.sync_status()?.synced)
    }

    /// Fetch and merge. A merge commit, if one is needed, is authored by
    /// `actor` when given.
    pub fn pull(&self, actor: Option<&Identity>) -> RepoResult<MergeOutcome> {
        let author = actor.map_or(MERGE_AUTHOR, |a| a.username.as_str());
        self.git.pull(&self.sync.remote, author, self.sync.timeout).map_err(|e| {
            warn!(remote = %self.sync.remote, error = %e, "pull failed");
            e.into()
        })
    }

    pub fn push(&self) -> RepoResult<()> {
        self.git.push(&self.sync.remote, self.sync.timeout).map_err(|e| {
            warn!(remote = %self.sync.remote, error = %e, "push failed");
            e.into()
        })
    }
}
