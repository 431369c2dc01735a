//! Thin wrapper over libgit2. No other module imports `git2`.
//!
//! Everything here is blocking. Network operations carry a deadline that is
//! checked from the transfer callbacks; callers on an async runtime should
//! also run them on a blocking thread with their own timeout.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    AnnotatedCommit, Commit, Cred, CredentialType, ErrorCode, FetchOptions, Oid, PushOptions,
    RemoteCallbacks, Repository, RepositoryInitOptions, ResetType, Signature, StatusOptions,
};
use tracing::{debug, info};

pub const DEFAULT_BRANCH: &str = "main";
const EMAIL_DOMAIN: &str = "gitboard.local";
const MAX_CREDENTIAL_ATTEMPTS: u32 = 3;

#[derive(thiserror::Error, Debug)]
pub enum GitError {
    #[error("git: {0}")] Git(#[from] git2::Error),
    #[error("{} is a bare repository", .0.display())] Bare(PathBuf),
    #[error("HEAD does not point at a branch")] DetachedHead,
    #[error("no remote named {0:?}")] NoRemote(String),
    #[error("merge with {upstream} conflicts in {paths:?}; local state kept")]
    MergeConflict { upstream: String, paths: Vec<String> },
    #[error("remote rejected {refname}: {message}")]
    PushRejected { refname: String, message: String },
    #[error("{op} timed out after {}s", .timeout.as_secs())]
    Timeout { op: &'static str, timeout: Duration },
}

pub type GitResult<T> = Result<T, GitError>;

/// What a pull did to the local branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The remote has no branch of our name yet.
    NoUpstream,
    UpToDate,
    FastForward,
    Merged,
}

/// HEAD vs. the remote-tracking ref, as of the last fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub synced: bool,
    pub remote_url: Option<String>,
}

struct Deadline {
    op: &'static str,
    timeout: Duration,
    at: Instant,
    expired: Cell<bool>,
    credential_attempts: Cell<u32>,
}

impl Deadline {
    fn new(op: &'static str, timeout: Duration) -> Self {
        Self { op, timeout, at: Instant::now() + timeout, expired: Cell::new(false), credential_attempts: Cell::new(0) }
    }

    fn alive(&self) -> bool {
        if Instant::now() >= self.at {
            self.expired.set(true);
            return false;
        }
        true
    }

    /// Fail before starting if the budget is already spent.
    fn check(&self) -> GitResult<()> {
        if self.alive() {
            Ok(())
        } else {
            Err(GitError::Timeout { op: self.op, timeout: self.timeout })
        }
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut cbs = RemoteCallbacks::new();
        cbs.transfer_progress(move |_| self.alive());
        cbs.sideband_progress(move |_| self.alive());
        cbs.credentials(move |_url, username, allowed| {
            let attempt = self.credential_attempts.get() + 1;
            self.credential_attempts.set(attempt);
            if attempt > MAX_CREDENTIAL_ATTEMPTS || !self.alive() {
                return Err(git2::Error::from_str("no usable credentials"));
            }
            if allowed.contains(CredentialType::SSH_KEY) {
                Cred::ssh_key_from_agent(username.unwrap_or("git"))
            } else {
                Cred::default()
            }
        });
        cbs
    }

    fn map(&self, e: git2::Error) -> GitError {
        if self.expired.get() {
            GitError::Timeout { op: self.op, timeout: self.timeout }
        } else {
            GitError::Git(e)
        }
    }
}

fn signature(author: &str) -> Result<Signature<'static>, git2::Error> {
    Signature::now(author, &format!("{author}@{EMAIL_DOMAIN}"))
}

fn not_found(e: &git2::Error) -> bool {
    matches!(e.code(), ErrorCode::NotFound | ErrorCode::UnbornBranch)
}

pub struct Git {
    repo: Repository,
    workdir: PathBuf,
}

impl std::fmt::Debug for Git {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Git").field("workdir", &self.workdir).finish()
    }
}

impl Git {
    /// New non-bare repository with an unborn `main` branch.
    pub fn init(path: &Path) -> GitResult<Self> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(DEFAULT_BRANCH);
        Self::wrap(Repository::init_opts(path, &opts)?)
    }

    pub fn open(path: &Path) -> GitResult<Self> {
        Self::wrap(Repository::open(path)?)
    }

    pub fn clone_remote(url: &str, path: &Path, timeout: Duration) -> GitResult<Self> {
        let deadline = Deadline::new("clone", timeout);
        deadline.check()?;
        let mut fo = FetchOptions::new();
        fo.remote_callbacks(deadline.callbacks());
        let repo = RepoBuilder::new().fetch_options(fo).clone(url, path).map_err(|e| deadline.map(e))?;
        info!(url, path = %path.display(), "cloned");
        Self::wrap(repo)
    }

    fn wrap(repo: Repository) -> GitResult<Self> {
        let workdir = match repo.workdir() {
            Some(w) => w.to_path_buf(),
            None => return Err(GitError::Bare(repo.path().to_path_buf())),
        };
        Ok(Self { repo, workdir })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Short name of the branch HEAD points at, born or not.
    pub fn current_branch(&self) -> GitResult<String> {
        match self.repo.head() {
            Ok(head) if head.is_branch() => {
                head.shorthand().map(str::to_string).ok_or(GitError::DetachedHead)
            }
            Ok(_) => Err(GitError::DetachedHead),
            Err(e) if e.code() == ErrorCode::UnbornBranch => {
                let head = self.repo.find_reference("HEAD")?;
                head.symbolic_target()
                    .and_then(|t| t.strip_prefix("refs/heads/"))
                    .map(str::to_string)
                    .ok_or(GitError::DetachedHead)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn head_commit(&self) -> GitResult<Option<Commit<'_>>> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e) if not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stage `add` and `remove` (paths relative to the working tree) and
    /// commit exactly those changes on top of HEAD.
    pub fn commit(&self, author: &str, message: &str, add: &[PathBuf], remove: &[PathBuf]) -> GitResult<Oid> {
        let mut index = self.repo.index()?;
        for p in add {
            index.add_path(p)?;
        }
        for p in remove {
            index.remove_path(p)?;
        }
        index.write()?;
        let tree = self.repo.find_tree(index.write_tree()?)?;

        let sig = signature(author)?;
        let parent = self.head_commit()?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        let oid = self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(%oid, author, message, "committed");
        Ok(oid)
    }

    pub fn remote_url(&self, remote: &str) -> GitResult<Option<String>> {
        match self.repo.find_remote(remote) {
            Ok(r) => Ok(r.url().map(str::to_string)),
            Err(e) if not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create `name`, replacing any remote already registered under it.
    pub fn set_remote(&self, name: &str, url: &str) -> GitResult<()> {
        if self.remote_url(name)?.is_some() {
            self.repo.remote_delete(name)?;
        }
        self.repo.remote(name, url)?;
        Ok(())
    }

    /// No modified, staged or untracked files.
    pub fn is_clean(&self) -> GitResult<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true).include_ignored(false);
        Ok(self.repo.statuses(Some(&mut opts))?.is_empty())
    }

    /// Without a remote there is nothing to be behind, so that counts as
    /// synced. Otherwise the tree must be clean and HEAD must equal the
    /// tracking ref.
    pub fn sync_status(&self, remote: &str) -> GitResult<SyncStatus> {
        let Some(url) = self.remote_url(remote)? else {
            return Ok(SyncStatus { synced: true, remote_url: None });
        };
        if !self.is_clean()? {
            return Ok(SyncStatus { synced: false, remote_url: Some(url) });
        }
        let local = self.head_commit()?.map(|c| c.id());
        let upstream = self.tracking_ref(remote)?;
        let tracked = match self.repo.refname_to_id(&upstream) {
            Ok(oid) => Some(oid),
            Err(e) if not_found(&e) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(SyncStatus { synced: local == tracked, remote_url: Some(url) })
    }

    fn tracking_ref(&self, remote: &str) -> GitResult<String> {
        Ok(format!("refs/remotes/{remote}/{}", self.current_branch()?))
    }

    /// Fetch `remote` and bring the current branch up to date with it:
    /// fast-forward when possible, otherwise a merge commit authored by
    /// `author`. A conflicting merge is rolled back.
    pub fn pull(&self, remote: &str, author: &str, timeout: Duration) -> GitResult<MergeOutcome> {
        let mut r = match self.repo.find_remote(remote) {
            Ok(r) => r,
            Err(e) if not_found(&e) => return Err(GitError::NoRemote(remote.to_string())),
            Err(e) => return Err(e.into()),
        };
        let deadline = Deadline::new("pull", timeout);
        deadline.check()?;
        let mut fo = FetchOptions::new();
        fo.remote_callbacks(deadline.callbacks());
        r.fetch(&[] as &[&str], Some(&mut fo), None).map_err(|e| deadline.map(e))?;

        let upstream = self.tracking_ref(remote)?;
        let reference = match self.repo.find_reference(&upstream) {
            Ok(r) => r,
            Err(e) if not_found(&e) => return Ok(MergeOutcome::NoUpstream),
            Err(e) => return Err(e.into()),
        };
        let theirs = self.repo.reference_to_annotated_commit(&reference)?;
        let (analysis, _) = self.repo.merge_analysis(&[&theirs])?;

        let outcome = if analysis.is_up_to_date() {
            MergeOutcome::UpToDate
        } else if analysis.is_unborn() || analysis.is_fast_forward() {
            self.fast_forward(&theirs)?;
            MergeOutcome::FastForward
        } else {
            self.merge(&upstream, &theirs, author)?;
            MergeOutcome::Merged
        };
        info!(remote, ?outcome, "pulled");
        Ok(outcome)
    }

    fn fast_forward(&self, theirs: &AnnotatedCommit<'_>) -> GitResult<()> {
        let branch = format!("refs/heads/{}", self.current_branch()?);
        let target = self.repo.find_commit(theirs.id())?;
        self.repo.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().safe()))?;
        let msg = format!("fast-forward to {}", theirs.id());
        match self.repo.find_reference(&branch) {
            Ok(mut r) => {
                r.set_target(theirs.id(), &msg)?;
            }
            Err(e) if not_found(&e) => {
                self.repo.reference(&branch, theirs.id(), false, &msg)?;
            }
            Err(e) => return Err(e.into()),
        }
        self.repo.set_head(&branch)?;
        Ok(())
    }

    fn merge(&self, upstream: &str, theirs: &AnnotatedCommit<'_>, author: &str) -> GitResult<()> {
        let ours = self.head_commit()?.ok_or(GitError::DetachedHead)?;
        self.repo.merge(&[theirs], None, None)?;

        let mut index = self.repo.index()?;
        if index.has_conflicts() {
            let paths = index
                .conflicts()?
                .filter_map(Result::ok)
                .filter_map(|c| c.our.or(c.their).or(c.ancestor))
                .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                .collect();
            self.repo.reset(ours.as_object(), ResetType::Hard, None)?;
            self.repo.cleanup_state()?;
            return Err(GitError::MergeConflict { upstream: upstream.to_string(), paths });
        }

        let tree = self.repo.find_tree(index.write_tree()?)?;
        let theirs_commit = self.repo.find_commit(theirs.id())?;
        let sig = signature(author)?;
        let msg = format!("Merge {upstream}");
        self.repo.commit(Some("HEAD"), &sig, &sig, &msg, &tree, &[&ours, &theirs_commit])?;
        self.repo.cleanup_state()?;
        Ok(())
    }

    /// Push the current branch to the branch of the same name on `remote`.
    /// Nothing to push is success.
    pub fn push(&self, remote: &str, timeout: Duration) -> GitResult<()> {
        let mut r = match self.repo.find_remote(remote) {
            Ok(r) => r,
            Err(e) if not_found(&e) => return Err(GitError::NoRemote(remote.to_string())),
            Err(e) => return Err(e.into()),
        };
        let branch = self.current_branch()?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");

        let deadline = Deadline::new("push", timeout);
        deadline.check()?;
        let rejected: RefCell<Option<(String, String)>> = RefCell::new(None);
        let mut cbs = deadline.callbacks();
        cbs.push_update_reference(|refname, status| {
            if let Some(message) = status {
                *rejected.borrow_mut() = Some((refname.to_string(), message.to_string()));
            }
            Ok(())
        });
        let mut po = PushOptions::new();
        po.remote_callbacks(cbs);
        let pushed = r.push(&[refspec.as_str()], Some(&mut po));
        drop(po);
        match pushed {
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::NotFastForward => {
                return Err(GitError::PushRejected { refname: format!("refs/heads/{branch}"), message: e.message().to_string() })
            }
            Err(e) => return Err(deadline.map(e)),
        }

        if let Some((refname, message)) = rejected.into_inner() {
            return Err(GitError::PushRejected { refname, message });
        }
        info!(remote, branch = %branch, "pushed");
        Ok(())
    }
}
