//! Builds threads and categories by walking the working tree.
//!
//! Nothing is indexed: every call re-reads the directories. Callers that want
//! a cache can sit behind [`ForumReader`].

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::models::{
    Category, CategoryMeta, Post, SigStatus, Thread, ThreadScan, CATEGORY_META_FILE, KEYS_DIR,
    REQUESTS_DIR, ROOT_FILENAME,
};
use crate::post::{self, ParseError};
use crate::store::fs::{FsKeyStore, FsRequestStore};
use crate::store::KeyStore;

#[derive(thiserror::Error, Debug)]
pub enum ForumError {
    #[error("read {}: {source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error(transparent)] Parse(#[from] ParseError),
    #[error("category {0:?} has no META.toml")] MissingCategoryMeta(String),
    #[error("read META.toml for category {slug:?}: {source}")]
    CategoryMeta { slug: String, source: toml::de::Error },
    #[error("invalid path component {0:?}")] InvalidSlug(String),
}

pub type ForumResult<T> = Result<T, ForumError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ForumError + '_ {
    move |source| ForumError::Io { path: path.to_path_buf(), source }
}

/// `^[a-z0-9][a-z0-9-]*$`, required for new categories and threads.
pub fn is_valid_slug(slug: &str) -> bool {
    let mut chars = slug.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

// looser check for reading: anything that stays inside its parent directory
fn safe_component(name: &str) -> ForumResult<&str> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(ForumError::InvalidSlug(name.to_string()));
    }
    Ok(name)
}

struct DirListing {
    files: Vec<String>,
    dirs: Vec<String>,
}

impl DirListing {
    fn read(dir: &Path) -> ForumResult<Self> {
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
            let entry = entry.map_err(io_err(dir))?;
            let kind = entry.file_type().map_err(io_err(dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if kind.is_file() {
                files.push(name);
            } else if kind.is_dir() {
                dirs.push(name);
            }
        }
        files.sort();
        dirs.sort();
        Ok(Self { files, dirs })
    }

    /// Post files without a tombstone sibling, in filename order.
    fn live_posts(&self) -> impl Iterator<Item = &str> {
        let names: HashSet<&str> = self.files.iter().map(String::as_str).collect();
        self.files.iter().map(String::as_str).filter(move |name| {
            if !post::is_post_filename(name) {
                return false;
            }
            if names.contains(post::tombstone_filename(name).as_str()) {
                debug!(file = name, "skipping tombstoned post");
                return false;
            }
            true
        })
    }
}

/// List-view summary. Only the root is parsed; replies are counted by name
/// and the newest reply's filename time is the last activity. A missing or
/// broken root is an error since there is nothing to summarise.
pub fn scan_thread<K: KeyStore + ?Sized>(slug: &str, dir: &Path, keys: &K) -> ForumResult<ThreadScan> {
    let root_path = dir.join(ROOT_FILENAME);
    let content = std::fs::read(&root_path).map_err(io_err(&root_path))?;
    let mut root = post::parse(ROOT_FILENAME, &content)?;
    post::verify_signature(&mut root, keys);

    let listing = DirListing::read(dir)?;
    let mut reply_count = 0;
    let mut newest: Option<DateTime<Utc>> = None;
    for name in listing.live_posts().filter(|n| *n != ROOT_FILENAME) {
        reply_count += 1;
        let at = post::reply_millis(name).and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        if let Some(at) = at {
            newest = Some(newest.map_or(at, |n| n.max(at)));
        }
    }

    Ok(ThreadScan {
        slug: slug.to_string(),
        last_activity: newest.unwrap_or(root.timestamp),
        root,
        reply_count,
    })
}

/// Full load with verification. Unparseable files become `Invalid`
/// placeholders; tombstoned files are left out. The root file sorts first
/// whatever its timestamp, everything else by ascending timestamp.
pub fn load_thread<K: KeyStore + ?Sized>(category: &str, slug: &str, dir: &Path, keys: &K) -> ForumResult<Thread> {
    let listing = DirListing::read(dir)?;

    let mut posts = Vec::new();
    for name in listing.live_posts() {
        let path = dir.join(name);
        let content = std::fs::read(&path).map_err(io_err(&path))?;
        let post = match post::parse(name, &content) {
            Ok(mut p) => {
                post::verify_signature(&mut p, keys);
                p
            }
            Err(e) => {
                warn!(thread = slug, file = name, error = %e, "unparseable post");
                Post::placeholder(name, e)
            }
        };
        posts.push(post);
    }

    // stable: equal timestamps keep filename order
    posts.sort_by(|a, b| b.is_root().cmp(&a.is_root()).then(a.timestamp.cmp(&b.timestamp)));
    let has_root = posts.first().is_some_and(Post::is_root);

    Ok(Thread {
        category_slug: category.to_string(),
        thread_slug: slug.to_string(),
        posts,
        has_root,
    })
}

/// A directory is a category only if it holds META.toml. Thread slugs are the
/// subdirectories containing a root post, sorted.
pub fn load_category(slug: &str, dir: &Path) -> ForumResult<Category> {
    let meta_path = dir.join(CATEGORY_META_FILE);
    let raw = match std::fs::read_to_string(&meta_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ForumError::MissingCategoryMeta(slug.to_string()))
        }
        Err(e) => return Err(io_err(&meta_path)(e)),
    };
    let meta: CategoryMeta = toml::from_str(&raw)
        .map_err(|source| ForumError::CategoryMeta { slug: slug.to_string(), source })?;

    let thread_slugs = DirListing::read(dir)?
        .dirs
        .into_iter()
        .filter(|d| dir.join(d).join(ROOT_FILENAME).is_file())
        .collect();

    Ok(Category { slug: slug.to_string(), name: meta.name, description: meta.description, thread_slugs })
}

/// Slugs of every top-level directory holding META.toml, sorted.
pub fn list_categories(root: &Path) -> ForumResult<Vec<String>> {
    Ok(DirListing::read(root)?
        .dirs
        .into_iter()
        .filter(|d| !d.starts_with('.') && root.join(d).join(CATEGORY_META_FILE).is_file())
        .collect())
}

impl Thread {
    /// Opt-in provenance check: a reply whose `parent` hash matches no post
    /// read in this thread is downgraded from `Valid` to `Orphaned`.
    /// Returns how many posts were downgraded.
    pub fn verify_parent_links(&mut self) -> usize {
        let known: HashSet<String> = self
            .posts
            .iter()
            .filter(|p| !p.content_hash.is_empty())
            .map(|p| p.content_hash.clone())
            .collect();

        let mut orphaned = 0;
        for p in &mut self.posts {
            if p.parent.is_empty() || p.sig_status != SigStatus::Valid || known.contains(&p.parent) {
                continue;
            }
            p.sig_status = SigStatus::Orphaned;
            // parent is untrusted text; cut on chars, not bytes
            let short: String = p.parent.chars().take(12).collect();
            p.sig_error = Some(format!("parent {short} not found in thread"));
            orphaned += 1;
        }
        orphaned
    }
}

/// Read side of the forum. The working-tree implementation walks the
/// filesystem on every call.
pub trait ForumReader: Send + Sync {
    fn categories(&self) -> ForumResult<Vec<String>>;
    fn load_category(&self, slug: &str) -> ForumResult<Category>;
    fn scan_thread(&self, category: &str, slug: &str) -> ForumResult<ThreadScan>;
    fn load_thread(&self, category: &str, slug: &str) -> ForumResult<Thread>;

    /// Every category, skipping directories that fail to load.
    fn load_categories(&self) -> ForumResult<Vec<Category>> {
        let mut out = Vec::new();
        for slug in self.categories()? {
            match self.load_category(&slug) {
                Ok(c) => out.push(c),
                Err(e) => warn!(category = %slug, error = %e, "skipping category"),
            }
        }
        Ok(out)
    }

    /// Summaries for a category, most recently active first. Threads whose
    /// root cannot be read are skipped.
    fn scan_threads(&self, category: &str) -> ForumResult<Vec<ThreadScan>> {
        let cat = self.load_category(category)?;
        let mut scans: Vec<ThreadScan> = cat
            .thread_slugs
            .iter()
            .filter_map(|slug| match self.scan_thread(category, slug) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(category, thread = %slug, error = %e, "skipping thread");
                    None
                }
            })
            .collect();
        scans.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(scans)
    }
}

/// A checked-out forum repository on disk.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    root: PathBuf,
    keys: FsKeyStore,
}

impl WorkingTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let keys = FsKeyStore::new(root.join(KEYS_DIR));
        Self { root, keys }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keys(&self) -> &FsKeyStore {
        &self.keys
    }

    pub fn requests(&self) -> FsRequestStore {
        FsRequestStore::new(self.root.join(REQUESTS_DIR))
    }

    pub fn category_dir(&self, category: &str) -> ForumResult<PathBuf> {
        Ok(self.root.join(safe_component(category)?))
    }

    pub fn thread_dir(&self, category: &str, slug: &str) -> ForumResult<PathBuf> {
        Ok(self.category_dir(category)?.join(safe_component(slug)?))
    }
}

impl ForumReader for WorkingTree {
    fn categories(&self) -> ForumResult<Vec<String>> {
        list_categories(&self.root)
    }

    fn load_category(&self, slug: &str) -> ForumResult<Category> {
        load_category(slug, &self.category_dir(slug)?)
    }

    fn scan_thread(&self, category: &str, slug: &str) -> ForumResult<ThreadScan> {
        scan_thread(slug, &self.thread_dir(category, slug)?, &self.keys)
    }

    fn load_thread(&self, category: &str, slug: &str) -> ForumResult<Thread> {
        load_thread(category, slug, &self.thread_dir(category, slug)?, &self.keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_rules() {
        for ok in ["general", "a", "0-day", "rust-2024"] {
            assert!(is_valid_slug(ok), "{ok}");
        }
        for bad in ["", "-lead", "Upper", "with space", "dot.ted", "../up"] {
            assert!(!is_valid_slug(bad), "{bad}");
        }
        assert!(safe_component("..").is_err());
        assert!(safe_component("a/b").is_err());
        assert!(safe_component("General").is_ok());
    }
}
