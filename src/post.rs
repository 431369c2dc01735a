//! Post files: `+++`-fenced TOML front matter followed by a markdown body.
//!
//! ```text
//! +++
//! author    = "alice"
//! pubkey    = "q2Vc1Zx9"
//! timestamp = "2026-02-17T10:00:00Z"
//! parent    = ""
//! signature = "..."
//! +++
//!
//! body, verbatim
//! ```

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::crypto::{self, Identity};
use crate::models::{Post, SigStatus, POST_EXTENSION, TOMBSTONE_SUFFIX};
use crate::store::KeyStore;

const FENCE: &str = "+++";
/// Body of every tombstone; its presence, not its content, is what counts.
pub const TOMBSTONE_BODY: &str = "[deleted by admin]";

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("parse {filename}: not valid UTF-8")]
    Encoding { filename: String },
    #[error("parse {filename}: file does not begin with front matter fence '+++'")]
    MissingFence { filename: String },
    #[error("parse {filename}: front matter closing '+++' not found")]
    Unterminated { filename: String },
    #[error("parse {filename}: decode TOML front matter: {source}")]
    Metadata { filename: String, source: toml::de::Error },
    #[error("parse timestamp in {filename}: {source}")]
    Timestamp { filename: String, source: chrono::ParseError },
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FrontMatter {
    author: String,
    pubkey: String,
    timestamp: String,
    parent: String,
    signature: String,
}

/// Sign a new post as `identity`. `parent` is [`post_hash`] of the parent
/// file, or empty for a thread root. The caller assigns `filename`.
pub fn sign_post(identity: &Identity, parent: &str, body: &str) -> Post {
    let timestamp = Utc::now().trunc_subsecs(0);
    let timestamp_raw = timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    let pubkey = identity.fingerprint();
    let canonical = crypto::canonical_form(
        [
            ("author", identity.username.as_str()),
            ("pubkey", pubkey.as_str()),
            ("timestamp", timestamp_raw.as_str()),
            ("parent", parent),
        ],
        body,
    );
    Post {
        author: identity.username.clone(),
        pubkey,
        timestamp,
        timestamp_raw,
        parent: parent.to_string(),
        signature: identity.sign(&canonical),
        body: body.to_string(),
        filename: String::new(),
        content_hash: String::new(),
        sig_status: SigStatus::Valid,
        sig_error: None,
    }
}

/// Admin-signed marker for `target` (the raw bytes of the post being removed).
pub fn sign_tombstone(admin: &Identity, target: &[u8]) -> Post {
    sign_post(admin, &post_hash(target), TOMBSTONE_BODY)
}

/// Canonical bytes a post's signature covers.
pub fn signed_bytes(post: &Post) -> Vec<u8> {
    crypto::canonical_form(
        [
            ("author", post.author.as_str()),
            ("pubkey", post.pubkey.as_str()),
            ("timestamp", post.timestamp_raw.as_str()),
            ("parent", post.parent.as_str()),
        ],
        &post.body,
    )
}

/// On-disk bytes. The body is always followed by exactly one newline, which
/// [`parse`] strips again, so bodies with and without a trailing newline
/// survive the round trip.
pub fn format(post: &Post) -> Vec<u8> {
    let mut out = String::with_capacity(post.body.len() + 256);
    out.push_str(FENCE);
    out.push('\n');
    for (key, value) in [
        ("author   ", &post.author),
        ("pubkey   ", &post.pubkey),
        ("timestamp", &post.timestamp_raw),
        ("parent   ", &post.parent),
        ("signature", &post.signature),
    ] {
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(&toml::Value::String(value.clone()).to_string());
        out.push('\n');
    }
    out.push_str(FENCE);
    out.push_str("\n\n");
    out.push_str(&post.body);
    out.push('\n');
    out.into_bytes()
}

/// Parse a post file. The result is unverified (`SigStatus::Missing`) until
/// [`verify_signature`] runs; `content_hash` is the hash of `content`.
pub fn parse(filename: &str, content: &[u8]) -> Result<Post, ParseError> {
    let text = std::str::from_utf8(content)
        .map_err(|_| ParseError::Encoding { filename: filename.to_string() })?;
    let (meta, body) = split_front_matter(filename, text)?;

    let fm: FrontMatter = toml::from_str(meta)
        .map_err(|source| ParseError::Metadata { filename: filename.to_string(), source })?;
    let timestamp = DateTime::parse_from_rfc3339(&fm.timestamp)
        .map_err(|source| ParseError::Timestamp { filename: filename.to_string(), source })?
        .with_timezone(&Utc);

    Ok(Post {
        author: fm.author,
        pubkey: fm.pubkey,
        timestamp,
        timestamp_raw: fm.timestamp,
        parent: fm.parent,
        signature: fm.signature,
        body: body.to_string(),
        filename: filename.to_string(),
        content_hash: post_hash(content),
        sig_status: SigStatus::Missing,
        sig_error: None,
    })
}

fn split_front_matter<'a>(filename: &str, text: &'a str) -> Result<(&'a str, &'a str), ParseError> {
    let (first, rest) = match text.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (text, ""),
    };
    if first != FENCE {
        return Err(ParseError::MissingFence { filename: filename.to_string() });
    }

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.strip_suffix('\n').unwrap_or(line) == FENCE {
            let meta = &rest[..offset];
            let mut body = &rest[offset + line.len()..];
            // exactly one separator line and one trailing newline
            body = body.strip_prefix('\n').unwrap_or(body);
            body = body.strip_suffix('\n').unwrap_or(body);
            return Ok((meta, body));
        }
        offset += line.len();
    }
    Err(ParseError::Unterminated { filename: filename.to_string() })
}

/// Resolve the author's key and check the signature. Never fails: problems
/// become `Missing`/`Invalid` plus a reason, stored on the post and returned.
pub fn verify_signature<K: KeyStore + ?Sized>(post: &mut Post, keys: &K) -> (SigStatus, Option<String>) {
    let (status, error) = match keys.public_key(&post.author) {
        Ok(None) => (SigStatus::Missing, Some(format!("no public key for author {:?}", post.author))),
        Err(e) => (SigStatus::Invalid, Some(format!("read key: {e}"))),
        Ok(Some(key)) => match crypto::verify_with_public_key_b64(&key, &signed_bytes(post), &post.signature) {
            Ok(()) => (SigStatus::Valid, None),
            Err(e) => (SigStatus::Invalid, Some(e.to_string())),
        },
    };
    post.sig_status = status;
    post.sig_error = error.clone();
    (status, error)
}

/// sha-256 hex of raw file bytes; what a reply stores in `parent`.
pub fn post_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// `{unix_millis:013}_{sha256(body)[..8]}.md` for the current instant.
pub fn new_reply_filename(body: &str) -> String {
    reply_filename_at(Utc::now().timestamp_millis(), body)
}

pub fn reply_filename_at(unix_millis: i64, body: &str) -> String {
    let digest = post_hash(body.as_bytes());
    format!("{unix_millis:013}_{}{POST_EXTENSION}", &digest[..8])
}

/// Millisecond timestamp embedded in a reply filename, if it has one.
pub fn reply_millis(filename: &str) -> Option<i64> {
    let stem = filename.strip_suffix(POST_EXTENSION)?;
    let (millis, hash) = stem.split_once('_')?;
    if hash.is_empty() {
        return None;
    }
    millis.parse().ok()
}

pub fn tombstone_filename(filename: &str) -> String {
    format!("{filename}{TOMBSTONE_SUFFIX}")
}

pub fn is_post_filename(filename: &str) -> bool {
    filename.ends_with(POST_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "+++\nauthor=\"a\"\npubkey=\"b\"\ntimestamp=\"2026-01-01T00:00:00Z\"\nparent=\"\"\nsignature=\"s\"\n+++\n\n";

    #[test]
    fn parses_well_formed_file() {
        let raw = "+++\n\
                   author    = \"alice\"\n\
                   pubkey    = \"AAAA1234\"\n\
                   timestamp = \"2026-02-17T10:00:00Z\"\n\
                   parent    = \"\"\n\
                   signature = \"SIGDATA\"\n\
                   +++\n\nHello world";
        let post = parse("0000_root.md", raw.as_bytes()).unwrap();
        assert_eq!(post.author, "alice");
        assert_eq!(post.pubkey, "AAAA1234");
        assert_eq!(post.parent, "");
        assert_eq!(post.signature, "SIGDATA");
        assert_eq!(post.body, "Hello world");
        assert_eq!(post.timestamp_raw, "2026-02-17T10:00:00Z");
        assert_eq!(post.timestamp.to_rfc3339(), "2026-02-17T10:00:00+00:00");
        assert_eq!(post.content_hash, post_hash(raw.as_bytes()));
        assert_eq!(post.sig_status, SigStatus::Missing);
    }

    #[test]
    fn parse_errors_name_the_file() {
        let cases = [
            ("author = \"alice\"\n", "'+++'"),
            ("+++\nauthor = \"alice\"\n", "closing"),
            ("+++\nauthor = [unclosed\n+++\n\nbody", "TOML"),
            ("+++\nauthor=\"a\"\ntimestamp=\"not-a-time\"\n+++\n\nbody", "timestamp"),
        ];
        for (content, want) in cases {
            let err = parse("broken.md", content.as_bytes()).unwrap_err().to_string();
            assert!(err.contains(want), "{err:?} lacks {want:?}");
            assert!(err.contains("broken.md"), "{err:?} lacks filename");
        }
    }

    #[test]
    fn keeps_inner_blank_lines_and_strips_one_separator() {
        let body = "Line 1\nLine 2\n\nLine 4";
        let post = parse("x.md", format!("{HEADER}{body}").as_bytes()).unwrap();
        assert_eq!(post.body, body);

        // a second blank line after the fence belongs to the body
        let post = parse("x.md", format!("{HEADER}\nindented").as_bytes()).unwrap();
        assert_eq!(post.body, "\nindented");
    }

    #[test]
    fn format_parse_roundtrip_preserves_trailing_newlines() {
        let id = crypto::generate("alice").unwrap();
        for body in ["plain", "ends with newline\n", "two\n\n", "", "a\n\nb", "quote \" and \\ back"] {
            let original = sign_post(&id, "", body);
            let parsed = parse("0000_root.md", &format(&original)).unwrap();
            assert_eq!(parsed.author, original.author);
            assert_eq!(parsed.pubkey, original.pubkey);
            assert_eq!(parsed.timestamp_raw, original.timestamp_raw);
            assert_eq!(parsed.timestamp, original.timestamp);
            assert_eq!(parsed.parent, original.parent);
            assert_eq!(parsed.signature, original.signature);
            assert_eq!(parsed.body, body);
        }
    }

    #[test]
    fn reply_filenames() {
        let name = reply_filename_at(1_708_123_456_789, "hi");
        assert_eq!(name, format!("1708123456789_{}.md", &post_hash(b"hi")[..8]));
        assert_eq!(reply_millis(&name), Some(1_708_123_456_789));
        assert_eq!(reply_filename_at(5, "hi").len(), name.len());
        assert_eq!(reply_millis("0000_root.md"), Some(0));
        assert_eq!(reply_millis("notes.md"), None);

        let now = new_reply_filename("hi");
        assert!(now.ends_with(&name[13..]));
        assert_eq!(now.len(), 13 + 1 + 8 + 3);
    }

    #[test]
    fn tombstone_points_at_target() {
        let admin = crypto::generate("admin").unwrap();
        let tomb = sign_tombstone(&admin, b"target bytes");
        assert_eq!(tomb.parent, post_hash(b"target bytes"));
        assert_eq!(tomb.body, TOMBSTONE_BODY);
        assert_eq!(tombstone_filename("1_ab.md"), "1_ab.md.tomb");
        assert!(!is_post_filename("1_ab.md.tomb"));
    }
}
