//! Ed25519 identities, the canonical signing form, and sign/verify helpers.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Field excluded from the canonical form.
pub const SIGNATURE_FIELD: &str = "signature";
const FINGERPRINT_LEN: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("keygen: {0}")] Entropy(rand::Error),
    #[error("decode public key: {0}")] PublicKeyEncoding(base64::DecodeError),
    #[error("public key: expected 32 bytes, got {0}")] PublicKeyLength(usize),
    #[error("public key is not a valid curve point")] PublicKeyPoint,
    #[error("decode private key: {0}")] PrivateKeyEncoding(base64::DecodeError),
    #[error("private key: expected 64 bytes, got {0}")] PrivateKeyLength(usize),
    #[error("private key does not match its public half")] KeyMismatch,
    #[error("decode signature: {0}")] SignatureEncoding(base64::DecodeError),
    #[error("signature: expected 64 bytes, got {0}")] SignatureLength(usize),
    #[error("signature verification failed")] Verification,
    #[error("invalid username {0:?}")] InvalidUsername(String),
    #[error("identity file {}: {source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("identity file {}: {source}", .path.display())]
    Decode { path: PathBuf, source: toml::de::Error },
    #[error("encode identity: {0}")] Encode(#[from] toml::ser::Error),
}

/// The local user's keypair. Immutable once created or loaded.
#[derive(Clone)]
pub struct Identity {
    pub username: String,
    signing_key: SigningKey,
}

// on-disk representation, all keys base64
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    username: String,
    public_key: String,
    private_key: String, // 64 bytes: seed + public
}

impl Identity {
    /// Create a fresh keypair for `username`. Fails only if the OS entropy
    /// source does, or if the username cannot be used as a file name.
    pub fn generate(username: &str) -> Result<Self, CryptoError> {
        validate_username(username)?;
        let mut seed = [0u8; 32];
        OsRng.try_fill_bytes(&mut seed).map_err(CryptoError::Entropy)?;
        let signing_key = SigningKey::from_bytes(&seed);
        seed.fill(0);
        Ok(Self { username: username.to_string(), signing_key })
    }

    /// Rebuild an identity from a base64 64-byte keypair.
    pub fn from_keypair_b64(username: &str, private_b64: &str) -> Result<Self, CryptoError> {
        validate_username(username)?;
        let raw = STANDARD.decode(private_b64.trim()).map_err(CryptoError::PrivateKeyEncoding)?;
        let bytes: [u8; 64] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::PrivateKeyLength(raw.len()))?;
        let signing_key = SigningKey::from_keypair_bytes(&bytes).map_err(|_| CryptoError::KeyMismatch)?;
        Ok(Self { username: username.to_string(), signing_key })
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.public_key().as_bytes())
    }

    pub fn private_key_b64(&self) -> String {
        STANDARD.encode(self.signing_key.to_keypair_bytes())
    }

    /// Short display marker embedded in posts. Not an authorization key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_b64())
    }

    pub fn sign(&self, message: &[u8]) -> String {
        sign(&self.signing_key, message)
    }

    /// Full-key comparison against a base64 public key.
    pub fn owns_public_key(&self, public_b64: &str) -> bool {
        self.public_key_b64() == public_b64.trim()
    }

    /// Write the identity as TOML, mode 0600 on unix; parent dirs are created.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        let io_err = |source| CryptoError::Io { path: path.to_path_buf(), source };
        if let Some(dir) = path.parent() {
            create_private_dir(dir).map_err(io_err)?;
        }
        let encoded = toml::to_string(&IdentityFile {
            username: self.username.clone(),
            public_key: self.public_key_b64(),
            private_key: self.private_key_b64(),
        })?;
        let mut file = open_private_file(path).map_err(io_err)?;
        file.write_all(encoded.as_bytes()).map_err(io_err)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| CryptoError::Io { path: path.to_path_buf(), source })?;
        let file: IdentityFile = toml::from_str(&raw)
            .map_err(|source| CryptoError::Decode { path: path.to_path_buf(), source })?;
        let id = Self::from_keypair_b64(&file.username, &file.private_key)?;
        if !id.owns_public_key(&file.public_key) {
            return Err(CryptoError::KeyMismatch);
        }
        Ok(id)
    }

    /// Load `path`, or generate and save a new identity for `username` when
    /// the file does not exist. The flag is true when a key was created.
    pub fn load_or_create(path: &Path, username: &str) -> Result<(Self, bool), CryptoError> {
        match fs::metadata(path) {
            Ok(_) => Ok((Self::load(path)?, false)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let id = Self::generate(username)?;
                id.save(path)?;
                debug!(username, path = %path.display(), "generated identity");
                Ok((id, true))
            }
            Err(source) => Err(CryptoError::Io { path: path.to_path_buf(), source }),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Shorthand for [`Identity::generate`].
pub fn generate(username: &str) -> Result<Identity, CryptoError> {
    Identity::generate(username)
}

/// `$XDG_CONFIG_HOME/gitboard/identity.toml`, falling back to `~/.config`.
pub fn default_identity_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("gitboard").join("identity.toml")
}

/// First eight characters of a base64 public key.
pub fn fingerprint(public_b64: &str) -> String {
    public_b64.chars().take(FINGERPRINT_LEN).collect()
}

/// Usernames become file names under `keys/` and `requests/`.
pub fn validate_username(username: &str) -> Result<(), CryptoError> {
    let ok = !username.is_empty()
        && !username.starts_with('.')
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(CryptoError::InvalidUsername(username.to_string()))
    }
}

/// Deterministic bytes that get signed: every field except `signature`,
/// sorted byte-wise by name as `key=value\n`, one blank line, then the body
/// verbatim. Later duplicates of a key replace earlier ones.
pub fn canonical_form<'a, I>(fields: I, body: &str) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let sorted: BTreeMap<&str, &str> = fields
        .into_iter()
        .filter(|(k, _)| *k != SIGNATURE_FIELD)
        .collect();

    let mut out = Vec::with_capacity(body.len() + 128);
    for (k, v) in sorted {
        out.extend_from_slice(k.as_bytes());
        out.push(b'=');
        out.extend_from_slice(v.as_bytes());
        out.push(b'\n');
    }
    out.push(b'\n');
    out.extend_from_slice(body.as_bytes());
    out
}

pub fn sign(key: &SigningKey, message: &[u8]) -> String {
    STANDARD.encode(key.sign(message).to_bytes())
}

/// Check a base64 signature. Failure is a value, never a panic.
pub fn verify(public: &VerifyingKey, message: &[u8], sig_b64: &str) -> Result<(), CryptoError> {
    let raw = STANDARD.decode(sig_b64.trim()).map_err(CryptoError::SignatureEncoding)?;
    let bytes: [u8; 64] = raw
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::SignatureLength(raw.len()))?;
    public
        .verify(message, &Signature::from_bytes(&bytes))
        .map_err(|_| CryptoError::Verification)
}

pub fn decode_public_key(public_b64: &str) -> Result<VerifyingKey, CryptoError> {
    let raw = STANDARD.decode(public_b64.trim()).map_err(CryptoError::PublicKeyEncoding)?;
    let bytes: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::PublicKeyLength(raw.len()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::PublicKeyPoint)
}

pub fn verify_with_public_key_b64(public_b64: &str, message: &[u8], sig_b64: &str) -> Result<(), CryptoError> {
    verify(&decode_public_key(public_b64)?, message, sig_b64)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn open_private_file(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new().write(true).create(true).truncate(true).mode(0o600).open(path)
}

#[cfg(not(unix))]
fn open_private_file(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create(true).truncate(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_sorts_and_drops_signature() {
        let cases: &[(&[(&str, &str)], &str, &str)] = &[
            (
                &[("timestamp", "2026-02-17T10:00:00Z"), ("author", "giampaolo"), ("pubkey", "ABCD"), ("parent", "")],
                "Hello world",
                "author=giampaolo\nparent=\npubkey=ABCD\ntimestamp=2026-02-17T10:00:00Z\n\nHello world",
            ),
            (
                &[("author", "alice"), ("signature", "should-be-excluded"), ("pubkey", "XYZ"), ("timestamp", "2026-01-01T00:00:00Z"), ("parent", "abc123")],
                "Reply text",
                "author=alice\nparent=abc123\npubkey=XYZ\ntimestamp=2026-01-01T00:00:00Z\n\nReply text",
            ),
            (
                &[("author", "bob"), ("pubkey", "PQ"), ("timestamp", "T"), ("parent", "")],
                "",
                "author=bob\nparent=\npubkey=PQ\ntimestamp=T\n\n",
            ),
        ];
        for (fields, body, want) in cases {
            let got = canonical_form(fields.iter().copied(), body);
            assert_eq!(String::from_utf8(got).unwrap(), *want);
        }
    }

    #[test]
    fn canonical_form_ignores_input_order() {
        let a = [("b", "2"), ("a", "1"), ("c", "3")];
        let mut b = a;
        b.reverse();
        assert_eq!(canonical_form(a, "x\n\ny"), canonical_form(b, "x\n\ny"));
    }

    #[test]
    fn sign_verify_roundtrip_and_failures() {
        let alice = generate("alice").unwrap();
        let mallory = generate("mallory").unwrap();
        let msg = b"hello forum";
        let sig = alice.sign(msg);

        assert!(verify(&alice.public_key(), msg, &sig).is_ok());
        assert!(matches!(verify(&mallory.public_key(), msg, &sig), Err(CryptoError::Verification)));
        assert!(matches!(verify(&alice.public_key(), b"tampered", &sig), Err(CryptoError::Verification)));
        assert!(matches!(verify(&alice.public_key(), msg, "AAAA"), Err(CryptoError::SignatureLength(3))));
        assert!(verify_with_public_key_b64(&alice.public_key_b64(), msg, &sig).is_ok());
        assert!(verify_with_public_key_b64(&mallory.public_key_b64(), msg, &sig).is_err());
    }

    #[test]
    fn keypair_b64_roundtrip() {
        let id = generate("carol").unwrap();
        let back = Identity::from_keypair_b64("carol", &id.private_key_b64()).unwrap();
        assert_eq!(back.public_key_b64(), id.public_key_b64());
        assert_eq!(STANDARD.decode(id.public_key_b64()).unwrap().len(), 32);
        assert_eq!(STANDARD.decode(id.private_key_b64()).unwrap().len(), 64);
        assert_eq!(id.fingerprint(), id.public_key_b64()[..8]);
    }

    #[test]
    fn usernames_are_path_safe() {
        assert!(validate_username("alice_01").is_ok());
        for bad in ["", "../etc", "a/b", ".hidden", "sp ace"] {
            assert!(validate_username(bad).is_err(), "{bad:?} accepted");
        }
    }
}
