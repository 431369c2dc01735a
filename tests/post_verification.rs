use gitboard::crypto::{self, Identity};
use gitboard::models::SigStatus;
use gitboard::post::{self, format, parse, sign_post, verify_signature};
use gitboard::store::fs::FsKeyStore;
use gitboard::store::inmem::InMemKeyStore;
use gitboard::store::KeyStore;

fn alice() -> Identity {
    crypto::generate("alice").unwrap()
}

/// Sign, serialize and read back, as a reader of the working tree would.
fn on_disk(id: &Identity, parent: &str, body: &str) -> Vec<u8> {
    let mut p = sign_post(id, parent, body);
    p.filename = "0000_root.md".into();
    format(&p)
}

#[test]
fn registered_key_verifies() {
    let id = alice();
    let keys = InMemKeyStore::new().with_key("alice", &id.public_key_b64());
    let mut p = parse("0000_root.md", &on_disk(&id, "", "hello\n\nworld")).unwrap();
    assert_eq!(p.sig_status, SigStatus::Missing);

    let (status, detail) = verify_signature(&mut p, &keys);
    assert_eq!(status, SigStatus::Valid);
    assert!(detail.is_none());
    assert_eq!(p.sig_status, SigStatus::Valid);
    assert_eq!(p.body, "hello\n\nworld");
}

#[test]
fn unknown_author_is_missing() {
    let id = alice();
    let keys = InMemKeyStore::new();
    let mut p = parse("x.md", &on_disk(&id, "", "hi")).unwrap();
    let (status, detail) = verify_signature(&mut p, &keys);
    assert_eq!(status, SigStatus::Missing);
    assert!(detail.unwrap().contains("alice"));
}

#[test]
fn key_of_someone_else_is_invalid() {
    let id = alice();
    let imposter = crypto::generate("alice").unwrap();
    let keys = InMemKeyStore::new().with_key("alice", &imposter.public_key_b64());
    let mut p = parse("x.md", &on_disk(&id, "", "hi")).unwrap();
    assert_eq!(verify_signature(&mut p, &keys).0, SigStatus::Invalid);
    assert!(p.sig_error.is_some());
}

#[test]
fn tampering_breaks_the_signature() {
    let id = alice();
    let keys = InMemKeyStore::new().with_key("alice", &id.public_key_b64());
    let raw = String::from_utf8(on_disk(&id, "abc123", "pay bob 10")).unwrap();

    for tampered in [
        raw.replace("pay bob 10", "pay bob 99"),
        raw.replace("abc123", "abc124"),
        raw.replace("pay bob 10", "pay bob 10\n"),
    ] {
        let mut p = parse("x.md", tampered.as_bytes()).unwrap();
        assert_eq!(verify_signature(&mut p, &keys).0, SigStatus::Invalid, "{tampered}");
    }

    // re-signing in memory with a changed field also fails against the old signature
    let mut p = parse("x.md", raw.as_bytes()).unwrap();
    p.author = "mallory".into();
    let keys = keys.with_key("mallory", &id.public_key_b64());
    assert_eq!(verify_signature(&mut p, &keys).0, SigStatus::Invalid);
}

#[test]
fn garbage_signature_is_a_status_not_a_panic() {
    let id = alice();
    let keys = InMemKeyStore::new().with_key("alice", &id.public_key_b64());
    let raw = String::from_utf8(on_disk(&id, "", "hi")).unwrap();
    let sig = post::parse("x.md", raw.as_bytes()).unwrap().signature;
    for bad in ["", "not base64 !!", "AAAA"] {
        let mut p = parse("x.md", raw.replace(&sig, bad).as_bytes()).unwrap();
        assert_eq!(verify_signature(&mut p, &keys).0, SigStatus::Invalid, "{bad:?}");
    }

    let keys = InMemKeyStore::new().with_key("alice", "definitely-not-a-key");
    let mut p = parse("x.md", raw.as_bytes()).unwrap();
    assert_eq!(verify_signature(&mut p, &keys).0, SigStatus::Invalid);
}

#[test]
fn working_tree_key_files() {
    let dir = tempfile::tempdir().unwrap();
    let keys = FsKeyStore::new(dir.path().join("keys"));
    let id = alice();

    assert!(keys.public_key("alice").unwrap().is_none());
    keys.put_key("alice", &id.public_key_b64()).unwrap();
    let raw = std::fs::read_to_string(dir.path().join("keys/alice.pub")).unwrap();
    assert_eq!(raw, format!("{}\n", id.public_key_b64()));

    let mut p = parse("x.md", &on_disk(&id, "", "from disk")).unwrap();
    assert_eq!(verify_signature(&mut p, &keys).0, SigStatus::Valid);

    assert!(keys.put_key("../escape", "k").is_err());
}
