use gitboard::crypto::{self, CryptoError, Identity};
use serial_test::serial;

#[test]
fn save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/identity.toml");
    let id = crypto::generate("alice").unwrap();
    id.save(&path).unwrap();

    let loaded = Identity::load(&path).unwrap();
    assert_eq!(loaded.username, "alice");
    assert_eq!(loaded.public_key_b64(), id.public_key_b64());
    assert_eq!(loaded.sign(b"msg"), id.sign(b"msg"));

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("username = \"alice\""));
    assert!(raw.contains(&id.public_key_b64()));
}

#[cfg(unix)]
#[test]
fn identity_file_is_private() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.toml");
    crypto::generate("alice").unwrap().save(&path).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn load_or_create_generates_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.toml");

    let (first, created) = Identity::load_or_create(&path, "bob").unwrap();
    assert!(created);
    let (second, created) = Identity::load_or_create(&path, "someone-else").unwrap();
    assert!(!created);
    assert_eq!(second.username, "bob");
    assert_eq!(second.public_key_b64(), first.public_key_b64());
}

#[test]
fn rejects_bad_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.toml");

    assert!(matches!(Identity::load(&path), Err(CryptoError::Io { .. })));

    std::fs::write(&path, "username = [").unwrap();
    assert!(matches!(Identity::load(&path), Err(CryptoError::Decode { .. })));

    // public half that does not belong to the private key
    let a = crypto::generate("a").unwrap();
    let b = crypto::generate("a").unwrap();
    std::fs::write(
        &path,
        format!(
            "username = \"a\"\npublic_key = \"{}\"\nprivate_key = \"{}\"\n",
            b.public_key_b64(),
            a.private_key_b64()
        ),
    )
    .unwrap();
    assert!(matches!(Identity::load(&path), Err(CryptoError::KeyMismatch)));

    assert!(matches!(crypto::generate("../x"), Err(CryptoError::InvalidUsername(_))));
}

#[test]
#[serial]
fn default_path_follows_xdg() {
    let prev = std::env::var_os("XDG_CONFIG_HOME");
    std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdg-test");
    assert_eq!(
        crypto::default_identity_path(),
        std::path::PathBuf::from("/tmp/xdg-test/gitboard/identity.toml")
    );
    match prev {
        Some(v) => std::env::set_var("XDG_CONFIG_HOME", v),
        None => std::env::remove_var("XDG_CONFIG_HOME"),
    }
}
