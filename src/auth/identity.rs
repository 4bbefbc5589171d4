//! Local identity store: maps offered public keys to developer identities.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::codec::key_algorithm;

/// The developer behind an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    pub email: String,
    /// Account on the upstream host the developer's keys belong to.
    pub account: String,
}

/// Read-only lookup of developers by public key.
pub trait IdentityStore: Send + Sync {
    /// `wire` is `"<algorithm> <base64 key blob>"` with no comment.
    fn find_user_by_public_key(&self, wire: &str) -> Option<UserIdentity>;
}

/// Canonical `"<algorithm> <base64>"` form of a wire-format key blob.  The
/// algorithm is read from the blob itself, so RSA keys always index as
/// `ssh-rsa` whatever signature hash the client negotiated.
pub fn wire_format(blob: &[u8]) -> Result<String> {
    let algorithm = key_algorithm(blob).context("unreadable public key blob")?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(blob);
    Ok(format!("{algorithm} {encoded}"))
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IdentityFile {
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    username: String,
    email: String,
    account: String,
    #[serde(default)]
    public_keys: Vec<String>,
}

/// Identity store loaded once from a YAML file:
///
/// ```yaml
/// users:
///   - username: alice
///     email: alice@example.com
///     account: alice-gh
///     public_keys:
///       - ssh-ed25519 AAAAC3Nza... alice@laptop
/// ```
#[derive(Debug, Default)]
pub struct FileIdentityStore {
    by_key: HashMap<String, UserIdentity>,
    users: usize,
}

impl FileIdentityStore {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read identity store: {}", path.display()))?;
        let store = Self::from_yaml(&contents)
            .with_context(|| format!("invalid identity store: {}", path.display()))?;
        info!(
            path = %path.display(),
            users = store.users,
            keys = store.by_key.len(),
            "identity store loaded"
        );
        Ok(store)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: IdentityFile = serde_yaml::from_str(yaml)?;
        let mut by_key = HashMap::new();

        for entry in &file.users {
            let identity = UserIdentity {
                username: entry.username.clone(),
                email: entry.email.clone(),
                account: entry.account.clone(),
            };
            for line in &entry.public_keys {
                let wire = parse_authorized_key(line)
                    .with_context(|| format!("user {}: bad public key", entry.username))?;
                if let Some(existing) = by_key.insert(wire, identity.clone()) {
                    bail!(
                        "public key of user {} is also assigned to {}",
                        entry.username,
                        existing.username
                    );
                }
            }
        }

        Ok(Self {
            by_key,
            users: file.users.len(),
        })
    }

    pub fn user_count(&self) -> usize {
        self.users
    }
}

impl IdentityStore for FileIdentityStore {
    fn find_user_by_public_key(&self, wire: &str) -> Option<UserIdentity> {
        let found = self.by_key.get(wire).cloned();
        debug!(found = found.is_some(), "identity lookup");
        found
    }
}

/// Parse one `authorized_keys` style line into its canonical wire string.
fn parse_authorized_key(line: &str) -> Result<String> {
    let mut parts = line.split_whitespace();
    let (Some(algorithm), Some(encoded)) = (parts.next(), parts.next()) else {
        bail!("expected \"<algorithm> <base64> [comment]\"");
    };
    let blob = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("key is not valid base64")?;
    let wire = wire_format(&blob)?;
    let declared = wire.split(' ').next().unwrap_or_default();
    if declared != algorithm {
        bail!("declared algorithm {algorithm} does not match key type {declared}");
    }
    Ok(wire)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::agent::codec::tests::ed25519_blob;

    fn b64(blob: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(blob)
    }

    fn store_yaml() -> String {
        format!(
            r#"
users:
  - username: alice
    email: alice@example.com
    account: alice-gh
    public_keys:
      - ssh-ed25519 {} alice@laptop
      - ssh-ed25519 {}
  - username: bob
    email: bob@example.com
    account: bobby
    public_keys:
      - "ssh-ed25519 {}   bob@desk"
"#,
            b64(&ed25519_blob(1)),
            b64(&ed25519_blob(2)),
            b64(&ed25519_blob(3)),
        )
    }

    #[test]
    fn test_lookup_by_wire_format() {
        let store = FileIdentityStore::from_yaml(&store_yaml()).unwrap();
        assert_eq!(store.user_count(), 2);

        let wire = wire_format(&ed25519_blob(2)).unwrap();
        assert!(wire.starts_with("ssh-ed25519 AAAA"));
        let alice = store.find_user_by_public_key(&wire).unwrap();
        assert_eq!(alice.username, "alice");
        assert_eq!(alice.account, "alice-gh");

        let bob = store
            .find_user_by_public_key(&wire_format(&ed25519_blob(3)).unwrap())
            .unwrap();
        assert_eq!(bob.email, "bob@example.com");

        let unknown = wire_format(&ed25519_blob(9)).unwrap();
        assert!(store.find_user_by_public_key(&unknown).is_none());
    }

    #[test]
    fn test_comment_is_not_part_of_lookup() {
        let store = FileIdentityStore::from_yaml(&store_yaml()).unwrap();
        let with_comment = format!("{} alice@laptop", wire_format(&ed25519_blob(1)).unwrap());
        assert!(store.find_user_by_public_key(&with_comment).is_none());
    }

    #[test]
    fn test_rejects_mismatched_algorithm() {
        let yaml = format!(
            "users:\n  - username: a\n    email: a@x\n    account: a\n    public_keys:\n      - ssh-rsa {}\n",
            b64(&ed25519_blob(1))
        );
        let err = FileIdentityStore::from_yaml(&yaml).unwrap_err();
        assert!(format!("{err:#}").contains("does not match"), "{err:#}");
    }

    #[test]
    fn test_rejects_duplicate_keys() {
        let key = b64(&ed25519_blob(1));
        let yaml = format!(
            "users:\n  - username: a\n    email: a@x\n    account: a\n    public_keys: [\"ssh-ed25519 {key}\"]\n  - username: b\n    email: b@x\n    account: b\n    public_keys: [\"ssh-ed25519 {key}\"]\n"
        );
        let err = FileIdentityStore::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("also assigned to a"), "{err:#}");
    }

    #[test]
    fn test_rejects_garbage_key() {
        let yaml = "users:\n  - username: a\n    email: a@x\n    account: a\n    public_keys: [\"ssh-ed25519 !!!\"]\n";
        assert!(FileIdentityStore::from_yaml(yaml).is_err());
        let yaml = "users:\n  - username: a\n    email: a@x\n    account: a\n    public_keys: [\"ssh-ed25519\"]\n";
        assert!(FileIdentityStore::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(store_yaml().as_bytes()).unwrap();
        let store = FileIdentityStore::load(file.path()).unwrap();
        assert_eq!(store.user_count(), 2);

        assert!(FileIdentityStore::load("/nonexistent/users.yaml").is_err());
    }
}
