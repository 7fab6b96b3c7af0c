//! OpenSSH text forms of public keys.

use russh::keys::ssh_key::HashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};

/// Canonical encoded form handed to lookups: `"<algorithm> <base64>"`, the
/// `authorized_keys` line without options or comment.
pub fn encode_public_key(key: &PublicKey) -> String {
    format!("{} {}", key.algorithm().as_str(), key.public_key_base64())
}

/// SHA-256 fingerprint in `ssh-keygen -l` format (`SHA256:...`).
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Reduce an encoded key to its first two fields so that comments and extra
/// whitespace do not affect matching.
pub(crate) fn normalize_encoded_key(encoded: &str) -> Option<String> {
    let mut fields = encoded.split_whitespace();
    let algorithm = fields.next()?;
    let blob = fields.next()?;
    Some(format!("{} {}", algorithm, blob))
}

/// Parse one `authorized_keys` line, skipping any leading options field.
///
/// Returns `None` for blank lines, comments and lines without a parsable key.
pub(crate) fn parse_authorized_key_line(line: &str) -> Option<PublicKey> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    // The key starts at some whitespace-separated field; options come first
    // when present (e.g. `command="..." ssh-ed25519 AAAA... comment`).
    let mut rest = line;
    loop {
        if let Ok(key) = PublicKey::from_openssh(rest) {
            return Some(key);
        }
        let (_, tail) = rest.split_once(char::is_whitespace)?;
        rest = tail.trim_start();
        if rest.is_empty() {
            return None;
        }
    }
}
