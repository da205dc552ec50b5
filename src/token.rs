//! Gateway token resolution
//!
//! The gateway token authenticates the proxy and the supervisor to the
//! gateway. It must be stable across restarts of the host process, so a
//! generated token is persisted next to the rest of the state.

use rand::RngCore;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

/// Number of random bytes in a generated token
pub const TOKEN_BYTES: usize = 32;

/// Where the token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenSource {
    /// Supplied through configuration or the environment
    Configured,
    /// Read back from the token file
    Persisted,
    /// Freshly generated for this run
    Generated,
}

/// The resolved gateway secret. `Debug` and `Display` never print the value.
#[derive(Clone, PartialEq, Eq)]
pub struct GatewayToken {
    value: String,
    source: TokenSource,
    /// Whether a generated token made it to disk
    persisted: bool,
}

impl GatewayToken {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn source(&self) -> TokenSource {
        self.source
    }

    /// True unless the token was generated and could not be written
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }
}

impl fmt::Debug for GatewayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayToken")
            .field("value", &"<redacted>")
            .field("source", &self.source)
            .field("persisted", &self.persisted)
            .finish()
    }
}

/// Resolve the gateway token.
///
/// Priority: `explicit` (if non-blank) → contents of `path` (trimmed, if
/// non-blank) → a new random token, written to `path` best-effort.
/// Never fails; I/O errors fall through to the next source.
pub fn resolve_token(explicit: Option<&str>, path: &Path) -> GatewayToken {
    if let Some(token) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return GatewayToken {
            value: token.to_string(),
            source: TokenSource::Configured,
            persisted: true,
        };
    }

    match fs::read_to_string(path) {
        Ok(contents) => {
            let existing = contents.trim();
            if !existing.is_empty() {
                debug!(path = %path.display(), "Using persisted gateway token");
                return GatewayToken {
                    value: existing.to_string(),
                    source: TokenSource::Persisted,
                    persisted: true,
                };
            }
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No persisted gateway token");
        }
    }

    let value = generate_token();
    let persisted = match persist_token(path, &value) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to persist gateway token, using it for this run only");
            false
        }
    };

    GatewayToken {
        value,
        source: TokenSource::Generated,
        persisted,
    }
}

/// 32 random bytes, hex encoded
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn persist_token(path: &Path, value: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(value.as_bytes())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_token_wins() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gateway.token");
        fs::write(&path, "from-disk").unwrap();

        let token = resolve_token(Some("  from-config \n"), &path);
        assert_eq!(token.as_str(), "from-config");
        assert_eq!(token.source(), TokenSource::Configured);
    }

    #[test]
    fn test_blank_explicit_token_ignored() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gateway.token");
        fs::write(&path, "from-disk\n").unwrap();

        let token = resolve_token(Some("   "), &path);
        assert_eq!(token.as_str(), "from-disk");
        assert_eq!(token.source(), TokenSource::Persisted);
    }

    #[test]
    fn test_generates_and_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("state").join("gateway.token");

        let token = resolve_token(None, &path);
        assert_eq!(token.source(), TokenSource::Generated);
        assert!(token.is_persisted());
        assert_eq!(token.as_str().len(), TOKEN_BYTES * 2);
        assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fs::read_to_string(&path).unwrap(), token.as_str());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gateway.token");

        let first = resolve_token(None, &path);
        let second = resolve_token(None, &path);
        let third = resolve_token(None, &path);

        assert_eq!(first.as_str(), second.as_str());
        assert_eq!(second.as_str(), third.as_str());
        assert_eq!(second.source(), TokenSource::Persisted);
    }

    #[test]
    fn test_empty_file_regenerates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gateway.token");
        fs::write(&path, "\n  \n").unwrap();

        let token = resolve_token(None, &path);
        assert_eq!(token.source(), TokenSource::Generated);
        assert_eq!(fs::read_to_string(&path).unwrap(), token.as_str());
    }

    #[test]
    fn test_unwritable_path_still_returns_token() {
        let tmp = TempDir::new().unwrap();
        // A regular file where the parent directory should be
        let blocker = tmp.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();
        let path = blocker.join("gateway.token");

        let token = resolve_token(None, &path);
        assert_eq!(token.source(), TokenSource::Generated);
        assert!(!token.is_persisted());
        assert_eq!(token.as_str().len(), TOKEN_BYTES * 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gateway.token");
        resolve_token(None, &path);

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_debug_redacts_value() {
        let tmp = TempDir::new().unwrap();
        let token = resolve_token(Some("super-secret"), &tmp.path().join("t"));
        let debug = format!("{:?}", token);

        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_generated_tokens_differ() {
        assert_ne!(generate_token(), generate_token());
    }
}
