//! Shared-secret token for local-subnet authentication
//!
//! The token is 32 bytes from the OS random source, encoded as URL-safe
//! base64 without padding (43 characters) so it can be typed or pasted on a
//! phone. It is persisted to a file with mode 0600 and survives restarts
//! until the user rotates it.
//!
//! # Security Model
//!
//! - The token value never reaches a log line: [`AuthToken`] has a redacted
//!   `Debug` and no `Display`
//! - Presented credentials are compared in constant time over the token length
//! - Rotating replaces the in-memory copy atomically, so a rotated-out token
//!   stops validating immediately

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Length of the token in bytes (before encoding)
pub const TOKEN_BYTES: usize = 32;

/// Environment variable that supplies the token without touching the file
pub const TOKEN_ENV: &str = "CLAUDE_ANYWHERE_TOKEN";

/// Token file name inside the config directory
const TOKEN_FILENAME: &str = "token";

/// Get the default path for the token file
pub fn default_token_path() -> PathBuf {
    crate::config::default_config_dir().join(TOKEN_FILENAME)
}

/// The shared secret, in its encoded transport form
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap an encoded token value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh random token
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Encoded value, for display to the user and out-of-band sync
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare a presented credential in constant time
    ///
    /// A credential of a different length is rejected before the byte loop,
    /// which only reveals the (public) token length.
    pub fn matches(&self, presented: &[u8]) -> bool {
        let expected = self.0.as_bytes();
        if presented.len() != expected.len() {
            return false;
        }

        let mut diff = 0u8;
        for (a, b) in presented.iter().zip(expected.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Read the token at `path`, creating and persisting one if absent
pub fn get_or_create_token(path: &Path) -> io::Result<AuthToken> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let value = contents.trim();
            if !value.is_empty() {
                tracing::debug!("Loaded token from {}", path.display());
                return Ok(AuthToken::new(value));
            }
            tracing::warn!("Token file {} is empty, regenerating", path.display());
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!("No token at {}, generating one", path.display());
        }
        Err(e) => return Err(e),
    }

    let token = AuthToken::generate();
    write_token(path, &token)?;
    Ok(token)
}

/// Write the token file with owner-only permissions
fn write_token(path: &Path, token: &AuthToken) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, format!("{}\n", token.as_str()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Holds the current token and validates presented credentials
///
/// Read-mostly: every connection validates concurrently, only rotation and
/// reload take the write lock.
#[derive(Debug)]
pub struct TokenStore {
    /// Backing file; `None` when the token came from the environment
    path: Option<PathBuf>,
    current: RwLock<AuthToken>,
}

impl TokenStore {
    /// Open the store backed by `path`, creating the token on first use
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let token = get_or_create_token(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(token),
        })
    }

    /// Use `CLAUDE_ANYWHERE_TOKEN` when set, the token file otherwise
    pub fn from_env_or_open(path: impl Into<PathBuf>) -> io::Result<Self> {
        match std::env::var(TOKEN_ENV) {
            Ok(value) if !value.trim().is_empty() => {
                tracing::info!("Using token from {}", TOKEN_ENV);
                Ok(Self::in_memory(AuthToken::new(value.trim())))
            }
            _ => Self::open(path),
        }
    }

    /// A store that never touches the filesystem
    pub fn in_memory(token: AuthToken) -> Self {
        Self {
            path: None,
            current: RwLock::new(token),
        }
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current token
    pub fn token(&self) -> AuthToken {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Whether `presented` is bit-for-bit the current token
    pub fn validate(&self, presented: &[u8]) -> bool {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .matches(presented)
    }

    /// Replace the token with a fresh one and persist it
    pub fn rotate(&self) -> io::Result<AuthToken> {
        let token = AuthToken::generate();
        if let Some(path) = &self.path {
            write_token(path, &token)?;
        }
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token.clone();
        tracing::info!("Token rotated");
        Ok(token)
    }

    /// Re-read the backing file, picking up a rotation made elsewhere
    ///
    /// Returns true if the token changed. A store without a file keeps its
    /// token.
    pub fn reload(&self) -> io::Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };

        let token = get_or_create_token(path)?;
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current == token {
            return Ok(false);
        }
        *current = token;
        tracing::info!("Token reloaded from {}", path.display());
        Ok(true)
    }
}
