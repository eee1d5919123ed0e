use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use subtle::ConstantTimeEq;

const TOKEN_BYTES: usize = 32;

/// Bearer credential shared by the daemon and every client on the machine.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a presented credential.
    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(..)")
    }
}

pub struct TokenStore;

impl TokenStore {
    /// Reads the token file, or generates and persists a fresh token when it
    /// is missing or empty.
    pub fn load_or_create(path: &Path) -> Result<AuthToken> {
        if let Some(token) = read_token(path)? {
            return Ok(token);
        }
        if path.exists() {
            // Empty leftover from an interrupted start.
            fs::remove_file(path).with_context(|| format!("replacing {}", path.display()))?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut bytes = [0u8; TOKEN_BYTES];
        getrandom::fill(&mut bytes)
            .map_err(|err| anyhow::anyhow!("generating auth token: {err}"))?;
        let token = hex::encode(bytes);

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        match options.open(path) {
            Ok(mut file) => {
                file.write_all(token.as_bytes())
                    .with_context(|| format!("writing {}", path.display()))?;
                file.sync_all().ok();
                Ok(AuthToken(token))
            }
            // A concurrent daemon won the race; use its token.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Self::load(path),
            Err(err) => Err(err).with_context(|| format!("creating {}", path.display())),
        }
    }

    /// Reads an existing token. Fails when the file is missing or empty.
    pub fn load(path: &Path) -> Result<AuthToken> {
        match read_token(path)? {
            Some(token) => Ok(token),
            None => bail!(
                "auth token {} is missing or empty; is the daemon running?",
                path.display()
            ),
        }
    }
}

fn read_token(path: &Path) -> Result<Option<AuthToken>> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            Ok((!trimmed.is_empty()).then(|| AuthToken(trimmed.to_string())))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_once_then_reuses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("token");
        let first = TokenStore::load_or_create(&path).unwrap();
        assert_eq!(first.as_str().len(), TOKEN_BYTES * 2);
        let second = TokenStore::load_or_create(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(TokenStore::load(&path).unwrap(), first);
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        TokenStore::load_or_create(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn existing_token_is_trimmed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        fs::write(&path, "abc123\n").unwrap();
        assert_eq!(TokenStore::load_or_create(&path).unwrap().as_str(), "abc123");
    }

    #[test]
    fn empty_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        fs::write(&path, "  \n").unwrap();
        let token = TokenStore::load_or_create(&path).unwrap();
        assert_eq!(token.as_str().len(), TOKEN_BYTES * 2);
    }

    #[test]
    fn load_requires_a_token() {
        let dir = TempDir::new().unwrap();
        let err = TokenStore::load(&dir.path().join("token")).unwrap_err();
        assert!(err.to_string().contains("missing or empty"));
    }

    #[test]
    fn matching_is_exact() {
        let token = AuthToken::new("secret");
        assert!(token.matches("secret"));
        assert!(!token.matches("secret "));
        assert!(!token.matches(""));
        assert_eq!(format!("{token:?}"), "AuthToken(..)");
    }
}
