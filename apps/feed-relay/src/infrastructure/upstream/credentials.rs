//! Credential Suppliers
//!
//! [`CredentialSupplier`] adapters. Token refresh happens elsewhere; these
//! only hand out whatever token is current.

use std::path::PathBuf;

use parking_lot::RwLock;

use crate::application::ports::{Credential, CredentialSupplier};

/// In-memory credential, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    current: RwLock<Option<Credential>>,
}

impl StaticCredentials {
    /// Create a supplier holding `token`. An empty token means none.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let current = (!token.trim().is_empty()).then(|| Credential::bearer(token.trim()));
        Self {
            current: RwLock::new(current),
        }
    }

    /// Replace the credential, e.g. after an external refresh.
    pub fn replace(&self, token: impl Into<String>) {
        *self.current.write() = Some(Credential::bearer(token));
    }

    /// Drop the credential.
    pub fn clear(&self) {
        *self.current.write() = None;
    }
}

impl CredentialSupplier for StaticCredentials {
    fn current(&self) -> Option<Credential> {
        self.current.read().clone()
    }
}

/// Credential read from a file on every call, so an external refresher can
/// rotate it by rewriting the file.
#[derive(Debug, Clone)]
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    /// Create a supplier reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSupplier for FileCredentials {
    fn current(&self) -> Option<Credential> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                if token.is_empty() {
                    tracing::warn!(path = %self.path.display(), "Credential file is empty");
                    None
                } else {
                    Some(Credential::bearer(token))
                }
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read credential file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn static_supplier_returns_token() {
        let supplier = StaticCredentials::new("abc");
        assert_eq!(supplier.current().unwrap().token(), "abc");
    }

    #[test]
    fn static_supplier_empty_is_none() {
        assert!(StaticCredentials::new("  ").current().is_none());
    }

    #[test]
    fn static_supplier_replace_and_clear() {
        let supplier = StaticCredentials::new("old");
        supplier.replace("new");
        assert_eq!(supplier.current().unwrap().token(), "new");
        supplier.clear();
        assert!(supplier.current().is_none());
    }

    #[test]
    fn file_supplier_rereads_rotated_token() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "first-token").unwrap();
        let supplier = FileCredentials::new(file.path());
        let first = supplier.current().unwrap();
        assert_eq!(first.token(), "first-token");

        std::fs::write(file.path(), "second-token\n").unwrap();
        let second = supplier.current().unwrap();
        assert_eq!(second.token(), "second-token");
        assert_ne!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn file_supplier_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let supplier = FileCredentials::new(dir.path().join("absent"));
        assert!(supplier.current().is_none());
    }

    #[test]
    fn file_supplier_empty_file_is_none() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(FileCredentials::new(file.path()).current().is_none());
    }
}
