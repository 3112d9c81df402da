use thiserror::Error;

/// Errors reported by backends, the transfer engine and the archive/crypto subsystems.
#[derive(Error, Debug)]
pub enum VfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// A backend rejected an operation; carries enough context to display.
    #[error("{op} {path}: {message}")]
    Remote {
        op: &'static str,
        path: String,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    /// Wrong passphrase or corrupted file. The two cannot be told apart.
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Invalid path in archive: {0}")]
    PathTraversal(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type VfsResult<T> = Result<T, VfsError>;

impl VfsError {
    pub fn remote(op: &'static str, path: &str, message: impl ToString) -> Self {
        VfsError::Remote {
            op,
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    /// True when the target path does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            VfsError::NotFound(_) => true,
            VfsError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True when the user aborted the operation; the UI should not show an error for it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, VfsError::Cancelled)
    }
}

impl From<zip::result::ZipError> for VfsError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => VfsError::Io(io),
            other => VfsError::Archive(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_taxonomy() {
        assert!(VfsError::NotFound("/x".into()).is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(VfsError::from(io).is_not_found());
        assert!(!VfsError::Cancelled.is_not_found());
        assert!(VfsError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_remote_error_message_has_context() {
        let e = VfsError::remote("rename", "/a/b", "550 denied");
        assert_eq!(e.to_string(), "rename /a/b: 550 denied");
    }
}
