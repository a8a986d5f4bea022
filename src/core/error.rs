use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Cannot unlink the root directory")]
    RootUnlink,

    #[error("Invalid entry name: {0:?}")]
    InvalidName(String),

    #[error("File system is read-only: {0}")]
    ReadOnly(String),

    #[error("Buffer pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Buffer {0} has already been released")]
    BufferReleased(String),

    #[error("Socket peering changed while a stream is active")]
    IllegalPeering,

    #[error("Entry stream has been forcibly closed: {0}")]
    ForcedClosed(String),

    #[error("Mount {mount} is busy: {streams} open stream(s)")]
    Busy { mount: String, streams: usize },

    #[error("No archive driver registered for {0}")]
    NoDriver(String),

    #[error("Authentication cancelled for {0}")]
    AuthCancelled(String),

    #[error("Corrupt archive {mount}: {reason}")]
    Corrupt { mount: String, reason: String },

    #[error("{} failure(s) while draining buffered entries", .0.len())]
    Drain(Vec<FsError>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FsError {
    /// Programming errors abort the operation; everything else may be retried
    /// or reported.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FsError::BufferReleased(_) | FsError::IllegalPeering)
    }

    /// Wrap into an `std::io::Error` so it can travel through `Read`/`Write`.
    pub fn into_io(self) -> std::io::Error {
        match self {
            FsError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }

    /// Inverse of [`FsError::into_io`]: recover a wrapped kernel error.
    pub fn from_io(err: std::io::Error) -> Self {
        if err
            .get_ref()
            .map(|inner| inner.is::<FsError>())
            .unwrap_or(false)
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(fs) = inner.downcast::<FsError>() {
                    return *fs;
                }
            }
            // into_inner only fails for errors without a payload, which the
            // check above rules out.
            return FsError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "lost wrapped error",
            ));
        }
        FsError::Io(err)
    }

    pub(crate) fn corrupt(mount: &str, reason: impl Into<String>) -> Self {
        FsError::Corrupt {
            mount: mount.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
