use std::io;

#[derive(thiserror::Error, Debug)]
pub enum LsmKvError {
    #[error("{0}")]
    IOError(#[from] io::Error),

    #[error("corrupted data: {0}")]
    CorruptedData(String),

    #[error("manifest file: {0}")]
    ManifestFile(String),

    #[error("log writer: {0}")]
    LogWriter(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    SendError(#[from] crossbeam_channel::SendError<()>),

    #[error("database is shutting down")]
    ShutDown,

    #[error("{0}")]
    Custom(String),
}

impl LsmKvError {
    #[inline]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptedData(_))
    }

    #[inline]
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::IOError(_))
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Self::CorruptedData(msg.into())
    }
}

/// Background errors are sticky and handed to every later writer, so the
/// error has to be cloneable even though `io::Error` is not.
impl Clone for LsmKvError {
    fn clone(&self) -> Self {
        match self {
            Self::IOError(e) => Self::IOError(io::Error::new(e.kind(), e.to_string())),
            Self::CorruptedData(s) => Self::CorruptedData(s.clone()),
            Self::ManifestFile(s) => Self::ManifestFile(s.clone()),
            Self::LogWriter(s) => Self::LogWriter(s.clone()),
            Self::NotSupported(s) => Self::NotSupported(s.clone()),
            Self::InvalidArgument(s) => Self::InvalidArgument(s.clone()),
            Self::SendError(_) => Self::SendError(crossbeam_channel::SendError(())),
            Self::ShutDown => Self::ShutDown,
            Self::Custom(s) => Self::Custom(s.clone()),
        }
    }
}

impl PartialEq for LsmKvError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::IOError(e1), Self::IOError(e2)) => e1.kind() == e2.kind(),
            (Self::SendError(_), Self::SendError(_)) | (Self::ShutDown, Self::ShutDown) => true,
            (Self::CorruptedData(s1), Self::CorruptedData(s2))
            | (Self::ManifestFile(s1), Self::ManifestFile(s2))
            | (Self::LogWriter(s1), Self::LogWriter(s2))
            | (Self::NotSupported(s1), Self::NotSupported(s2))
            | (Self::InvalidArgument(s1), Self::InvalidArgument(s2))
            | (Self::Custom(s1), Self::Custom(s2)) => s1.eq(s2),
            _ => false,
        }
    }
}
