use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// Read or write failure on a specific partition. Retryable: the
    /// partition on disk is still in its pre-operation state.
    PartitionIo {
        partition: String,
        source: std::io::Error,
    },
    Corrupt(&'static str),
    CorruptManifest(String),
    Unsupported(&'static str),
    UnsupportedVersion(u32),
    /// An index references a partition that no longer matches the on-disk
    /// state. The caller is expected to trigger a rebuild.
    IndexInconsistency(String),
    InvalidRecord(String),
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::PartitionIo { partition, source } => {
                write!(f, "partition io error in {partition}: {source}")
            }
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::CorruptManifest(msg) => write!(f, "corrupt manifest: {msg}"),
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Error::UnsupportedVersion(version) => write!(f, "unsupported version: {version}"),
            Error::IndexInconsistency(msg) => write!(f, "index inconsistency: {msg}"),
            Error::InvalidRecord(msg) => write!(f, "invalid record: {msg}"),
            Error::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::PartitionIo { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

impl Error {
    /// Whether the caller may retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PartitionIo { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
