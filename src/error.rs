use thiserror::Error;

/// Error taxonomy for the APFS core.
///
/// `NotFound` is deliberately absent here: a lookup that finds nothing is a
/// value (`Option::None`), not an error. Every variant below is something
/// that should propagate to the caller with enough context to locate the
/// faulty block.
#[derive(Error, Debug)]
pub enum ApfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("{context}: expected object type {expected:#x}, got {got:#x}")]
    InvalidObjectType {
        context: &'static str,
        expected: u32,
        got: u32,
    },

    #[error("checksum mismatch for oid={oid} xid={xid}")]
    ChecksumMismatch { oid: u64, xid: u64 },

    #[error("{context}: out of bounds ({detail})")]
    OutOfBounds {
        context: &'static str,
        detail: String,
    },

    #[error("{context}: {detail}")]
    Corruption {
        context: &'static str,
        detail: String,
    },

    #[error("unsupported: {what}")]
    Unsupported { what: String },

    #[error("descent exceeded maximum depth of {max}")]
    DepthExceeded { max: usize },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("no volume found in container")]
    NoVolume,

    #[error("volume index {0} out of range")]
    NoSuchVolume(usize),
}

impl ApfsError {
    pub(crate) fn corrupt(context: &'static str, detail: impl Into<String>) -> Self {
        ApfsError::Corruption {
            context,
            detail: detail.into(),
        }
    }

    pub(crate) fn oob(context: &'static str, detail: impl Into<String>) -> Self {
        ApfsError::OutOfBounds {
            context,
            detail: detail.into(),
        }
    }

    pub(crate) fn unsupported(what: impl Into<String>) -> Self {
        ApfsError::Unsupported { what: what.into() }
    }
}

pub type Result<T> = std::result::Result<T, ApfsError>;
