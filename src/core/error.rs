use thiserror::Error;

#[derive(Error, Debug)]
pub enum FreezeError {
    #[error("Malformed archive: {0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Invalid base64 payload in {unit}: {reason}")]
    Encoding { unit: String, reason: String },

    #[error("Unreadable unit file {unit}: {reason}")]
    Unit { unit: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid fingerprint: {0} (expected 64 lowercase hex characters)")]
    InvalidFingerprint(String),

    #[error("Unsupported bundle file: {0} (expected .tar or .tar.gz)")]
    UnsupportedBundle(String),

    #[error("More than one pending bundle found: {0:?}")]
    AmbiguousBundle(Vec<String>),

    #[error("No encoded units found in {0}")]
    NoUnits(String),

    #[error("Archive name too long ({len} bytes, max 100): {name}")]
    NameTooLong { name: String, len: usize },
}

impl FreezeError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        FreezeError::Format(msg.into())
    }

    pub(crate) fn decompression(msg: impl Into<String>) -> Self {
        FreezeError::Decompression(msg.into())
    }
}

impl From<serde_json::Error> for FreezeError {
    fn from(e: serde_json::Error) -> Self {
        FreezeError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for FreezeError {
    fn from(e: toml::de::Error) -> Self {
        FreezeError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for FreezeError {
    fn from(e: toml::ser::Error) -> Self {
        FreezeError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FreezeError>;
