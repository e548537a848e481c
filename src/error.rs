use thiserror::Error;

#[derive(Error, Debug)]
pub enum FinderError {
    #[error("key source id is missing or empty")]
    KeySourceIdMissing,

    #[error("key source id '{0}' is declared more than once")]
    KeySourceIdNotUnique(String),

    #[error("producer references unknown key source id '{0}'")]
    KeySourceIdUnknown(String),

    #[error("grid bits {bits} out of range, maximum is {max}")]
    GridBitsOutOfRange { bits: u32, max: u32 },

    #[error("address store at '{path}': {reason}")]
    StoreFormat { path: String, reason: String },

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("self-test mismatch on backend '{backend}': base {base}, key index {index}")]
    SelfTestMismatch {
        backend: String,
        base: String,
        index: usize,
    },

    #[error("invalid scalar for derivation")]
    InvalidScalar,

    #[error("invalid secret line: {0}")]
    SecretParse(String),

    #[error("invalid vanity pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FinderError>;
