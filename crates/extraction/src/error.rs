use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExtractionError>;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("unknown architecture '{name}' (expected one of: {known})")]
    UnknownArchitecture { name: String, known: String },

    #[error("architecture '{name}' is not available: {reason}")]
    UnavailableArchitecture { name: String, reason: String },

    #[error("pretrained weights cover {matched}/{total} parameters; missing: {missing}")]
    WeightCoverage {
        matched: usize,
        total: usize,
        missing: String,
    },

    #[error("rendezvous failed: {0}")]
    Rendezvous(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("data error: {0}")]
    Data(#[from] imagefolder::DataError),

    #[error("extraction failed: {0}")]
    Runtime(String),
}

impl ExtractionError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn rendezvous(message: impl Into<String>) -> Self {
        Self::Rendezvous(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }
}

impl From<candle_core::Error> for ExtractionError {
    fn from(value: candle_core::Error) -> Self {
        ExtractionError::Runtime(value.to_string())
    }
}

impl From<toml::de::Error> for ExtractionError {
    fn from(value: toml::de::Error) -> Self {
        ExtractionError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for ExtractionError {
    fn from(value: serde_json::Error) -> Self {
        ExtractionError::ConfigFormat(value.to_string())
    }
}
