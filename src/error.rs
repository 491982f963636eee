use thiserror::Error;

#[derive(Error, Debug)]
pub enum SquallError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Number of groups [{num_groups}] exceeds the group limit [{limit}]")]
    GroupLimitExceeded { num_groups: usize, limit: usize },
    #[error("No data: {0}")]
    NoData(String),
    #[error("Remote error in session {session}: {message}")]
    Remote { session: String, message: String },
    #[error("{0}")]
    FieldAlias(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Parse error: {message}")]
    Parse { message: String },
    #[error("Execution error: {0}")]
    Execution(String),
}

impl SquallError {
    pub fn remote(session: &str, message: impl Into<String>) -> Self {
        Self::Remote { session: session.to_string(), message: message.into() }
    }
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into() }
    }
    /// Quota and data errors are reported to the user as-is and never retried.
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Self::GroupLimitExceeded { .. } | Self::NoData(_) | Self::FieldAlias(_))
    }
}

pub type Result<T> = std::result::Result<T, SquallError>;

impl From<regex::Error> for SquallError {
    fn from(e: regex::Error) -> Self { Self::parse(e.to_string()) }
}

impl From<config::ConfigError> for SquallError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}

impl From<serde_json::Error> for SquallError {
    fn from(e: serde_json::Error) -> Self { Self::Execution(e.to_string()) }
}
