use thiserror::Error;

/// Failure taxonomy at the broker/store seam. The engine reacts differently
/// to each class: transient failures skip one cycle, validation failures are
/// admission rejections, execution failures feed back into the strategy, and
/// startup failures abort engine start.
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("transient I/O failure: {0}")]
    Transient(String),

    #[error("validation failure: {0}")]
    Validation(String),

    #[error("order execution failed: {0}")]
    Execution(String),

    #[error("startup failure: {0}")]
    Startup(String),
}

impl TradingError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TradingError::Startup(_))
    }
}
