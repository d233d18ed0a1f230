use thiserror::Error;

/// Fatal failures of a projection or analysis run.
///
/// Running out of money is not represented here: depletion is ordinary
/// output carried in `MonthlyResult::shortfall`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("malformed scenario: {0}")]
    Shape(String),

    #[error("unknown rate schedule: {0}")]
    UnknownSchedule(String),

    #[error("unknown return model: {0}")]
    UnknownReturnModel(String),

    #[error("invalid analysis options: {0}")]
    InvalidOptions(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error("analysis cancelled")]
    Cancelled,
}

pub type EngineResult<T> = Result<T, EngineError>;

pub(crate) fn shape(msg: impl Into<String>) -> EngineError {
    EngineError::Shape(msg.into())
}
