use thiserror::Error;

/// Error taxonomy for the probability pipeline and decision layer.
///
/// Numeric kernels return these as values; they never panic. Only the API
/// boundary converts them into request failures.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Too few observations to fit a model or calibrator. No partial state
    /// is persisted when this is returned.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// The optimiser did not meet its convergence criteria. The caller is
    /// expected to retry once with a tighter tolerance before surfacing.
    #[error("optimiser failed to converge after {iterations} iterations (grad norm {grad_norm:.3e})")]
    NonConvergence { iterations: usize, grad_norm: f64 },

    /// Malformed request input: bad odds, unknown teams, negative goals.
    /// Rejects the whole request.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Expected goals out of the supported range; the fixture is skipped
    /// and the condition recorded.
    #[error("invalid lambda for fixture {fixture_id}: ({lambda_home:.4}, {lambda_away:.4})")]
    InvalidLambda {
        fixture_id: i64,
        lambda_home: f64,
        lambda_away: f64,
    },

    /// A feature-store value was absent where one was expected. Handled by
    /// defaulting (multiplier 1.0, pass-through calibrator) and logged as a
    /// warning; carried here only for accounting.
    #[error("missing feature {feature} for fixture {fixture_id}")]
    MissingFeature { fixture_id: i64, feature: &'static str },

    /// The request deadline was exceeded. Nothing is persisted.
    #[error("request deadline exceeded")]
    Timeout,

    /// Per-ticket soft rejection from the decision evaluator. Never a
    /// request failure.
    #[error("ticket rejected: {0}")]
    ContradictionReject(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown entity: {0}")]
    NotFound(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
