use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("applying {unit} failed: {message}")]
    Apply { unit: String, message: String },

    #[error("rollout of {target} ({unit}) did not complete: {message}")]
    Timeout {
        unit: String,
        target: String,
        message: String,
    },

    #[error(transparent)]
    Exec(#[from] testbed_core::ExecError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
