//! Change detection error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("git diff {base}..{revision} failed: {message}")]
    Diff {
        base: String,
        revision: String,
        message: String,
    },

    #[error(transparent)]
    Exec(#[from] testbed_core::ExecError),
}
