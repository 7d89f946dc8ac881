use thiserror::Error;

/// Recoverable failures of the vectorization core.
///
/// Invariant violations (a transform that was cleared by its capability
/// check hitting a structure it cannot handle) are not represented here;
/// they panic, because continuing would risk a silent miscompile.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A capability check rejected the loop or region. Nothing was mutated;
    /// the caller should fall back to scalar execution.
    #[error("{stage}: cannot transform: {reason}")]
    Infeasible { stage: &'static str, reason: String },

    /// The input IR or context is malformed (missing loop, unknown block).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("config: {0}")]
    Config(#[from] serde_json::Error),
}

impl CoreError {
    pub fn infeasible(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Infeasible {
            stage,
            reason: reason.into(),
        }
    }
}
