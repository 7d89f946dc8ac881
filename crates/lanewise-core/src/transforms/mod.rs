pub mod div_loop;
pub mod linearize;
pub mod lower;
pub mod mask_expander;
pub mod polish;
pub mod red_opt;
pub mod rem_transform;
pub(crate) mod util;


pub use div_loop::DivLoopTransform;
pub use linearize::Linearizer;
pub use lower::lower_lane_ops;
pub use mask_expander::MaskExpander;
pub use polish::MaskPolish;
pub use red_opt::ReductionOptimization;
pub use rem_transform::{RemainderPlan, RemainderTransform};

/// Outcome of a capability check.
///
/// Only a `Committed` plan can be handed to the mutating half of a
/// transform, and committing guarantees that half will succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feasibility<P> {
    Rejected(String),
    Committed(P),
}

impl<P> Feasibility<P> {
    pub fn is_committed(&self) -> bool {
        matches!(self, Feasibility::Committed(_))
    }

    /// Turn a rejection into [`crate::CoreError::Infeasible`].
    pub fn into_result(self, stage: &'static str) -> Result<P, crate::CoreError> {
        match self {
            Feasibility::Committed(plan) => Ok(plan),
            Feasibility::Rejected(reason) => Err(crate::CoreError::infeasible(stage, reason)),
        }
    }
}
