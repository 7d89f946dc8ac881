pub mod cfg;
pub mod divergence;
pub mod loops;
pub mod reduction;

pub use cfg::{branch_targets, Cfg, DomTree};
pub use divergence::{DivergenceInfo, Shape, ShapeMap};
pub use loops::{Loop, LoopForest, LoopId};
pub use reduction::{RedKind, Reduction, ReductionTable};
