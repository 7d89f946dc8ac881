pub mod block;
pub mod builder;
pub mod func;
pub mod inst;
pub mod interp;
pub mod ty;
pub mod value;

pub use block::{Block, BlockId, BlockParam};
pub use func::Function;
pub use inst::{BinOp, CmpKind, Inst, InstId, Op, VoteKind};
pub use ty::{FunctionSig, Type};
pub use value::{Constant, ValueId};
