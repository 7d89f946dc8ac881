use serde::{Deserialize, Serialize};

use crate::define_entity;

use super::block::BlockId;
use super::ty::Type;
use super::value::{Constant, ValueId};

define_entity!(InstId, "inst");

/// Binary arithmetic / bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Min,
    Max,
}

impl BinOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Rem => "rem",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::Shr => "shr",
            BinOp::Min => "min",
            BinOp::Max => "max",
        }
    }
}

/// Comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpKind {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpKind {
    /// The predicate that holds exactly when `self` does not.
    pub fn negate(self) -> Self {
        match self {
            CmpKind::Eq => CmpKind::Ne,
            CmpKind::Ne => CmpKind::Eq,
            CmpKind::Lt => CmpKind::Ge,
            CmpKind::Le => CmpKind::Gt,
            CmpKind::Gt => CmpKind::Le,
            CmpKind::Ge => CmpKind::Lt,
        }
    }

    /// The predicate that holds on swapped operands.
    pub fn swap(self) -> Self {
        match self {
            CmpKind::Lt => CmpKind::Gt,
            CmpKind::Le => CmpKind::Ge,
            CmpKind::Gt => CmpKind::Lt,
            CmpKind::Ge => CmpKind::Le,
            kind => kind,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            CmpKind::Eq => "eq",
            CmpKind::Ne => "ne",
            CmpKind::Lt => "lt",
            CmpKind::Le => "le",
            CmpKind::Gt => "gt",
            CmpKind::Ge => "ge",
        }
    }
}

/// Cross-lane queries over a boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteKind {
    /// True iff some active lane is set.
    Any,
    /// True iff every active lane is set. Vacuously true with no lanes.
    All,
    /// An `i64` whose bit `k` is set iff active lane `k` is set.
    Ballot,
}

impl VoteKind {
    pub fn mnemonic(self) -> &'static str {
        match self {
            VoteKind::Any => "any",
            VoteKind::All => "all",
            VoteKind::Ballot => "ballot",
        }
    }

    pub fn result_type(self) -> Type {
        match self {
            VoteKind::Any | VoteKind::All => Type::Bool,
            VoteKind::Ballot => Type::Int(64),
        }
    }
}

/// An IR operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Const(Constant),
    /// A value nobody may observe. Evaluates to the zero value of its type.
    Undef(Type),
    Binary(BinOp, ValueId, ValueId),
    Not(ValueId),
    Cmp(CmpKind, ValueId, ValueId),
    Select {
        cond: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    },
    Copy(ValueId),
    /// Load from an integer address. Lanes with a false `mask` read zero.
    Load { ptr: ValueId, mask: Option<ValueId> },
    /// Store to an integer address. Lanes with a false `mask` are skipped.
    Store {
        ptr: ValueId,
        value: ValueId,
        mask: Option<ValueId>,
    },
    /// Uniform vote over `value` on the lanes where `mask` holds.
    Vote {
        kind: VoteKind,
        value: ValueId,
        mask: Option<ValueId>,
    },
    /// Uniform: `value` as seen by lane `lane`. `lane` must be uniform.
    Extract { value: ValueId, lane: ValueId },
    /// `value`, promised to be a multiple of `align` on every lane.
    Align { value: ValueId, align: u32 },
    Br {
        target: BlockId,
        args: Vec<ValueId>,
    },
    BrIf {
        cond: ValueId,
        then_target: BlockId,
        then_args: Vec<ValueId>,
        else_target: BlockId,
        else_args: Vec<ValueId>,
    },
    Return(Option<ValueId>),
}

impl Op {
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Br { .. } | Op::BrIf { .. } | Op::Return(_))
    }

    /// The mask slot of ops that observe which lanes are active: memory
    /// operations and votes.
    pub fn mask_slot(&mut self) -> Option<&mut Option<ValueId>> {
        match self {
            Op::Load { mask, .. } | Op::Store { mask, .. } | Op::Vote { mask, .. } => Some(mask),
            _ => None,
        }
    }

    /// All value operands, branch arguments included, in a fixed order.
    pub fn operands(&self) -> Vec<ValueId> {
        let mut out = Vec::new();
        self.visit_operands(|v| out.push(v));
        out
    }

    pub fn visit_operands(&self, mut f: impl FnMut(ValueId)) {
        match self {
            Op::Const(_) | Op::Undef(_) | Op::Return(None) => {}
            Op::Binary(_, a, b) | Op::Cmp(_, a, b) => {
                f(*a);
                f(*b);
            }
            Op::Not(v) | Op::Copy(v) | Op::Return(Some(v)) => f(*v),
            Op::Align { value, .. } => f(*value),
            Op::Extract { value, lane } => {
                f(*value);
                f(*lane);
            }
            Op::Vote { value, mask, .. } => {
                f(*value);
                if let Some(m) = mask {
                    f(*m);
                }
            }
            Op::Select {
                cond,
                on_true,
                on_false,
            } => {
                f(*cond);
                f(*on_true);
                f(*on_false);
            }
            Op::Load { ptr, mask } => {
                f(*ptr);
                if let Some(m) = mask {
                    f(*m);
                }
            }
            Op::Store { ptr, value, mask } => {
                f(*ptr);
                f(*value);
                if let Some(m) = mask {
                    f(*m);
                }
            }
            Op::Br { args, .. } => args.iter().copied().for_each(f),
            Op::BrIf {
                cond,
                then_args,
                else_args,
                ..
            } => {
                f(*cond);
                then_args.iter().copied().for_each(&mut f);
                else_args.iter().copied().for_each(&mut f);
            }
        }
    }

    /// Visit every operand slot mutably, in the same order as [`Op::operands`].
    pub fn visit_operands_mut(&mut self, mut f: impl FnMut(&mut ValueId)) {
        match self {
            Op::Const(_) | Op::Undef(_) | Op::Return(None) => {}
            Op::Binary(_, a, b) | Op::Cmp(_, a, b) => {
                f(a);
                f(b);
            }
            Op::Not(v) | Op::Copy(v) | Op::Return(Some(v)) => f(v),
            Op::Align { value, .. } => f(value),
            Op::Extract { value, lane } => {
                f(value);
                f(lane);
            }
            Op::Vote { value, mask, .. } => {
                f(value);
                if let Some(m) = mask {
                    f(m);
                }
            }
            Op::Select {
                cond,
                on_true,
                on_false,
            } => {
                f(cond);
                f(on_true);
                f(on_false);
            }
            Op::Load { ptr, mask } => {
                f(ptr);
                if let Some(m) = mask {
                    f(m);
                }
            }
            Op::Store { ptr, value, mask } => {
                f(ptr);
                f(value);
                if let Some(m) = mask {
                    f(m);
                }
            }
            Op::Br { args, .. } => args.iter_mut().for_each(f),
            Op::BrIf {
                cond,
                then_args,
                else_args,
                ..
            } => {
                f(cond);
                then_args.iter_mut().for_each(&mut f);
                else_args.iter_mut().for_each(&mut f);
            }
        }
    }
}

/// An instruction: an op plus its optional result value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inst {
    pub op: Op,
    pub result: Option<ValueId>,
}
