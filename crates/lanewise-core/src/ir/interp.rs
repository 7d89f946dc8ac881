//! Lane-parallel reference evaluator.
//!
//! Runs a function on `width` lanes at once: every value is a vector of
//! scalars, memory operations honour their masks lane by lane, and a
//! conditional branch must see the same condition on every lane. Running a
//! function with width 1 gives the scalar semantics a vectorized program is
//! checked against.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use super::block::BlockId;
use super::func::Function;
use super::inst::{BinOp, CmpKind, Op, VoteKind};
use super::ty::Type;
use super::value::{Constant, ValueId};

/// One lane's value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn zero(ty: Type) -> Self {
        Self::from(Constant::zero(ty))
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(self) -> Option<i64> {
        match self {
            Scalar::Int(n) => Some(n),
            _ => None,
        }
    }
}

impl From<Constant> for Scalar {
    fn from(c: Constant) -> Self {
        match c {
            Constant::Bool(b) => Scalar::Bool(b),
            Constant::Int(n) => Scalar::Int(n),
            Constant::Float(x) => Scalar::Float(x),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("branch in {0} is divergent across lanes")]
    DivergentBranch(BlockId),
    #[error("execution exceeded its instruction budget")]
    OutOfFuel,
    #[error("{0} used before definition")]
    Undefined(ValueId),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("{block} fell off the end without a terminator")]
    MissingTerminator { block: BlockId },
    #[error("expected {expected} argument vectors, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("lane {lane} is outside 0..{width}")]
    LaneOutOfRange { lane: i64, width: usize },
    #[error("{0} must be the same on every lane")]
    NotUniform(ValueId),
    #[error("a ballot over {0} lanes does not fit in 64 bits")]
    BallotTooWide(usize),
    #[error("{value} = {found} is not a multiple of {align}")]
    Misaligned { value: ValueId, found: i64, align: u32 },
}

/// Result of one evaluation.
#[derive(Debug, Clone)]
pub struct Execution {
    pub ret: Option<Vec<Scalar>>,
    pub memory: BTreeMap<i64, Scalar>,
    /// How often each block was entered.
    pub visits: HashMap<BlockId, usize>,
}

impl Execution {
    pub fn visits_of(&self, block: BlockId) -> usize {
        self.visits.get(&block).copied().unwrap_or(0)
    }
}

const DEFAULT_FUEL: usize = 1_000_000;

pub struct Evaluator<'a> {
    func: &'a Function,
    width: usize,
    fuel: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(func: &'a Function, width: usize) -> Self {
        assert!(width > 0, "lane count must be positive");
        Self {
            func,
            width,
            fuel: DEFAULT_FUEL,
        }
    }

    pub fn with_fuel(mut self, fuel: usize) -> Self {
        self.fuel = fuel;
        self
    }

    /// Evaluate with one lane vector per function parameter.
    pub fn run(
        &self,
        args: &[Vec<Scalar>],
        memory: BTreeMap<i64, Scalar>,
    ) -> Result<Execution, EvalError> {
        let entry = self.func.entry;
        let params = &self.func.blocks[entry].params;
        if params.len() != args.len() {
            return Err(EvalError::Arity {
                expected: params.len(),
                got: args.len(),
            });
        }
        let mut state = State {
            values: HashMap::new(),
            memory,
            visits: HashMap::new(),
            fuel: self.fuel,
        };
        for (param, lanes) in params.iter().zip(args) {
            assert_eq!(lanes.len(), self.width, "argument lane count");
            state.values.insert(param.value, lanes.clone());
        }

        let mut block = entry;
        loop {
            *state.visits.entry(block).or_default() += 1;
            match self.run_block(block, &mut state)? {
                Flow::Jump(next, args) => {
                    for (param, lanes) in self.func.blocks[next].params.iter().zip(args) {
                        state.values.insert(param.value, lanes);
                    }
                    block = next;
                }
                Flow::Return(ret) => {
                    return Ok(Execution {
                        ret,
                        memory: state.memory,
                        visits: state.visits,
                    });
                }
            }
        }
    }

    fn run_block(&self, block: BlockId, state: &mut State) -> Result<Flow, EvalError> {
        for &inst_id in &self.func.blocks[block].insts {
            if state.fuel == 0 {
                return Err(EvalError::OutOfFuel);
            }
            state.fuel -= 1;

            let inst = &self.func.insts[inst_id];
            let result: Option<Vec<Scalar>> = match &inst.op {
                Op::Br { target, args } => {
                    return Ok(Flow::Jump(*target, state.read_all(args)?));
                }
                Op::BrIf {
                    cond,
                    then_target,
                    then_args,
                    else_target,
                    else_args,
                } => {
                    let lanes = state.read(*cond)?;
                    let first = bool_of(lanes[0])?;
                    for &lane in &lanes[1..] {
                        if bool_of(lane)? != first {
                            return Err(EvalError::DivergentBranch(block));
                        }
                    }
                    return Ok(if first {
                        Flow::Jump(*then_target, state.read_all(then_args)?)
                    } else {
                        Flow::Jump(*else_target, state.read_all(else_args)?)
                    });
                }
                Op::Return(value) => {
                    let ret = value.map(|v| state.read(v)).transpose()?;
                    return Ok(Flow::Return(ret));
                }
                Op::Store { ptr, value, mask } => {
                    let ptrs = state.read(*ptr)?;
                    let values = state.read(*value)?;
                    let active = state.mask_lanes(*mask, self.width)?;
                    for lane in 0..self.width {
                        if active[lane] {
                            state.memory.insert(int_of(ptrs[lane])?, values[lane]);
                        }
                    }
                    None
                }
                Op::Load { ptr, mask } => {
                    let ty = self.result_type(inst.result);
                    let ptrs = state.read(*ptr)?;
                    let active = state.mask_lanes(*mask, self.width)?;
                    let mut out = Vec::with_capacity(self.width);
                    for lane in 0..self.width {
                        let loaded = if active[lane] {
                            state
                                .memory
                                .get(&int_of(ptrs[lane])?)
                                .copied()
                                .unwrap_or(Scalar::zero(ty))
                        } else {
                            Scalar::zero(ty)
                        };
                        out.push(loaded);
                    }
                    Some(out)
                }
                Op::Const(c) => Some(vec![Scalar::from(*c); self.width]),
                Op::Undef(ty) => Some(vec![Scalar::zero(*ty); self.width]),
                Op::Copy(v) => Some(state.read(*v)?),
                Op::Not(v) => Some(
                    state
                        .read(*v)?
                        .into_iter()
                        .map(|s| bool_of(s).map(|b| Scalar::Bool(!b)))
                        .collect::<Result<_, _>>()?,
                ),
                Op::Vote { kind, value, mask } => {
                    let set = state.read(*value)?;
                    let active = state.mask_lanes(*mask, self.width)?;
                    let vote = self.vote(*kind, &set, &active)?;
                    Some(vec![vote; self.width])
                }
                Op::Extract { value, lane } => {
                    let lanes = state.read(*lane)?;
                    if lanes.iter().any(|&l| l != lanes[0]) {
                        return Err(EvalError::NotUniform(*lane));
                    }
                    let index = int_of(lanes[0])?;
                    let picked = usize::try_from(index)
                        .ok()
                        .filter(|&i| i < self.width)
                        .ok_or(EvalError::LaneOutOfRange {
                            lane: index,
                            width: self.width,
                        })?;
                    Some(vec![state.read(*value)?[picked]; self.width])
                }
                Op::Align { value, align } => {
                    let lanes = state.read(*value)?;
                    for &lane in &lanes {
                        if let Scalar::Int(n) = lane {
                            if n.checked_rem(i64::from(*align)) != Some(0) {
                                return Err(EvalError::Misaligned {
                                    value: *value,
                                    found: n,
                                    align: *align,
                                });
                            }
                        }
                    }
                    Some(lanes)
                }
                Op::Binary(op, a, b) => {
                    let (a, b) = (state.read(*a)?, state.read(*b)?);
                    Some(
                        a.into_iter()
                            .zip(b)
                            .map(|(x, y)| eval_binary(*op, x, y))
                            .collect::<Result<_, _>>()?,
                    )
                }
                Op::Cmp(kind, a, b) => {
                    let (a, b) = (state.read(*a)?, state.read(*b)?);
                    Some(
                        a.into_iter()
                            .zip(b)
                            .map(|(x, y)| eval_cmp(*kind, x, y).map(Scalar::Bool))
                            .collect::<Result<_, _>>()?,
                    )
                }
                Op::Select {
                    cond,
                    on_true,
                    on_false,
                } => {
                    let c = state.read(*cond)?;
                    let t = state.read(*on_true)?;
                    let f = state.read(*on_false)?;
                    let mut out = Vec::with_capacity(self.width);
                    for lane in 0..self.width {
                        out.push(if bool_of(c[lane])? { t[lane] } else { f[lane] });
                    }
                    Some(out)
                }
            };
            if let (Some(value), Some(lanes)) = (inst.result, result) {
                state.values.insert(value, lanes);
            }
        }
        Err(EvalError::MissingTerminator { block })
    }

    /// Lanes outside `active` count as unset for `any` and `ballot` and as
    /// set for `all`.
    fn vote(&self, kind: VoteKind, set: &[Scalar], active: &[bool]) -> Result<Scalar, EvalError> {
        let mut bits = Vec::with_capacity(self.width);
        for (&s, &on) in set.iter().zip(active) {
            bits.push(on && bool_of(s)?);
        }
        Ok(match kind {
            VoteKind::Any => Scalar::Bool(bits.contains(&true)),
            VoteKind::All => Scalar::Bool(bits.iter().zip(active).all(|(&b, &on)| b || !on)),
            VoteKind::Ballot => {
                if self.width > 64 {
                    return Err(EvalError::BallotTooWide(self.width));
                }
                let mask = bits
                    .iter()
                    .enumerate()
                    .filter(|&(_, &b)| b)
                    .fold(0u64, |acc, (k, _)| acc | 1u64 << k);
                Scalar::Int(mask as i64)
            }
        })
    }

    fn result_type(&self, result: Option<ValueId>) -> Type {
        result.map_or(Type::Void, |v| self.func.value_type(v))
    }
}

/// Evaluate `func` once per lane with width 1, collecting each lane's
/// return value. Memory is threaded through the runs in lane order.
pub fn run_lanes_scalar(
    func: &Function,
    lane_args: &[Vec<Scalar>],
    mut memory: BTreeMap<i64, Scalar>,
) -> Result<(Vec<Option<Scalar>>, BTreeMap<i64, Scalar>), EvalError> {
    let mut rets = Vec::with_capacity(lane_args.len());
    for args in lane_args {
        let vectors: Vec<Vec<Scalar>> = args.iter().map(|&s| vec![s]).collect();
        let exec = Evaluator::new(func, 1).run(&vectors, memory)?;
        rets.push(exec.ret.map(|r| r[0]));
        memory = exec.memory;
    }
    Ok((rets, memory))
}

enum Flow {
    Jump(BlockId, Vec<Vec<Scalar>>),
    Return(Option<Vec<Scalar>>),
}

struct State {
    values: HashMap<ValueId, Vec<Scalar>>,
    memory: BTreeMap<i64, Scalar>,
    visits: HashMap<BlockId, usize>,
    fuel: usize,
}

impl State {
    fn read(&self, value: ValueId) -> Result<Vec<Scalar>, EvalError> {
        self.values
            .get(&value)
            .cloned()
            .ok_or(EvalError::Undefined(value))
    }

    fn read_all(&self, values: &[ValueId]) -> Result<Vec<Vec<Scalar>>, EvalError> {
        values.iter().map(|&v| self.read(v)).collect()
    }

    fn mask_lanes(&self, mask: Option<ValueId>, width: usize) -> Result<Vec<bool>, EvalError> {
        match mask {
            None => Ok(vec![true; width]),
            Some(m) => self.read(m)?.into_iter().map(bool_of).collect(),
        }
    }
}

fn bool_of(s: Scalar) -> Result<bool, EvalError> {
    s.as_bool()
        .ok_or_else(|| EvalError::TypeMismatch(format!("expected bool, got {s:?}")))
}

fn int_of(s: Scalar) -> Result<i64, EvalError> {
    s.as_int()
        .ok_or_else(|| EvalError::TypeMismatch(format!("expected int, got {s:?}")))
}

/// Total on every input: inactive lanes compute on garbage, so division by
/// zero yields zero instead of trapping.
fn eval_binary(op: BinOp, a: Scalar, b: Scalar) -> Result<Scalar, EvalError> {
    Ok(match (a, b) {
        (Scalar::Int(x), Scalar::Int(y)) => Scalar::Int(match op {
            BinOp::Add => x.wrapping_add(y),
            BinOp::Sub => x.wrapping_sub(y),
            BinOp::Mul => x.wrapping_mul(y),
            BinOp::Div => x.checked_div(y).unwrap_or(0),
            BinOp::Rem => x.checked_rem(y).unwrap_or(0),
            BinOp::And => x & y,
            BinOp::Or => x | y,
            BinOp::Xor => x ^ y,
            BinOp::Shl => x.wrapping_shl(y as u32),
            BinOp::Shr => x.wrapping_shr(y as u32),
            BinOp::Min => x.min(y),
            BinOp::Max => x.max(y),
        }),
        (Scalar::Bool(x), Scalar::Bool(y)) => Scalar::Bool(match op {
            BinOp::And | BinOp::Min | BinOp::Mul => x & y,
            BinOp::Or | BinOp::Max => x | y,
            BinOp::Xor | BinOp::Add | BinOp::Sub => x ^ y,
            _ => {
                return Err(EvalError::TypeMismatch(format!(
                    "{} on bool",
                    op.mnemonic()
                )))
            }
        }),
        (Scalar::Float(x), Scalar::Float(y)) => Scalar::Float(match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Rem => x % y,
            BinOp::Min => x.min(y),
            BinOp::Max => x.max(y),
            _ => {
                return Err(EvalError::TypeMismatch(format!(
                    "{} on float",
                    op.mnemonic()
                )))
            }
        }),
        _ => {
            return Err(EvalError::TypeMismatch(format!(
                "{} on {a:?}, {b:?}",
                op.mnemonic()
            )))
        }
    })
}

fn eval_cmp(kind: CmpKind, a: Scalar, b: Scalar) -> Result<bool, EvalError> {
    let ord = match (a, b) {
        (Scalar::Int(x), Scalar::Int(y)) => x.partial_cmp(&y),
        (Scalar::Float(x), Scalar::Float(y)) => x.partial_cmp(&y),
        (Scalar::Bool(x), Scalar::Bool(y)) => x.partial_cmp(&y),
        _ => return Err(EvalError::TypeMismatch(format!("cmp {a:?}, {b:?}"))),
    };
    let Some(ord) = ord else {
        // Unordered floats: only `ne` holds.
        return Ok(kind == CmpKind::Ne);
    };
    Ok(match kind {
        CmpKind::Eq => ord.is_eq(),
        CmpKind::Ne => ord.is_ne(),
        CmpKind::Lt => ord.is_lt(),
        CmpKind::Le => ord.is_le(),
        CmpKind::Gt => ord.is_gt(),
        CmpKind::Ge => ord.is_ge(),
    })
}
