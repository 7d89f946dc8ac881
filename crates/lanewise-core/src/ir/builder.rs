//! Cursor-style construction of functions, mostly used by tests and by
//! frontends feeding the vectorizer.

use super::block::BlockId;
use super::func::Function;
use super::inst::{BinOp, CmpKind, Op, VoteKind};
use super::ty::{FunctionSig, Type};
use super::value::{Constant, ValueId};

pub struct FunctionBuilder {
    func: Function,
    current: BlockId,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, sig: FunctionSig) -> Self {
        let func = Function::new(name, sig);
        let current = func.entry;
        Self { func, current }
    }

    /// The `index`-th function parameter.
    pub fn param(&self, index: usize) -> ValueId {
        self.func.blocks[self.func.entry].params[index].value
    }

    pub fn create_block(&mut self) -> BlockId {
        self.func.create_block()
    }

    pub fn create_block_with_params(&mut self, tys: &[Type]) -> (BlockId, Vec<ValueId>) {
        let block = self.func.create_block();
        let values = tys
            .iter()
            .map(|&ty| self.func.add_block_param(block, ty))
            .collect();
        (block, values)
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    fn emit(&mut self, op: Op, ty: Type) -> ValueId {
        let id = self.func.make_inst(op, Some(ty));
        self.func.blocks[self.current].insts.push(id);
        self.func.insts[id].result.expect("value-producing op")
    }

    fn emit_effect(&mut self, op: Op) {
        let id = self.func.make_inst(op, None);
        self.func.blocks[self.current].insts.push(id);
    }

    pub fn const_int(&mut self, n: i64) -> ValueId {
        self.emit(Op::Const(Constant::Int(n)), Type::Int(64))
    }

    pub fn const_bool(&mut self, b: bool) -> ValueId {
        self.emit(Op::Const(Constant::Bool(b)), Type::Bool)
    }

    pub fn const_float(&mut self, x: f64) -> ValueId {
        self.emit(Op::Const(Constant::Float(x)), Type::Float(64))
    }

    pub fn binary(&mut self, op: BinOp, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.func.value_type(a);
        self.emit(Op::Binary(op, a, b), ty)
    }

    pub fn add(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.binary(BinOp::Add, a, b)
    }

    pub fn sub(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.binary(BinOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: ValueId, b: ValueId) -> ValueId {
        self.binary(BinOp::Mul, a, b)
    }

    pub fn cmp(&mut self, kind: CmpKind, a: ValueId, b: ValueId) -> ValueId {
        self.emit(Op::Cmp(kind, a, b), Type::Bool)
    }

    pub fn not(&mut self, v: ValueId) -> ValueId {
        self.emit(Op::Not(v), Type::Bool)
    }

    pub fn select(&mut self, cond: ValueId, on_true: ValueId, on_false: ValueId) -> ValueId {
        let ty = self.func.value_type(on_true);
        self.emit(
            Op::Select {
                cond,
                on_true,
                on_false,
            },
            ty,
        )
    }

    pub fn load(&mut self, ptr: ValueId, ty: Type) -> ValueId {
        self.emit(Op::Load { ptr, mask: None }, ty)
    }

    /// An unpredicated vote; predication fills in the mask later.
    pub fn vote(&mut self, kind: VoteKind, value: ValueId) -> ValueId {
        self.emit(
            Op::Vote {
                kind,
                value,
                mask: None,
            },
            kind.result_type(),
        )
    }

    pub fn extract(&mut self, value: ValueId, lane: ValueId) -> ValueId {
        let ty = self.func.value_type(value);
        self.emit(Op::Extract { value, lane }, ty)
    }

    pub fn align(&mut self, value: ValueId, align: u32) -> ValueId {
        let ty = self.func.value_type(value);
        self.emit(Op::Align { value, align }, ty)
    }

    pub fn store(&mut self, ptr: ValueId, value: ValueId) {
        self.emit_effect(Op::Store {
            ptr,
            value,
            mask: None,
        });
    }

    pub fn br(&mut self, target: BlockId, args: &[ValueId]) {
        self.emit_effect(Op::Br {
            target,
            args: args.to_vec(),
        });
    }

    pub fn br_if(
        &mut self,
        cond: ValueId,
        then_target: BlockId,
        then_args: &[ValueId],
        else_target: BlockId,
        else_args: &[ValueId],
    ) {
        self.emit_effect(Op::BrIf {
            cond,
            then_target,
            then_args: then_args.to_vec(),
            else_target,
            else_args: else_args.to_vec(),
        });
    }

    pub fn ret(&mut self, value: Option<ValueId>) {
        self.emit_effect(Op::Return(value));
    }

    pub fn build(self) -> Function {
        self.func
    }
}
