use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::PrimaryMap;

use super::block::{Block, BlockId, BlockParam};
use super::inst::{Inst, InstId, Op};
use super::ty::{FunctionSig, Type};
use super::value::ValueId;

/// A function in the IR.
///
/// Blocks own their instruction lists; the `insts` arena may retain entries
/// that no block references any more (rewritten terminators, dropped merges).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub sig: FunctionSig,
    pub blocks: PrimaryMap<BlockId, Block>,
    pub insts: PrimaryMap<InstId, Inst>,
    pub value_types: PrimaryMap<ValueId, Type>,
    /// Entry block, always the first block.
    pub entry: BlockId,
}

impl Function {
    /// Create a function whose entry block carries one parameter per
    /// signature parameter.
    pub fn new(name: impl Into<String>, sig: FunctionSig) -> Self {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(Block::default());
        let mut func = Self {
            name: name.into(),
            sig,
            blocks,
            insts: PrimaryMap::new(),
            value_types: PrimaryMap::new(),
            entry,
        };
        for ty in func.sig.params.clone() {
            func.add_block_param(entry, ty);
        }
        func
    }

    pub fn new_value(&mut self, ty: Type) -> ValueId {
        self.value_types.push(ty)
    }

    pub fn create_block(&mut self) -> BlockId {
        self.blocks.push(Block::default())
    }

    /// Append a parameter to `block`. Callers are responsible for passing a
    /// matching argument on every incoming edge.
    pub fn add_block_param(&mut self, block: BlockId, ty: Type) -> ValueId {
        let value = self.new_value(ty);
        self.blocks[block].params.push(BlockParam { value, ty });
        value
    }

    pub fn param_values(&self, block: BlockId) -> Vec<ValueId> {
        self.blocks[block].params.iter().map(|p| p.value).collect()
    }

    pub fn value_type(&self, value: ValueId) -> Type {
        self.value_types[value]
    }

    /// The terminator instruction of `block`, if it has one.
    pub fn terminator(&self, block: BlockId) -> Option<InstId> {
        let last = *self.blocks[block].insts.last()?;
        self.insts[last].op.is_terminator().then_some(last)
    }

    pub fn terminator_op(&self, block: BlockId) -> Option<&Op> {
        self.terminator(block).map(|id| &self.insts[id].op)
    }

    /// Allocate an instruction in the arena without placing it in a block.
    pub fn make_inst(&mut self, op: Op, result_ty: Option<Type>) -> InstId {
        let result = result_ty.map(|ty| self.new_value(ty));
        self.insts.push(Inst { op, result })
    }

    /// Insert a value-producing op at `index` in `block`.
    pub fn insert_at(&mut self, block: BlockId, index: usize, op: Op, ty: Type) -> ValueId {
        let id = self.make_inst(op, Some(ty));
        self.blocks[block].insts.insert(index, id);
        self.insts[id].result.expect("result allocated above")
    }

    /// Insert a value-producing op right before the terminator of `block`
    /// (or at the end if the block is still open).
    pub fn insert_before_terminator(&mut self, block: BlockId, op: Op, ty: Type) -> ValueId {
        let len = self.blocks[block].insts.len();
        let index = if self.terminator(block).is_some() {
            len - 1
        } else {
            len
        };
        self.insert_at(block, index, op, ty)
    }

    /// Insert a value-producing op immediately after `anchor`.
    pub fn insert_after(&mut self, anchor: InstId, op: Op, ty: Type) -> ValueId {
        let (block, index) = self
            .inst_position(anchor)
            .unwrap_or_else(|| panic!("{anchor} is not placed in any block"));
        self.insert_at(block, index + 1, op, ty)
    }

    /// Place a side-effecting op (no result) before the terminator.
    pub fn insert_effect_before_terminator(&mut self, block: BlockId, op: Op) -> InstId {
        let id = self.make_inst(op, None);
        let len = self.blocks[block].insts.len();
        let index = if self.terminator(block).is_some() {
            len - 1
        } else {
            len
        };
        self.blocks[block].insts.insert(index, id);
        id
    }

    /// Replace the terminator of `block`, or append one if it has none.
    pub fn set_terminator(&mut self, block: BlockId, op: Op) {
        debug_assert!(op.is_terminator());
        match self.terminator(block) {
            Some(id) => self.insts[id].op = op,
            None => {
                let id = self.make_inst(op, None);
                self.blocks[block].insts.push(id);
            }
        }
    }

    /// Block and index of a placed instruction.
    pub fn inst_position(&self, inst: InstId) -> Option<(BlockId, usize)> {
        self.blocks.iter().find_map(|(block_id, block)| {
            block
                .insts
                .iter()
                .position(|&i| i == inst)
                .map(|index| (block_id, index))
        })
    }

    /// The instruction producing `value`, if it is not a block parameter.
    pub fn defining_inst(&self, value: ValueId) -> Option<InstId> {
        self.blocks
            .values()
            .flat_map(|b| b.insts.iter().copied())
            .find(|&id| self.insts[id].result == Some(value))
    }

    /// Map every live value (parameters and placed results) to its block.
    pub fn def_blocks(&self) -> HashMap<ValueId, BlockId> {
        let mut defs = HashMap::new();
        for (block_id, block) in self.blocks.iter() {
            for param in &block.params {
                defs.insert(param.value, block_id);
            }
            for &inst in &block.insts {
                if let Some(result) = self.insts[inst].result {
                    defs.insert(result, block_id);
                }
            }
        }
        defs
    }

    /// Snapshot of every placed use site of `value`.
    pub fn uses_of(&self, value: ValueId) -> Vec<(BlockId, InstId)> {
        let mut uses = Vec::new();
        for (block_id, block) in self.blocks.iter() {
            for &inst in &block.insts {
                if self.insts[inst].op.operands().contains(&value) {
                    uses.push((block_id, inst));
                }
            }
        }
        uses
    }

    /// Number of operand slots (over all placed instructions) holding `value`.
    pub fn use_count(&self, value: ValueId) -> usize {
        self.blocks
            .values()
            .flat_map(|b| b.insts.iter())
            .map(|&inst| {
                self.insts[inst]
                    .op
                    .operands()
                    .iter()
                    .filter(|&&v| v == value)
                    .count()
            })
            .sum()
    }

    /// Rewrite operand slots holding `old` to `new` in the given instructions.
    pub fn replace_operand(&mut self, inst: InstId, old: ValueId, new: ValueId) {
        self.insts[inst].op.visit_operands_mut(|v| {
            if *v == old {
                *v = new;
            }
        });
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.sig.params.iter().map(|t| t.to_string()).collect();
        writeln!(f, "fn {}({}) -> {} {{", self.name, params.join(", "), self.sig.return_ty)?;
        for (block_id, block) in self.blocks.iter() {
            let params: Vec<String> = block
                .params
                .iter()
                .map(|p| format!("{}: {}", p.value, p.ty))
                .collect();
            writeln!(f, "  {block_id}({}):", params.join(", "))?;
            for &inst in &block.insts {
                let inst = &self.insts[inst];
                write!(f, "    ")?;
                if let Some(result) = inst.result {
                    write!(f, "{result} = ")?;
                }
                writeln!(f, "{}", DisplayOp(&inst.op))?;
            }
        }
        write!(f, "}}")
    }
}

struct DisplayOp<'a>(&'a Op);

fn join(values: &[ValueId]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn masked(mask: &Option<ValueId>) -> String {
    mask.map(|m| format!(" if {m}")).unwrap_or_default()
}

impl fmt::Display for DisplayOp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Op::Const(c) => write!(f, "const {c}"),
            Op::Undef(ty) => write!(f, "undef {ty}"),
            Op::Binary(op, a, b) => write!(f, "{} {a}, {b}", op.mnemonic()),
            Op::Not(v) => write!(f, "not {v}"),
            Op::Cmp(kind, a, b) => write!(f, "cmp.{} {a}, {b}", kind.mnemonic()),
            Op::Select {
                cond,
                on_true,
                on_false,
            } => write!(f, "select {cond}, {on_true}, {on_false}"),
            Op::Copy(v) => write!(f, "copy {v}"),
            Op::Load { ptr, mask } => write!(f, "load {ptr}{}", masked(mask)),
            Op::Store { ptr, value, mask } => write!(f, "store {ptr}, {value}{}", masked(mask)),
            Op::Vote { kind, value, mask } => write!(f, "{} {value}{}", kind.mnemonic(), masked(mask)),
            Op::Extract { value, lane } => write!(f, "extract {value}, {lane}"),
            Op::Align { value, align } => write!(f, "align {value}, {align}"),
            Op::Br { target, args } => write!(f, "br {target}({})", join(args)),
            Op::BrIf {
                cond,
                then_target,
                then_args,
                else_target,
                else_args,
            } => write!(
                f,
                "br_if {cond}, {then_target}({}), {else_target}({})",
                join(then_args),
                join(else_args)
            ),
            Op::Return(Some(v)) => write!(f, "return {v}"),
            Op::Return(None) => write!(f, "return"),
        }
    }
}
