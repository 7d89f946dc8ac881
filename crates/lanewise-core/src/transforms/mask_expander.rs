//! Lazily materialized block and edge predicates.
//!
//! A block's mask is true on a lane iff the lane reaches the block. Masks are
//! built on demand: a request recurses into the predecessors, inserting
//! `and`/`not` into predecessor blocks and boolean parameters at joins.
//! Every block and every edge gets at most one mask value.

use crate::analysis::{DivergenceInfo, LoopId, Shape};
use crate::context::{Analyses, VectorizationContext};
use crate::ir::{BinOp, BlockId, Constant, Op, Type, ValueId};

use super::util::append_edge_arg;

pub struct MaskExpander<'a> {
    ctx: &'a mut VectorizationContext,
    an: Analyses,
}

impl<'a> MaskExpander<'a> {
    /// Snapshot the current analyses. Mask expansion adds parameters and
    /// instructions but never edges, so the snapshot stays valid for the
    /// expander's lifetime.
    pub fn new(ctx: &'a mut VectorizationContext) -> Self {
        let an = ctx.analyses().clone();
        Self { ctx, an }
    }

    pub fn const_true(&mut self) -> ValueId {
        self.constant(true)
    }

    pub fn const_false(&mut self) -> ValueId {
        self.constant(false)
    }

    fn constant(&mut self, b: bool) -> ValueId {
        let cached = if b {
            self.ctx.masks.true_const
        } else {
            self.ctx.masks.false_const
        };
        if let Some(v) = cached {
            return v;
        }
        let entry = self.ctx.func.entry;
        let v = self
            .ctx
            .func
            .insert_at(entry, 0, Op::Const(Constant::Bool(b)), Type::Bool);
        self.ctx.shapes.set(v, Shape::Uniform);
        if b {
            self.ctx.masks.true_const = Some(v);
        } else {
            self.ctx.masks.false_const = Some(v);
        }
        v
    }

    /// The predicate of `block`, built on first request.
    pub fn request_mask(&mut self, block: BlockId) -> ValueId {
        if let Some(mask) = self.ctx.masks.block_mask(block) {
            return mask;
        }
        let mask = self.compute_mask(block);
        self.ctx.masks.blocks.insert(block, mask);
        mask
    }

    /// The predicate of the `src -> dst` edge: lanes active in `src` that
    /// take this edge.
    pub fn request_edge_mask(&mut self, src: BlockId, dst: BlockId) -> ValueId {
        if let Some(mask) = self.ctx.masks.edge_mask(src, dst) {
            return mask;
        }
        let src_mask = self.request_mask(src);
        let mask = match self.ctx.func.terminator_op(src).cloned() {
            Some(Op::BrIf {
                cond,
                then_target,
                else_target,
                ..
            }) if then_target != else_target => {
                let taken = if then_target == dst {
                    cond
                } else {
                    assert_eq!(else_target, dst, "no edge {src} -> {dst}");
                    self.negate(src, cond)
                };
                self.and(src, src_mask, taken)
            }
            _ => src_mask,
        };
        self.ctx.masks.edges.insert((src, dst), mask);
        mask
    }

    fn compute_mask(&mut self, block: BlockId) -> ValueId {
        let region_entry = self
            .ctx
            .region
            .as_ref()
            .map_or(self.ctx.func.entry, |r| r.entry);
        if block == region_entry {
            return self.const_true();
        }

        if let Some(id) = self.an.loops.loop_with_header(block) {
            if let Some(pre) = self.an.loops.preheader(id, &self.ctx.func, &self.an.cfg) {
                let entry_mask = self.request_edge_mask(pre, block);
                if !self.is_divergent_loop(id) {
                    return entry_mask;
                }
                // Lanes stay live across iterations until they leave; the
                // back-edge argument is supplied once the body is final.
                let live = self.ctx.func.add_block_param(block, Type::Bool);
                append_edge_arg(&mut self.ctx.func, pre, block, entry_mask);
                self.ctx.shapes.set(live, Shape::Varying);
                self.ctx.masks.pending_headers.insert(block, live);
                tracing::trace!(header = %block, %live, "live mask for divergent loop");
                return live;
            }
        }

        let preds = self.an.cfg.unique_preds(block);
        match preds.as_slice() {
            [] => self.const_false(),
            [pred] => self.request_edge_mask(*pred, block),
            _ => self.join_mask(block, &preds),
        }
    }

    fn join_mask(&mut self, block: BlockId, preds: &[BlockId]) -> ValueId {
        let param = self.ctx.func.add_block_param(block, Type::Bool);
        // Cache before recursing so cycles through this block terminate.
        self.ctx.masks.blocks.insert(block, param);
        self.ctx.masks.params.insert(param);
        let mut shape = Shape::Uniform;
        for &pred in preds {
            let edge = self.request_edge_mask(pred, block);
            append_edge_arg(&mut self.ctx.func, pred, block, edge);
            shape = shape.join(self.ctx.shapes.get(edge));
        }
        self.ctx.shapes.set(param, shape);
        param
    }

    /// Give the live mask of `header` its back-edge argument: the mask of
    /// lanes that take the latch edge. Returns that argument.
    pub fn close_header(&mut self, header: BlockId) -> Option<ValueId> {
        self.ctx.masks.pending_headers.get(&header)?;
        let id = self.an.loops.loop_with_header(header)?;
        let latches = self.an.loops.get(id).latches.clone();
        let mut last = None;
        for latch in latches {
            let edge = self.request_edge_mask(latch, header);
            append_edge_arg(&mut self.ctx.func, latch, header, edge);
            last = Some(edge);
        }
        self.ctx.masks.pending_headers.remove(&header);
        last
    }

    /// Close every header whose live mask is still open.
    pub fn finish(&mut self) {
        let mut open: Vec<BlockId> = self.ctx.masks.pending_headers.keys().copied().collect();
        open.sort();
        for header in open {
            self.close_header(header);
        }
    }

    fn is_divergent_loop(&self, id: LoopId) -> bool {
        let info = DivergenceInfo {
            func: &self.ctx.func,
            cfg: &self.an.cfg,
            pdom: &self.an.pdom,
            loops: &self.an.loops,
        };
        info.is_divergent_loop(&self.ctx.shapes, id)
    }

    fn negate(&mut self, block: BlockId, cond: ValueId) -> ValueId {
        let v = self
            .ctx
            .func
            .insert_before_terminator(block, Op::Not(cond), Type::Bool);
        self.ctx.shapes.set(v, self.ctx.shapes.get(cond));
        v
    }

    fn and(&mut self, block: BlockId, a: ValueId, b: ValueId) -> ValueId {
        if self.ctx.masks.is_true(a) {
            return b;
        }
        if self.ctx.masks.is_true(b) {
            return a;
        }
        let v = self
            .ctx
            .func
            .insert_before_terminator(block, Op::Binary(BinOp::And, a, b), Type::Bool);
        let shape = self.ctx.shapes.get(a).join(self.ctx.shapes.get(b));
        self.ctx.shapes.set(v, shape);
        v
    }

    pub fn context(&mut self) -> &mut VectorizationContext {
        self.ctx
    }
}

/// Request the mask of every block in the region, then close any open loop
/// headers.
pub fn expand_region_masks(ctx: &mut VectorizationContext) -> usize {
    let blocks = ctx.region_blocks();
    let mut expander = MaskExpander::new(ctx);
    for &block in &blocks {
        expander.request_mask(block);
    }
    expander.finish();
    tracing::debug!(blocks = blocks.len(), "expanded region masks");
    blocks.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::divergence;
    use crate::context::Region;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::{CmpKind, Function, FunctionSig};

    fn sig1() -> FunctionSig {
        FunctionSig {
            params: vec![Type::Int(64)],
            return_ty: Type::Int(64),
        }
    }

    /// ```text
    /// entry: br_if (x < 0), a, b
    /// a:     br m(1)
    /// b:     br c
    /// c:     br m(2)
    /// m(p):  ret p
    /// ```
    fn diamond() -> (Function, [BlockId; 4]) {
        let mut fb = FunctionBuilder::new("diamond", sig1());
        let x = fb.param(0);
        let zero = fb.const_int(0);
        let cond = fb.cmp(CmpKind::Lt, x, zero);
        let a = fb.create_block();
        let b = fb.create_block();
        let c = fb.create_block();
        let (m, p) = fb.create_block_with_params(&[Type::Int(64)]);
        fb.br_if(cond, a, &[], b, &[]);
        fb.switch_to_block(a);
        let one = fb.const_int(1);
        fb.br(m, &[one]);
        fb.switch_to_block(b);
        fb.br(c, &[]);
        fb.switch_to_block(c);
        let two = fb.const_int(2);
        fb.br(m, &[two]);
        fb.switch_to_block(m);
        fb.ret(Some(p[0]));
        (fb.build(), [a, b, c, m])
    }

    fn context(func: Function) -> VectorizationContext {
        let shapes = divergence::analyze(&func, &[Shape::Varying]);
        VectorizationContext::new(func, shapes)
    }

    #[test]
    fn entry_mask_is_true_and_edges_use_condition() {
        let (func, [a, b, _, _]) = diamond();
        let entry = func.entry;
        let mut ctx = context(func);
        let mut ex = MaskExpander::new(&mut ctx);
        let entry_mask = ex.request_mask(entry);
        let a_mask = ex.request_mask(a);
        let b_mask = ex.request_mask(b);

        assert!(ctx.masks().is_true(entry_mask));
        let Some(Op::BrIf { cond, .. }) = ctx.func.terminator_op(entry).cloned() else {
            panic!("entry should still branch");
        };
        // `true & cond` folds to `cond`.
        assert_eq!(a_mask, cond);
        let not = ctx.func.defining_inst(b_mask).expect("negation is an inst");
        assert_eq!(ctx.func.insts[not].op, Op::Not(cond));
    }

    #[test]
    fn single_predecessor_reuses_mask() {
        let (func, [_, b, c, _]) = diamond();
        let mut ctx = context(func);
        let mut ex = MaskExpander::new(&mut ctx);
        let b_mask = ex.request_mask(b);
        let c_mask = ex.request_mask(c);
        assert_eq!(b_mask, c_mask);
    }

    #[test]
    fn join_gets_mask_parameter() {
        let (func, [a, _, c, m]) = diamond();
        let mut ctx = context(func);
        let mut ex = MaskExpander::new(&mut ctx);
        let m_mask = ex.request_mask(m);
        let a_mask = ex.request_mask(a);
        let c_mask = ex.request_mask(c);

        assert!(ctx.masks().is_mask_param(m_mask));
        assert_eq!(ctx.func.param_values(m).last(), Some(&m_mask));
        let a_args = ctx.func.terminator_op(a).unwrap().operands();
        assert_eq!(a_args.last(), Some(&a_mask));
        let c_args = ctx.func.terminator_op(c).unwrap().operands();
        assert_eq!(c_args.last(), Some(&c_mask));
        assert_eq!(ctx.shapes.get(m_mask), Shape::Varying);
    }

    #[test]
    fn repeated_requests_are_idempotent() {
        let (func, [_, _, _, m]) = diamond();
        let mut ctx = context(func);
        let first = MaskExpander::new(&mut ctx).request_mask(m);
        let inst_count = ctx.func.insts.len();
        let param_count = ctx.func.blocks[m].params.len();

        let second = MaskExpander::new(&mut ctx).request_mask(m);
        expand_region_masks(&mut ctx);
        assert_eq!(first, second);
        assert_eq!(ctx.func.insts.len(), inst_count);
        assert_eq!(ctx.func.blocks[m].params.len(), param_count);
    }

    #[test]
    fn region_entry_is_all_active() {
        let (func, [_, b, c, m]) = diamond();
        let mut blocks = std::collections::BTreeSet::new();
        blocks.extend([b, c, m]);
        let mut ctx = context(func).with_region(Region { entry: b, blocks });
        let mut ex = MaskExpander::new(&mut ctx);
        let b_mask = ex.request_mask(b);
        assert!(ctx.masks().is_true(b_mask));
    }

    /// ```text
    /// entry: br h(0)
    /// h(i):  c = i < x ; br_if c, body, exit
    /// body:  br h(i + 1)
    /// exit:  ret i
    /// ```
    #[test]
    fn divergent_header_waits_for_back_edge() {
        let mut fb = FunctionBuilder::new("count", sig1());
        let x = fb.param(0);
        let zero = fb.const_int(0);
        let (h, hp) = fb.create_block_with_params(&[Type::Int(64)]);
        let body = fb.create_block();
        let exit = fb.create_block();
        fb.br(h, &[zero]);
        fb.switch_to_block(h);
        let c = fb.cmp(CmpKind::Lt, hp[0], x);
        fb.br_if(c, body, &[], exit, &[]);
        fb.switch_to_block(body);
        let one = fb.const_int(1);
        let next = fb.add(hp[0], one);
        fb.br(h, &[next]);
        fb.switch_to_block(exit);
        fb.ret(Some(hp[0]));
        let mut ctx = context(fb.build());

        let mut ex = MaskExpander::new(&mut ctx);
        let live = ex.request_mask(h);
        assert_eq!(ex.context().masks.pending_headers.get(&h), Some(&live));
        let back = ex.close_header(h).expect("header was open");
        assert!(ctx.masks.pending_headers.is_empty());
        let and = ctx.func.defining_inst(back).expect("latch mask is computed");
        assert_eq!(ctx.func.insts[and].op, Op::Binary(BinOp::And, live, c));
        assert_eq!(ctx.func.terminator_op(body).unwrap().operands(), vec![next, back]);
    }
}
