//! Top-level orchestration of the control-flow and recurrence stages.

use std::collections::HashSet;

use crate::context::VectorizationContext;
use crate::error::CoreError;
use crate::ir::{BlockId, ValueId};
use crate::transforms::mask_expander::expand_region_masks;
use crate::transforms::{DivLoopTransform, Linearizer, MaskPolish, ReductionOptimization, RemainderTransform};

use super::config::{DebugConfig, VectorizerConfig};
use super::transform::{PipelineOutput, Transform, TransformPipeline, TransformResult};

const REMAINDER_STAGE: &str = "remainder transform";

struct DivLoopPass;

impl Transform for DivLoopPass {
    fn name(&self) -> &str {
        "div-loop"
    }

    fn apply(&self, ctx: &mut VectorizationContext) -> Result<TransformResult, CoreError> {
        let rewritten = DivLoopTransform::new(ctx).transform_divergent_loops()?;
        ctx.invalidate();
        Ok(TransformResult {
            changed: rewritten > 0,
        })
    }
}

struct MaskExpansionPass;

impl Transform for MaskExpansionPass {
    fn name(&self) -> &str {
        "mask-expansion"
    }

    fn apply(&self, ctx: &mut VectorizationContext) -> Result<TransformResult, CoreError> {
        let before = ctx.masks().len();
        expand_region_masks(ctx);
        Ok(TransformResult {
            changed: ctx.masks().len() != before,
        })
    }
}

struct LinearizePass;

impl Transform for LinearizePass {
    fn name(&self) -> &str {
        "linearize"
    }

    fn apply(&self, ctx: &mut VectorizationContext) -> Result<TransformResult, CoreError> {
        let folded = Linearizer::new(ctx).run();
        Ok(TransformResult { changed: folded > 0 })
    }
}

struct PolishPass;

impl Transform for PolishPass {
    fn name(&self) -> &str {
        "post-polish"
    }

    fn apply(&self, ctx: &mut VectorizationContext) -> Result<TransformResult, CoreError> {
        Ok(TransformResult {
            changed: MaskPolish::run(ctx) > 0,
        })
    }
}

struct ReductionPass;

impl Transform for ReductionPass {
    fn name(&self) -> &str {
        "reduction-opt"
    }

    fn apply(&self, ctx: &mut VectorizationContext) -> Result<TransformResult, CoreError> {
        Ok(TransformResult {
            changed: ReductionOptimization::new(ctx).run() != 0,
        })
    }
}

/// Drives the stages in their fixed order.
///
/// Struct-opt and aggregate-split are not part of this crate; callers plug
/// them in with [`Vectorizer::with_struct_opt`] and
/// [`Vectorizer::with_aggregate_split`], and [`VectorizerConfig`] decides
/// whether they run.
pub struct Vectorizer {
    config: VectorizerConfig,
    debug: DebugConfig,
    struct_opt: Option<Box<dyn Transform>>,
    aggregate_split: Option<Box<dyn Transform>>,
}

impl Vectorizer {
    pub fn new(config: VectorizerConfig) -> Self {
        Self {
            config,
            debug: DebugConfig::none(),
            struct_opt: None,
            aggregate_split: None,
        }
    }

    pub fn with_debug(mut self, debug: DebugConfig) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_struct_opt(mut self, stage: impl Transform + 'static) -> Self {
        self.struct_opt = Some(Box::new(stage));
        self
    }

    pub fn with_aggregate_split(mut self, stage: impl Transform + 'static) -> Self {
        self.aggregate_split = Some(Box::new(stage));
        self
    }

    pub fn config(&self) -> &VectorizerConfig {
        &self.config
    }

    /// Split off a scalar remainder so the loop at `header` runs a multiple
    /// of `vector_width` iterations. Returns the main loop header.
    ///
    /// Fails without touching the function when the loop is not in
    /// canonical header-tested form.
    pub fn prepare_loop(
        &self,
        ctx: &mut VectorizationContext,
        header: BlockId,
        uniform_overrides: &mut HashSet<ValueId>,
        vector_width: u32,
        trip_align: u32,
    ) -> Result<BlockId, CoreError> {
        if vector_width == 0 {
            return Err(CoreError::InvalidInput("vector width must be positive".into()));
        }
        let mut remainder = RemainderTransform::new(ctx);
        let plan = remainder.plan(header).into_result(REMAINDER_STAGE)?;
        Ok(remainder.create_vectorizable_loop(plan, uniform_overrides, vector_width, trip_align))
    }

    /// Remove divergent control flow from the region: divergent loops get a
    /// uniform exit, then every divergent branch is folded into predicated
    /// straight-line code.
    pub fn linearize(&self, ctx: &mut VectorizationContext) -> Result<PipelineOutput, CoreError> {
        ctx.invalidate();
        let mut pipeline = TransformPipeline::new();
        pipeline.add(Box::new(DivLoopPass));
        pipeline.add(Box::new(MaskExpansionPass));
        pipeline.add(Box::new(LinearizePass));
        if self.config.enable_post_polish {
            pipeline.add(Box::new(PolishPass));
        } else {
            tracing::info!("post-polish disabled");
        }
        pipeline.run_with_debug(ctx, &self.debug)
    }

    /// Run the caller's aggregate stages, then rewrite reductions so they
    /// can be kept in vector registers.
    pub fn vectorize(&self, ctx: &mut VectorizationContext) -> Result<PipelineOutput, CoreError> {
        let mut pipeline = TransformPipeline::new();
        let hooks = [
            ("struct-opt", self.config.enable_struct_opt, &self.struct_opt),
            ("aggregate-split", self.config.enable_aggregate_split, &self.aggregate_split),
        ];
        for (name, enabled, stage) in hooks {
            match (enabled, stage) {
                (true, Some(stage)) => pipeline.add(Box::new(&**stage)),
                (true, None) => tracing::debug!(stage = name, "no stage supplied"),
                (false, _) => tracing::info!("{name} disabled"),
            }
        }
        pipeline.add(Box::new(ReductionPass));
        pipeline.run_with_debug(ctx, &self.debug)
    }
}

impl Default for Vectorizer {
    fn default() -> Self {
        Self::new(VectorizerConfig::default())
    }
}
