use crate::context::VectorizationContext;
use crate::error::CoreError;
use crate::ir::Function;

use super::config::DebugConfig;

/// Result of applying a transform pass.
pub struct TransformResult {
    /// Whether the pass modified the function or its mask cache.
    pub changed: bool,
}

/// Output of the transform pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutput {
    /// Whether any pass reported a change.
    pub changed: bool,
    /// `true` when the pipeline was stopped early by `dump_ir_after`. The
    /// caller should not treat the function as finished.
    pub stopped_early: bool,
}

/// A pass over a [`VectorizationContext`].
///
/// Passes rewrite the function in place. A pass that fails must leave the
/// context as it found it, or report an error only from a capability check
/// that ran before any mutation.
pub trait Transform {
    /// Name of this pass, in the kebab-case used by `dump_ir_after`.
    fn name(&self) -> &str;

    fn apply(&self, ctx: &mut VectorizationContext) -> Result<TransformResult, CoreError>;
}

impl<T: Transform + ?Sized> Transform for &T {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn apply(&self, ctx: &mut VectorizationContext) -> Result<TransformResult, CoreError> {
        (**self).apply(ctx)
    }
}

/// Valid pass names for `dump_ir_after`, in pipeline order.
pub const VALID_PASS_NAMES: &[&str] = &[
    "input",
    "div-loop",
    "mask-expansion",
    "linearize",
    "post-polish",
    "struct-opt",
    "aggregate-split",
    "reduction-opt",
];

/// An ordered sequence of passes to apply.
pub struct TransformPipeline<'a> {
    transforms: Vec<Box<dyn Transform + 'a>>,
}

impl<'a> TransformPipeline<'a> {
    pub fn new() -> Self {
        Self {
            transforms: Vec::new(),
        }
    }

    pub fn add(&mut self, transform: Box<dyn Transform + 'a>) {
        self.transforms.push(transform);
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Run all passes in order. Returns whether any pass changed anything.
    pub fn run(&self, ctx: &mut VectorizationContext) -> Result<bool, CoreError> {
        Ok(self.run_with_debug(ctx, &DebugConfig::default())?.changed)
    }

    /// Run the pipeline, honouring debug configuration.
    ///
    /// When `debug.dump_ir_after` is `Some(pass_name)`:
    /// - The special value `"input"` dumps the function before any pass and
    ///   returns immediately.
    /// - Otherwise the pipeline stops after the named pass, dumps IR
    ///   (filtered by `debug.function_filter`) and returns with
    ///   `stopped_early = true`.
    /// - If the named pass is not in the pipeline, the pipeline runs to
    ///   completion and returns `stopped_early = false`.
    pub fn run_with_debug(
        &self,
        ctx: &mut VectorizationContext,
        debug: &DebugConfig,
    ) -> Result<PipelineOutput, CoreError> {
        if debug.dump_ir_after.as_deref() == Some("input") {
            dump_ir(&ctx.func, debug);
            return Ok(PipelineOutput {
                changed: false,
                stopped_early: true,
            });
        }

        let stop_after = debug.dump_ir_after.as_deref();
        let mut changed = false;

        for transform in &self.transforms {
            let result = transform.apply(ctx)?;
            tracing::debug!(pass = transform.name(), changed = result.changed, "pass finished");
            changed |= result.changed;
            if stop_after == Some(transform.name()) {
                dump_ir(&ctx.func, debug);
                return Ok(PipelineOutput {
                    changed,
                    stopped_early: true,
                });
            }
        }

        if debug.dump_ir {
            dump_ir(&ctx.func, debug);
        }
        Ok(PipelineOutput {
            changed,
            stopped_early: false,
        })
    }
}

/// Dump `func` to stderr if it passes the debug filter.
fn dump_ir(func: &Function, debug: &DebugConfig) {
    if debug.should_dump(&func.name) {
        eprintln!("=== IR: {} ===\n{}\n=== end IR ===\n", func.name, func);
    }
}

impl Default for TransformPipeline<'_> {
    fn default() -> Self {
        Self::new()
    }
}
