pub mod config;
pub mod transform;
pub mod vectorizer;

pub use config::{DebugConfig, VectorizerConfig};
pub use transform::{PipelineOutput, Transform, TransformPipeline, TransformResult, VALID_PASS_NAMES};
pub use vectorizer::Vectorizer;
