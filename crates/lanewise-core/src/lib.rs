pub mod analysis;
pub mod context;
pub mod entity;
pub mod error;
pub mod ir;
pub mod pipeline;
pub mod transforms;

pub use context::{Region, VectorizationContext};
pub use error::CoreError;
pub use pipeline::{Vectorizer, VectorizerConfig};
