mod registry;
pub mod runtime;
pub mod tokenizer;
mod types;
mod variants;

#[cfg(feature = "tch-backend")]
pub mod tch_backend;

pub use registry::ModelRegistry;
pub use runtime::{ChatTokenizer, Generator};
pub use tokenizer::HfTokenizer;
pub use types::{ModelKind, ModelMetadata};
pub use variants::{CausalLm, Model, PretrainedConfig, Seq2Seq};
