pub mod completion;
pub mod config;
pub mod error;
pub mod model;
pub mod server;

pub use completion::{ChatMessage, ChatRequest, CompletionResponse};
pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{CausalLm, Model, ModelRegistry, Seq2Seq};
pub use server::build_router;
