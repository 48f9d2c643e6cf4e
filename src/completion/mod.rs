mod normalize;
mod orchestrator;
mod types;

pub use normalize::{NormalizedRequest, STRIPPED_GENERATE_KEYS, get_messages, normalize_request};
pub use orchestrator::complete;
pub use types::{
    ChatMessage, ChatRequest, Choice, CompletionResponse, DecodeArgs, EncodedPrompt, GenerateArgs,
    Usage,
};
