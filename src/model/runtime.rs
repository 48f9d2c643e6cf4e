//! Capabilities the completion core needs from a model runtime.

use crate::{
    completion::{ChatMessage, DecodeArgs, EncodedPrompt, GenerateArgs},
    error::ServiceError,
};

pub trait ChatTokenizer: Send + Sync {
    /// Renders `messages` through the chat template and tokenizes the result.
    fn encode_chat(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<EncodedPrompt, ServiceError>;

    fn decode(&self, ids: &[u32], args: &DecodeArgs) -> Result<String, ServiceError>;

    fn to_device(&self, prompt: EncodedPrompt, device: &str) -> Result<EncodedPrompt, ServiceError> {
        Ok(prompt.placed_on(device))
    }
}

pub trait Generator: Send + Sync {
    /// Returns one or more output sequences for `prompt`.
    fn generate(
        &self,
        prompt: &EncodedPrompt,
        args: &GenerateArgs,
    ) -> Result<Vec<Vec<u32>>, ServiceError>;
}
