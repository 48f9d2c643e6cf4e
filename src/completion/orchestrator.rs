use tracing::debug;

use crate::{
    completion::{
        normalize::NormalizedRequest,
        types::{ChatMessage, Choice, CompletionResponse, EncodedPrompt, Usage},
    },
    error::ServiceError,
    model::runtime::{ChatTokenizer, Generator},
};

/// Runs generation for a normalized request and assembles the response.
///
/// `completion_tokens` counts the full length of every returned sequence,
/// so any prompt ids the runtime echoes back are counted as well. A failure
/// on any sample aborts the whole request.
pub fn complete(
    request: NormalizedRequest,
    tokenizer: &dyn ChatTokenizer,
    tokenizer_device: Option<&str>,
    generator: &dyn Generator,
    auto_echo: bool,
) -> Result<CompletionResponse, ServiceError> {
    let NormalizedRequest {
        generate_args,
        decode_args,
        messages,
        echo,
        n,
    } = request;

    let mut inputs: Vec<EncodedPrompt> = Vec::with_capacity(1);
    let mut input = tokenizer.encode_chat(&messages, true)?;
    if let Some(device) = tokenizer_device {
        input = tokenizer.to_device(input, device)?;
    }
    inputs.push(input);
    let prompt_tokens: usize = inputs.iter().map(EncodedPrompt::len).sum();

    let mut choices = Vec::new();
    let mut completion_tokens = 0usize;
    for (index, input) in inputs.iter().enumerate() {
        for sample in 0..n {
            let output = generator
                .generate(input, &generate_args)?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    ServiceError::Inference("generation returned no sequences".into())
                })?;
            completion_tokens += output.len();
            debug!(index, sample, tokens = output.len(), "generated sequence");

            let mut text = tokenizer.decode(&output, &decode_args)?;
            if echo && !auto_echo {
                // prepends the raw prompt ids, not the prompt text
                text = format!("{input}{text}");
            }
            choices.push(Choice {
                message: ChatMessage::new("assistant", text),
                index,
            });
        }
    }

    let usage = Usage::new(prompt_tokens, completion_tokens);
    debug!(
        choices = choices.len(),
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        "completion assembled"
    );

    Ok(CompletionResponse { choices, usage })
}
