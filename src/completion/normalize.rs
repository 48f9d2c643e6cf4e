//! Translation of a chat request plus component defaults into the exact
//! keyword arguments the generation runtime receives.

use serde_json::Value;

use crate::{
    completion::types::{ChatMessage, ChatRequest, DecodeArgs, GenerateArgs},
    error::ServiceError,
};

/// Accepted for OpenAI compatibility but never forwarded to generation.
pub const STRIPPED_GENERATE_KEYS: [&str; 7] = [
    "model",
    "prompt",
    "n",
    "best_of",
    "presence_penalty",
    "frequency_penalty",
    "logit_bias",
];

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub generate_args: GenerateArgs,
    pub decode_args: DecodeArgs,
    pub messages: Vec<ChatMessage>,
    pub echo: bool,
    pub n: usize,
}

pub fn get_messages(request: &ChatRequest) -> Result<&[ChatMessage], ServiceError> {
    request
        .messages
        .as_deref()
        .ok_or_else(|| ServiceError::MissingField("messages".into()))
}

/// Builds the generation and decode arguments for one request.
///
/// `echo`, `n` and the sampling fields are taken from `generate_config`,
/// not from the request: a client's per-request `temperature`, `n` or
/// `echo` only matters once the component itself was configured with that
/// key. Neither config map is modified.
pub fn normalize_request(
    request: &ChatRequest,
    generate_config: &GenerateArgs,
    decode_config: &DecodeArgs,
) -> Result<NormalizedRequest, ServiceError> {
    let mut generate_args = generate_config.clone();

    let mut decode_args = DecodeArgs::new();
    decode_args.insert("skip_special_tokens".into(), Value::Bool(true));
    decode_args.extend(decode_config.clone());

    infer_sampling_mode(&mut generate_args);

    let messages = get_messages(request)?.to_vec();
    let echo = read_echo(&generate_args)?;
    let n = read_n(&generate_args)?;

    for key in STRIPPED_GENERATE_KEYS {
        generate_args.remove(key);
    }

    Ok(NormalizedRequest {
        generate_args,
        decode_args,
        messages,
        echo,
        n,
    })
}

fn infer_sampling_mode(args: &mut GenerateArgs) {
    let has_sampling_key = ["top_p", "top_k", "temperature"]
        .iter()
        .any(|key| args.contains_key(*key));
    if !has_sampling_key || args.contains_key("do_sample") {
        return;
    }

    args.insert("do_sample".into(), Value::Bool(true));
    if number_equals(args.get("temperature"), 0.0) {
        // greedy temperature must not reach the sampler
        args.remove("temperature");
    } else if number_equals(args.get("top_p"), 1.0) {
        args.remove("top_p");
    }
    if !args.contains_key("top_k") {
        args.insert("top_k".into(), Value::from(0));
    }
}

fn number_equals(value: Option<&Value>, expected: f64) -> bool {
    value.and_then(Value::as_f64) == Some(expected)
}

fn read_echo(args: &GenerateArgs) -> Result<bool, ServiceError> {
    match args.get("echo") {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(echo)) => Ok(*echo),
        Some(other) => Err(ServiceError::InvalidConfig(format!(
            "echo must be a boolean, got {other}"
        ))),
    }
}

fn read_n(args: &GenerateArgs) -> Result<usize, ServiceError> {
    match args.get("n") {
        None | Some(Value::Null) => Ok(1),
        Some(value) => value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                ServiceError::InvalidConfig(format!(
                    "n must be a non-negative integer, got {value}"
                ))
            }),
    }
}
