#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use chat_completions_service::{
    ServiceError,
    completion::{ChatMessage, DecodeArgs, EncodedPrompt, GenerateArgs},
    model::{ChatTokenizer, Generator},
};

pub fn object(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected JSON object, got {other}"),
    }
}

/// Emits one id per message plus a trailing generation marker (id 99).
#[derive(Default)]
pub struct StubTokenizer {
    pub placements: Mutex<Vec<String>>,
    pub decode_args: Mutex<Vec<DecodeArgs>>,
    pub fail_encode: bool,
}

impl ChatTokenizer for StubTokenizer {
    fn encode_chat(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<EncodedPrompt, ServiceError> {
        if self.fail_encode {
            return Err(ServiceError::Tokenizer("template rejected role".into()));
        }
        let mut ids: Vec<u32> = (1..=messages.len() as u32).collect();
        if add_generation_prompt {
            ids.push(99);
        }
        Ok(EncodedPrompt::new(ids))
    }

    fn decode(&self, ids: &[u32], args: &DecodeArgs) -> Result<String, ServiceError> {
        self.decode_args.lock().push(args.clone());
        Ok(ids
            .iter()
            .map(|id| format!("t{id}"))
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn to_device(&self, prompt: EncodedPrompt, device: &str) -> Result<EncodedPrompt, ServiceError> {
        self.placements.lock().push(device.to_string());
        Ok(prompt.placed_on(device))
    }
}

/// Replays `outputs` in order (wrapping around) and records every call.
pub struct StubGenerator {
    outputs: Vec<Vec<u32>>,
    fail_on_call: Option<usize>,
    pub calls: Mutex<Vec<(EncodedPrompt, GenerateArgs)>>,
}

impl StubGenerator {
    pub fn new(outputs: Vec<Vec<u32>>) -> Self {
        Self {
            outputs,
            fail_on_call: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_on(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Generator for StubGenerator {
    fn generate(
        &self,
        prompt: &EncodedPrompt,
        args: &GenerateArgs,
    ) -> Result<Vec<Vec<u32>>, ServiceError> {
        let mut calls = self.calls.lock();
        let call = calls.len();
        calls.push((prompt.clone(), args.clone()));
        if self.fail_on_call == Some(call) {
            return Err(ServiceError::Inference("out of memory".into()));
        }
        if self.outputs.is_empty() {
            return Ok(Vec::new());
        }
        let output = self.outputs[call % self.outputs.len()].clone();
        Ok(vec![output])
    }
}

pub fn stubs(outputs: Vec<Vec<u32>>) -> (Arc<StubTokenizer>, Arc<StubGenerator>) {
    (
        Arc::new(StubTokenizer::default()),
        Arc::new(StubGenerator::new(outputs)),
    )
}
