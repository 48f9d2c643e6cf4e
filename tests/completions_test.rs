//! End-to-end completions through the model variants with stub runtimes.

mod common;

use std::sync::Arc;

use serde_json::json;

use chat_completions_service::{
    CausalLm, ChatMessage, ChatRequest, Model, Seq2Seq, ServiceError,
    completion::{STRIPPED_GENERATE_KEYS, complete, normalize_request},
    model::ModelKind,
};
use common::{StubGenerator, StubTokenizer, object, stubs};

fn hi() -> ChatRequest {
    ChatRequest::from_messages(vec![ChatMessage::new("user", "Hi")])
}

#[test]
fn single_choice_counts_output_tokens() {
    let (tokenizer, generator) = stubs(vec![vec![7, 8, 9]]);
    let model = CausalLm::new("stub", tokenizer, generator.clone());

    let response = model.completions(&hi()).unwrap();

    assert_eq!(response.choices.len(), 1);
    assert_eq!(response.choices[0].index, 0);
    assert_eq!(response.choices[0].message.role, "assistant");
    assert_eq!(response.choices[0].message.content, "t7 t8 t9");
    assert_eq!(response.usage.completion_tokens, 3);
    // one message id plus the generation marker
    assert_eq!(response.usage.prompt_tokens, 2);
    assert_eq!(
        response.usage.total_tokens,
        response.usage.prompt_tokens + response.usage.completion_tokens
    );
    assert_eq!(generator.call_count(), 1);
}

#[test]
fn n_samples_accumulate_completion_tokens() {
    let (tokenizer, generator) = stubs(vec![vec![1, 2], vec![3, 4, 5], vec![6]]);
    let model = Seq2Seq::new("stub", tokenizer, generator.clone())
        .with_generate_config(object(json!({"n": 3})));

    let response = model.completions(&hi()).unwrap();

    assert_eq!(response.choices.len(), 3);
    assert!(response.choices.iter().all(|choice| choice.index == 0));
    assert_eq!(response.usage.completion_tokens, 2 + 3 + 1);
    assert_eq!(response.usage.total_tokens, 2 + 6);
    assert_eq!(generator.call_count(), 3);
}

#[test]
fn zero_samples_produce_no_choices() {
    let (tokenizer, generator) = stubs(vec![vec![1]]);
    let model = CausalLm::new("stub", tokenizer, generator.clone())
        .with_generate_config(object(json!({"n": 0})));

    let response = model.completions(&hi()).unwrap();

    assert!(response.choices.is_empty());
    assert_eq!(response.usage.completion_tokens, 0);
    assert_eq!(response.usage.total_tokens, response.usage.prompt_tokens);
    assert_eq!(generator.call_count(), 0);
}

#[test]
fn missing_messages_never_reaches_generation() {
    let (tokenizer, generator) = stubs(vec![vec![1]]);
    let model = CausalLm::new("stub", tokenizer, generator.clone());

    let err = model.completions(&ChatRequest::default()).unwrap_err();

    assert!(matches!(err, ServiceError::MissingField(ref field) if field == "messages"));
    assert_eq!(generator.call_count(), 0);
}

#[test]
fn compatibility_fields_are_never_forwarded() {
    let (tokenizer, generator) = stubs(vec![vec![1]]);
    let model = CausalLm::new("stub", tokenizer, generator.clone()).with_generate_config(object(
        json!({
            "model": "gpt-3.5-turbo",
            "prompt": "p",
            "n": 2,
            "best_of": 4,
            "presence_penalty": 1.0,
            "frequency_penalty": 1.0,
            "logit_bias": {"1": 5},
            "max_new_tokens": 4
        }),
    ));
    let request = ChatRequest {
        best_of: Some(json!(-2)),
        presence_penalty: Some(json!(0.2)),
        logit_bias: Some(json!({"1": -100})),
        ..hi()
    };

    let response = model.completions(&request).unwrap();

    assert_eq!(response.choices.len(), 2);
    for (_, args) in generator.calls.lock().iter() {
        for key in STRIPPED_GENERATE_KEYS {
            assert!(!args.contains_key(key), "{key} was forwarded");
        }
        assert_eq!(args.get("max_new_tokens"), Some(&json!(4)));
    }
}

#[test]
fn sampling_defaults_reach_generation() {
    let (tokenizer, generator) = stubs(vec![vec![1]]);
    let model = CausalLm::new("stub", tokenizer, generator.clone())
        .with_generate_config(object(json!({"temperature": 0.7})));

    model.completions(&hi()).unwrap();

    let calls = generator.calls.lock();
    assert_eq!(
        calls[0].1,
        object(json!({"temperature": 0.7, "do_sample": true, "top_k": 0}))
    );
}

#[test]
fn request_sampling_fields_are_inert() {
    let (tokenizer, generator) = stubs(vec![vec![1]]);
    let model = CausalLm::new("stub", tokenizer, generator.clone());
    let request = ChatRequest {
        temperature: Some(json!(0.2)),
        top_p: Some(json!(0.5)),
        n: Some(json!(3)),
        ..hi()
    };

    let response = model.completions(&request).unwrap();

    assert_eq!(response.choices.len(), 1);
    assert!(generator.calls.lock()[0].1.is_empty());
}

#[test]
fn echo_prepends_prompt_ids() {
    let (tokenizer, generator) = stubs(vec![vec![5]]);
    let model = CausalLm::new("stub", tokenizer, generator)
        .with_generate_config(object(json!({"echo": true})));

    let response = model.completions(&hi()).unwrap();

    assert_eq!(response.choices[0].message.content, "[1, 99]t5");
}

#[test]
fn auto_echo_leaves_text_alone() {
    let tokenizer = StubTokenizer::default();
    let generator = StubGenerator::new(vec![vec![5]]);
    let normalized = normalize_request(
        &hi(),
        &object(json!({"echo": true})),
        &object(json!({})),
    )
    .unwrap();

    let response = complete(normalized, &tokenizer, None, &generator, true).unwrap();

    assert_eq!(response.choices[0].message.content, "t5");
}

#[test]
fn tokenizer_device_places_prompt() {
    let (tokenizer, generator) = stubs(vec![vec![1]]);
    let model = Seq2Seq::new("stub", tokenizer.clone(), generator.clone())
        .with_tokenizer_device(Some("cuda:0".to_string()));

    model.completions(&hi()).unwrap();

    assert_eq!(*tokenizer.placements.lock(), vec!["cuda:0".to_string()]);
    assert_eq!(
        generator.calls.lock()[0].0.device.as_deref(),
        Some("cuda:0")
    );
}

#[test]
fn decode_defaults_reach_tokenizer() {
    let (tokenizer, generator) = stubs(vec![vec![1]]);
    let model = CausalLm::new("stub", tokenizer.clone(), generator)
        .with_decode_config(object(json!({"clean_up_tokenization_spaces": false})));

    model.completions(&hi()).unwrap();

    assert_eq!(
        tokenizer.decode_args.lock()[0],
        object(json!({"skip_special_tokens": true, "clean_up_tokenization_spaces": false}))
    );
}

#[test]
fn failure_mid_batch_aborts_request() {
    let tokenizer = Arc::new(StubTokenizer::default());
    let generator = Arc::new(StubGenerator::new(vec![vec![1, 2]]).failing_on(1));
    let model = CausalLm::new("stub", tokenizer, generator.clone())
        .with_generate_config(object(json!({"n": 3})));

    let err = model.completions(&hi()).unwrap_err();

    assert!(err.is_runtime_failure());
    assert_eq!(generator.call_count(), 2);
}

#[test]
fn tokenizer_failure_propagates() {
    let tokenizer = Arc::new(StubTokenizer {
        fail_encode: true,
        ..StubTokenizer::default()
    });
    let generator = Arc::new(StubGenerator::new(vec![vec![1]]));
    let model = CausalLm::new("stub", tokenizer, generator.clone());

    let err = model.completions(&hi()).unwrap_err();

    assert!(matches!(err, ServiceError::Tokenizer(_)));
    assert_eq!(generator.call_count(), 0);
}

#[test]
fn empty_generation_is_an_error() {
    let (tokenizer, generator) = stubs(Vec::new());
    let model = CausalLm::new("stub", tokenizer, generator);

    let err = model.completions(&hi()).unwrap_err();

    assert!(matches!(err, ServiceError::Inference(_)));
}

#[test]
fn variants_report_their_kind() {
    let (tokenizer, generator) = stubs(vec![vec![1]]);
    let seq2seq = Seq2Seq::new("t5-small", tokenizer.clone(), generator.clone());
    let causal = CausalLm::new("gpt2", tokenizer, generator);

    assert_eq!(seq2seq.metadata().kind, ModelKind::Seq2Seq);
    assert_eq!(causal.metadata().kind, ModelKind::Causal);
    assert_eq!(causal.metadata().name, "gpt2");
}

#[test]
fn response_matches_wire_shape() {
    let (tokenizer, generator) = stubs(vec![vec![1, 2, 3]]);
    let model = CausalLm::new("stub", tokenizer, generator);

    let response = model.completions(&hi()).unwrap();

    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({
            "choices": [
                {"message": {"role": "assistant", "content": "t1 t2 t3"}, "index": 0}
            ],
            "usage": {"prompt_tokens": 2, "completion_tokens": 3, "total_tokens": 5}
        })
    );
}

#[test]
fn huge_n_does_not_preallocate() {
    let tokenizer = Arc::new(StubTokenizer::default());
    let generator = Arc::new(StubGenerator::new(vec![vec![1]]).failing_on(0));
    let model = CausalLm::new("stub", tokenizer, generator.clone())
        .with_generate_config(object(json!({"n": u64::MAX})));

    let err = model.completions(&hi()).unwrap_err();

    assert!(err.is_runtime_failure());
    assert_eq!(generator.call_count(), 1);
}

#[test]
fn variants_share_one_completion_path() {
    let build = |kind: ModelKind| -> Box<dyn Model> {
        let (tokenizer, generator) = stubs(vec![vec![4, 5]]);
        let generate = object(json!({"max_new_tokens": 2, "n": 2}));
        let decode = object(json!({"skip_special_tokens": false}));
        let device = Some("cpu".to_string());
        match kind {
            ModelKind::Seq2Seq => Box::new(
                Seq2Seq::new("stub", tokenizer, generator)
                    .with_generate_config(generate)
                    .with_decode_config(decode)
                    .with_tokenizer_device(device),
            ),
            ModelKind::Causal => Box::new(
                CausalLm::new("stub", tokenizer, generator)
                    .with_generate_config(generate)
                    .with_decode_config(decode)
                    .with_tokenizer_device(device),
            ),
        }
    };

    let seq2seq = build(ModelKind::Seq2Seq);
    let causal = build(ModelKind::Causal);

    assert_eq!(
        seq2seq.completions(&hi()).unwrap(),
        causal.completions(&hi()).unwrap()
    );
    assert_eq!(seq2seq.metadata().tokenizer_device.as_deref(), Some("cpu"));
    assert_eq!(causal.metadata().tokenizer_device.as_deref(), Some("cpu"));
}
