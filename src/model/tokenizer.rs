use std::{fs, path::Path};

use minijinja::{Environment, Error as TemplateError, ErrorKind, context};
use serde_json::{Map, Value};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    completion::{ChatMessage, DecodeArgs, EncodedPrompt},
    error::ServiceError,
    model::runtime::ChatTokenizer,
};

pub const DEFAULT_CHAT_TEMPLATE: &str = "{% for message in messages %}<|im_start|>{{ message.role }}
{{ message.content }}<|im_end|>
{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant
{% endif %}";

/// A `tokenizers` tokenizer paired with a Jinja chat template.
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    template: String,
    bos_token: String,
    eos_token: String,
    env: Environment<'static>,
}

impl HfTokenizer {
    pub fn new(tokenizer: Tokenizer, template: impl Into<String>) -> Self {
        let mut env = Environment::new();
        env.add_function("raise_exception", raise_exception);
        Self {
            tokenizer,
            template: template.into(),
            bos_token: String::new(),
            eos_token: String::new(),
            env,
        }
    }

    pub fn with_special_tokens(mut self, bos: impl Into<String>, eos: impl Into<String>) -> Self {
        self.bos_token = bos.into();
        self.eos_token = eos.into();
        self
    }

    /// Loads the tokenizer stored in the model directory
    /// `pretrained_model_name_or_path`: `tokenizer.json` plus, when present,
    /// `tokenizer_config.json`. Recognised `config` keys: `tokenizer_file`,
    /// `chat_template`.
    pub fn from_pretrained(
        pretrained_model_name_or_path: &str,
        config: &Map<String, Value>,
    ) -> Result<Self, ServiceError> {
        let root = Path::new(pretrained_model_name_or_path);
        if !root.is_dir() {
            return Err(ServiceError::Tokenizer(format!(
                "model directory not found: {}",
                root.display()
            )));
        }

        let file = config
            .get("tokenizer_file")
            .and_then(Value::as_str)
            .unwrap_or("tokenizer.json");
        let tokenizer =
            Tokenizer::from_file(root.join(file)).map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let config_path = root.join("tokenizer_config.json");
        let file_config = if config_path.exists() {
            let raw = fs::read_to_string(&config_path)?;
            serde_json::from_str::<Value>(&raw)
                .map_err(|e| ServiceError::Tokenizer(format!("invalid tokenizer_config.json: {e}")))?
        } else {
            Value::Null
        };

        let template = config
            .get("chat_template")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| file_config.get("chat_template").and_then(template_from_config))
            .unwrap_or_else(|| {
                info!("no chat template found, using ChatML default");
                DEFAULT_CHAT_TEMPLATE.to_string()
            });
        let bos = file_config.get("bos_token").and_then(token_content);
        let eos = file_config.get("eos_token").and_then(token_content);

        Ok(Self::new(tokenizer, template)
            .with_special_tokens(bos.unwrap_or_default(), eos.unwrap_or_default()))
    }

    /// Vocabulary id of the end-of-sequence token, if the tokenizer knows it.
    pub fn eos_token_id(&self) -> Option<u32> {
        if self.eos_token.is_empty() {
            return None;
        }
        self.tokenizer.token_to_id(&self.eos_token)
    }

    pub fn render(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, ServiceError> {
        self.env
            .render_str(
                &self.template,
                context! {
                    messages => messages,
                    add_generation_prompt => add_generation_prompt,
                    bos_token => &self.bos_token,
                    eos_token => &self.eos_token,
                },
            )
            .map_err(|e| ServiceError::Tokenizer(format!("chat template: {e}")))
    }
}

impl ChatTokenizer for HfTokenizer {
    fn encode_chat(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<EncodedPrompt, ServiceError> {
        let rendered = self.render(messages, add_generation_prompt)?;
        // the template already carries any special tokens
        let encoding = self
            .tokenizer
            .encode(rendered, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        debug!(tokens = encoding.get_ids().len(), "encoded chat prompt");
        Ok(EncodedPrompt::new(encoding.get_ids().to_vec()))
    }

    fn decode(&self, ids: &[u32], args: &DecodeArgs) -> Result<String, ServiceError> {
        let skip_special_tokens = args
            .get("skip_special_tokens")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }
}

fn raise_exception(message: String) -> Result<String, TemplateError> {
    Err(TemplateError::new(ErrorKind::InvalidOperation, message))
}

/// `chat_template` is either a string or a list of named templates.
fn template_from_config(value: &Value) -> Option<String> {
    match value {
        Value::String(template) => Some(template.clone()),
        Value::Array(named) => {
            let pick = |name: Option<&str>| {
                named.iter().find(|entry| {
                    name.is_none_or(|name| entry.get("name").and_then(Value::as_str) == Some(name))
                })
            };
            pick(Some("default"))
                .or_else(|| pick(None))
                .and_then(|entry| entry.get("template"))
                .and_then(Value::as_str)
                .map(str::to_string)
        }
        _ => None,
    }
}

/// Special tokens appear either as plain strings or as `{"content": ...}`.
fn token_content(value: &Value) -> Option<String> {
    match value {
        Value::String(token) => Some(token.clone()),
        Value::Object(obj) => obj.get("content").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}
