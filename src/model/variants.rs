use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{
    completion::{
        ChatRequest, CompletionResponse, DecodeArgs, GenerateArgs, complete, normalize_request,
    },
    error::ServiceError,
    model::{
        ModelKind, ModelMetadata,
        runtime::{ChatTokenizer, Generator},
    },
};

/// A loaded model that answers chat completion requests.
pub trait Model: Send + Sync {
    fn completions(&self, request: &ChatRequest) -> Result<CompletionResponse, ServiceError>;

    fn metadata(&self) -> ModelMetadata;
}

/// Everything needed to build a model from a pretrained identifier.
#[derive(Debug, Clone, Default)]
pub struct PretrainedConfig {
    pub pretrained_model_name_or_path: String,
    pub model_config: Map<String, Value>,
    pub model_device: Option<String>,
    pub tokenizer_config: Map<String, Value>,
    pub tokenizer_device: Option<String>,
    pub generate_config: GenerateArgs,
    pub decode_config: DecodeArgs,
}

impl From<&crate::config::AppConfig> for PretrainedConfig {
    fn from(config: &crate::config::AppConfig) -> Self {
        Self {
            pretrained_model_name_or_path: config.model_id.clone(),
            model_config: config.model_config.clone(),
            model_device: config.model_device.clone(),
            tokenizer_config: config.tokenizer_config.clone(),
            tokenizer_device: config.tokenizer_device.clone(),
            generate_config: config.generate_config.clone(),
            decode_config: config.decode_config.clone(),
        }
    }
}

struct Components {
    name: String,
    tokenizer: Arc<dyn ChatTokenizer>,
    generator: Arc<dyn Generator>,
    generate_config: GenerateArgs,
    decode_config: DecodeArgs,
    tokenizer_device: Option<String>,
    model_device: Option<String>,
    size_bytes: Option<u64>,
}

impl Components {
    fn new(
        name: impl Into<String>,
        tokenizer: Arc<dyn ChatTokenizer>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            name: name.into(),
            tokenizer,
            generator,
            generate_config: GenerateArgs::new(),
            decode_config: DecodeArgs::new(),
            tokenizer_device: None,
            model_device: None,
            size_bytes: None,
        }
    }

    fn completions(
        &self,
        request: &ChatRequest,
        auto_echo: bool,
    ) -> Result<CompletionResponse, ServiceError> {
        let normalized = normalize_request(request, &self.generate_config, &self.decode_config)?;
        complete(
            normalized,
            self.tokenizer.as_ref(),
            self.tokenizer_device.as_deref(),
            self.generator.as_ref(),
            auto_echo,
        )
    }

    fn metadata(&self, kind: ModelKind) -> ModelMetadata {
        ModelMetadata {
            name: self.name.clone(),
            kind,
            model_device: self.model_device.clone(),
            tokenizer_device: self.tokenizer_device.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

/// Encoder-decoder model family.
pub struct Seq2Seq {
    inner: Components,
}

impl Seq2Seq {
    pub fn new(
        name: impl Into<String>,
        tokenizer: Arc<dyn ChatTokenizer>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            inner: Components::new(name, tokenizer, generator),
        }
    }

    pub fn with_generate_config(mut self, config: GenerateArgs) -> Self {
        self.inner.generate_config = config;
        self
    }

    pub fn with_decode_config(mut self, config: DecodeArgs) -> Self {
        self.inner.decode_config = config;
        self
    }

    pub fn with_tokenizer_device(mut self, device: Option<String>) -> Self {
        self.inner.tokenizer_device = device;
        self
    }
}

impl Model for Seq2Seq {
    fn completions(&self, request: &ChatRequest) -> Result<CompletionResponse, ServiceError> {
        self.inner.completions(request, false)
    }

    fn metadata(&self) -> ModelMetadata {
        self.inner.metadata(ModelKind::Seq2Seq)
    }
}

/// Decoder-only model family.
pub struct CausalLm {
    inner: Components,
}

impl CausalLm {
    pub fn new(
        name: impl Into<String>,
        tokenizer: Arc<dyn ChatTokenizer>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            inner: Components::new(name, tokenizer, generator),
        }
    }

    pub fn with_generate_config(mut self, config: GenerateArgs) -> Self {
        self.inner.generate_config = config;
        self
    }

    pub fn with_decode_config(mut self, config: DecodeArgs) -> Self {
        self.inner.decode_config = config;
        self
    }

    pub fn with_tokenizer_device(mut self, device: Option<String>) -> Self {
        self.inner.tokenizer_device = device;
        self
    }
}

impl Model for CausalLm {
    fn completions(&self, request: &ChatRequest) -> Result<CompletionResponse, ServiceError> {
        self.inner.completions(request, false)
    }

    fn metadata(&self) -> ModelMetadata {
        self.inner.metadata(ModelKind::Causal)
    }
}

#[cfg(feature = "tch-backend")]
mod pretrained {
    use std::sync::Arc;

    use tracing::info;

    use super::{CausalLm, Components, PretrainedConfig, Seq2Seq};
    use crate::{
        error::ServiceError,
        model::{
            runtime::Generator,
            tch_backend::{CausalLmGenerator, Seq2SeqGenerator, TorchModule},
            tokenizer::HfTokenizer,
        },
    };

    fn load_parts(config: &PretrainedConfig) -> Result<(TorchModule, Arc<HfTokenizer>), ServiceError> {
        let path = config.pretrained_model_name_or_path.as_str();
        info!(%path, "loading model and tokenizer");
        let tokenizer = Arc::new(HfTokenizer::from_pretrained(path, &config.tokenizer_config)?);
        let fallback_eos = tokenizer.eos_token_id().map(i64::from);
        let module = TorchModule::load(
            path,
            &config.model_config,
            config.model_device.as_deref(),
            fallback_eos,
        )?;
        Ok((module, tokenizer))
    }

    impl Components {
        fn from_pretrained(
            config: &PretrainedConfig,
            tokenizer: Arc<HfTokenizer>,
            generator: Arc<dyn Generator>,
            size_bytes: u64,
        ) -> Self {
            let mut inner = Components::new(
                config.pretrained_model_name_or_path.clone(),
                tokenizer,
                generator,
            );
            inner.generate_config = config.generate_config.clone();
            inner.decode_config = config.decode_config.clone();
            inner.tokenizer_device = config.tokenizer_device.clone();
            inner.model_device = config.model_device.clone();
            inner.size_bytes = Some(size_bytes);
            inner
        }
    }

    impl Seq2Seq {
        pub fn from_pretrained(config: &PretrainedConfig) -> Result<Self, ServiceError> {
            let (module, tokenizer) = load_parts(config)?;
            let size_bytes = module.size_bytes();
            let generator = Arc::new(Seq2SeqGenerator::new(module));
            Ok(Self {
                inner: Components::from_pretrained(config, tokenizer, generator, size_bytes),
            })
        }
    }

    impl CausalLm {
        pub fn from_pretrained(config: &PretrainedConfig) -> Result<Self, ServiceError> {
            let (module, tokenizer) = load_parts(config)?;
            let size_bytes = module.size_bytes();
            let generator = Arc::new(CausalLmGenerator::new(module));
            Ok(Self {
                inner: Components::from_pretrained(config, tokenizer, generator, size_bytes),
            })
        }
    }
}
