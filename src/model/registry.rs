use std::sync::Arc;

use tokio::task;

use crate::{
    completion::{ChatRequest, CompletionResponse},
    config::AppConfig,
    error::ServiceError,
    model::{Model, ModelMetadata},
};

pub struct ModelRegistry {
    model: Arc<dyn Model>,
}

impl ModelRegistry {
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let model = load_model(config)?;
        Ok(Self::from_model(model))
    }

    pub fn from_model(model: Arc<dyn Model>) -> Self {
        Self { model }
    }

    pub fn metadata(&self) -> ModelMetadata {
        self.model.metadata()
    }

    /// Runs one completions call on the blocking pool.
    pub async fn completions(
        &self,
        request: ChatRequest,
    ) -> Result<CompletionResponse, ServiceError> {
        let model = self.model.clone();
        task::spawn_blocking(move || model.completions(&request))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }
}

#[cfg(feature = "tch-backend")]
fn load_model(config: &AppConfig) -> Result<Arc<dyn Model>, ServiceError> {
    use crate::model::{CausalLm, ModelKind, PretrainedConfig, Seq2Seq};

    let pretrained = PretrainedConfig::from(config);
    let model: Arc<dyn Model> = match config.model_kind {
        ModelKind::Seq2Seq => Arc::new(Seq2Seq::from_pretrained(&pretrained)?),
        ModelKind::Causal => Arc::new(CausalLm::from_pretrained(&pretrained)?),
    };
    Ok(model)
}

#[cfg(not(feature = "tch-backend"))]
fn load_model(_config: &AppConfig) -> Result<Arc<dyn Model>, ServiceError> {
    Err(ServiceError::Other(
        "no generation backend compiled in".to_string(),
    ))
}
