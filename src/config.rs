use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use anyhow::{Context, bail};
use serde_json::{Map, Value};

use crate::model::ModelKind;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_id: String,
    pub model_kind: ModelKind,
    pub model_device: Option<String>,
    pub tokenizer_device: Option<String>,
    pub model_config: Map<String, Value>,
    pub tokenizer_config: Map<String, Value>,
    pub generate_config: Map<String, Value>,
    pub decode_config: Map<String, Value>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));

        let model_id = env::var("MODEL_ID").unwrap_or_else(|_| "models/model".to_string());
        let model_kind: ModelKind = env::var("MODEL_KIND")
            .unwrap_or_else(|_| "causal".to_string())
            .parse()?;

        let model_device = env::var("MODEL_DEVICE").ok().filter(|v| !v.is_empty());
        let tokenizer_device = env::var("TOKENIZER_DEVICE").ok().filter(|v| !v.is_empty());

        Ok(Self {
            listen_addr,
            model_id,
            model_kind,
            model_device,
            tokenizer_device,
            model_config: json_object_from_env("MODEL_CONFIG")?,
            tokenizer_config: json_object_from_env("TOKENIZER_CONFIG")?,
            generate_config: json_object_from_env("GENERATE_CONFIG")?,
            decode_config: json_object_from_env("DECODE_CONFIG")?,
        })
    }
}

fn json_object_from_env(key: &str) -> anyhow::Result<Map<String, Value>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => parse_json_object(key, &raw),
        _ => Ok(Map::new()),
    }
}

pub(crate) fn parse_json_object(key: &str, raw: &str) -> anyhow::Result<Map<String, Value>> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("{key} is not valid JSON"))?;
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("{key} must be a JSON object, got {other}"),
    }
}
