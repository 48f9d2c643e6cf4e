use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::error::ServiceError;

/// Which family of generation routine a model uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Seq2Seq,
    Causal,
}

impl FromStr for ModelKind {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_lowercase().as_str() {
            "seq2seq" | "seq2seqlm" => Ok(ModelKind::Seq2Seq),
            "causal" | "causallm" => Ok(ModelKind::Causal),
            other => Err(ServiceError::InvalidConfig(format!(
                "unknown model kind '{other}', expected 'causal' or 'seq2seq'"
            ))),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Seq2Seq => f.write_str("seq2seq"),
            ModelKind::Causal => f.write_str("causal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub kind: ModelKind,
    pub model_device: Option<String>,
    pub tokenizer_device: Option<String>,
    pub size_bytes: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kinds() {
        assert_eq!("Seq2Seq".parse::<ModelKind>().unwrap(), ModelKind::Seq2Seq);
        assert_eq!("causal".parse::<ModelKind>().unwrap(), ModelKind::Causal);
        assert!(matches!(
            "encoder".parse::<ModelKind>(),
            Err(ServiceError::InvalidConfig(_))
        ));
    }
}
