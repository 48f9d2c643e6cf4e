//! TorchScript generation for causal and encoder-decoder models.

use std::{fs, path::Path};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tracing::{debug, info};

use crate::{
    completion::{EncodedPrompt, GenerateArgs},
    error::ServiceError,
    model::runtime::Generator,
};

const DEFAULT_MODULE_FILE: &str = "model.pt";
const DEFAULT_MAX_NEW_TOKENS: usize = 20;

const GENERATION_CONFIG_FILE: &str = "generation_config.json";
const MODEL_CONFIG_FILE: &str = "config.json";

const KNOWN_ARGS: [&str; 8] = [
    "max_new_tokens",
    "max_length",
    "do_sample",
    "temperature",
    "top_k",
    "top_p",
    "eos_token_id",
    "decoder_start_token_id",
];

pub fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else if lower == "mps" {
        Device::Mps
    } else {
        Device::Cpu
    }
}

/// Generation defaults shipped with the model artifacts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelDefaults {
    pub eos_token_ids: Vec<i64>,
    pub decoder_start_token_id: Option<i64>,
    pub max_length: Option<usize>,
}

impl ModelDefaults {
    /// Merges config maps in priority order: the first source that carries
    /// a key wins.
    pub fn resolve(sources: &[&Map<String, Value>]) -> Self {
        Self {
            eos_token_ids: lookup(sources, "eos_token_id")
                .and_then(eos_ids)
                .unwrap_or_default(),
            decoder_start_token_id: lookup(sources, "decoder_start_token_id").and_then(Value::as_i64),
            max_length: lookup(sources, "max_length")
                .and_then(Value::as_u64)
                .and_then(|v| usize::try_from(v).ok()),
        }
    }

    /// Reads `model_config`, then `generation_config.json`, then
    /// `config.json` under `root`. `fallback_eos` is used when none of them
    /// name an end-of-sequence token.
    pub fn load(
        root: &Path,
        model_config: &Map<String, Value>,
        fallback_eos: Option<i64>,
    ) -> Result<Self, ServiceError> {
        let generation_config = read_config_file(&root.join(GENERATION_CONFIG_FILE))?;
        let config = read_config_file(&root.join(MODEL_CONFIG_FILE))?;
        let mut defaults = Self::resolve(&[model_config, &generation_config, &config]);
        if defaults.eos_token_ids.is_empty() {
            defaults.eos_token_ids.extend(fallback_eos);
        }
        debug!(?defaults, root = %root.display(), "resolved generation defaults");
        Ok(defaults)
    }
}

fn lookup<'a>(sources: &[&'a Map<String, Value>], key: &str) -> Option<&'a Value> {
    sources
        .iter()
        .find_map(|source| source.get(key).filter(|value| !value.is_null()))
}

fn read_config_file(path: &Path) -> Result<Map<String, Value>, ServiceError> {
    if !path.is_file() {
        return Ok(Map::new());
    }
    let raw = fs::read_to_string(path)?;
    match serde_json::from_str(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ServiceError::InvalidConfig(format!(
            "{} must contain a JSON object",
            path.display()
        ))),
        Err(e) => Err(ServiceError::InvalidConfig(format!("{}: {e}", path.display()))),
    }
}

/// `eos_token_id` may be a single id or a list of ids.
fn eos_ids(value: &Value) -> Option<Vec<i64>> {
    match value {
        Value::Array(items) => items.iter().map(Value::as_i64).collect(),
        other => other.as_i64().map(|id| vec![id]),
    }
}

/// Generation settings decoded from the keyword arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub max_new_tokens: Option<usize>,
    pub max_length: Option<usize>,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub eos_token_ids: Vec<i64>,
    pub decoder_start_token_id: i64,
}

impl GenerationOptions {
    pub fn from_args(args: &GenerateArgs, defaults: &ModelDefaults) -> Result<Self, ServiceError> {
        for key in args.keys() {
            if !KNOWN_ARGS.contains(&key.as_str()) {
                debug!(%key, "ignoring unsupported generation argument");
            }
        }

        let eos_token_ids = match args.get("eos_token_id") {
            None | Some(Value::Null) => defaults.eos_token_ids.clone(),
            Some(value) => eos_ids(value).ok_or_else(|| {
                ServiceError::Inference(format!(
                    "eos_token_id must be an integer or a list of integers, got {value}"
                ))
            })?,
        };

        let options = Self {
            max_new_tokens: usize_arg(args, "max_new_tokens")?,
            max_length: usize_arg(args, "max_length")?.or(defaults.max_length),
            do_sample: args.get("do_sample").and_then(Value::as_bool).unwrap_or(false),
            temperature: f64_arg(args, "temperature")?.unwrap_or(1.0),
            top_k: usize_arg(args, "top_k")?.unwrap_or(0),
            top_p: f64_arg(args, "top_p")?.unwrap_or(1.0),
            eos_token_ids,
            decoder_start_token_id: args
                .get("decoder_start_token_id")
                .and_then(Value::as_i64)
                .or(defaults.decoder_start_token_id)
                .unwrap_or(0),
        };

        if options.do_sample && options.temperature <= 0.0 {
            return Err(ServiceError::Inference(format!(
                "temperature has to be strictly positive, got {}",
                options.temperature
            )));
        }
        if !(0.0..=1.0).contains(&options.top_p) {
            return Err(ServiceError::Inference(format!(
                "top_p has to be within [0, 1], got {}",
                options.top_p
            )));
        }
        Ok(options)
    }

    /// Number of tokens to generate after `current_len` existing ones.
    /// `max_new_tokens` takes precedence over `max_length`.
    pub fn new_token_budget(&self, current_len: usize) -> usize {
        match (self.max_new_tokens, self.max_length) {
            (Some(max_new_tokens), _) => max_new_tokens,
            (None, Some(max_length)) => max_length.saturating_sub(current_len),
            (None, None) => DEFAULT_MAX_NEW_TOKENS,
        }
    }

    pub fn is_eos(&self, token: i64) -> bool {
        self.eos_token_ids.contains(&token)
    }
}

fn usize_arg(args: &GenerateArgs, key: &str) -> Result<Option<usize>, ServiceError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| ServiceError::Inference(format!("{key} must be an integer, got {value}"))),
    }
}

fn f64_arg(args: &GenerateArgs, key: &str) -> Result<Option<f64>, ServiceError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| ServiceError::Inference(format!("{key} must be a number, got {value}"))),
    }
}

/// Turns raw logits into the distribution the next token is drawn from.
///
/// Returns `None` for greedy decoding. Masked entries have probability 0.
pub fn sampling_distribution(logits: &[f32], options: &GenerationOptions) -> Option<Vec<f32>> {
    if !options.do_sample {
        return None;
    }

    let mut scaled: Vec<f32> = logits
        .iter()
        .map(|&l| (l as f64 / options.temperature) as f32)
        .collect();

    if options.top_k > 0 && options.top_k < scaled.len() {
        let mut sorted = scaled.clone();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let threshold = sorted[options.top_k - 1];
        for l in scaled.iter_mut() {
            if *l < threshold {
                *l = f32::NEG_INFINITY;
            }
        }
    }

    let mut probs = softmax(&scaled);

    if options.top_p < 1.0 {
        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
        let mut cumulative = 0.0f64;
        let mut keep = vec![false; probs.len()];
        for &idx in &order {
            // always keep the most likely token
            keep[idx] = true;
            cumulative += probs[idx] as f64;
            if cumulative >= options.top_p {
                break;
            }
        }
        for (p, kept) in probs.iter_mut().zip(keep) {
            if !kept {
                *p = 0.0;
            }
        }
        let total: f32 = probs.iter().sum();
        if total > 0.0 {
            probs.iter_mut().for_each(|p| *p /= total);
        }
    }

    Some(probs)
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// A traced TorchScript module plus the device it lives on.
pub struct TorchModule {
    module: Mutex<tch::CModule>,
    device: Device,
    size_bytes: u64,
    defaults: ModelDefaults,
}

impl TorchModule {
    /// Loads `<root>/<model_config.module_file>` onto `device`.
    pub fn load(
        pretrained_model_name_or_path: &str,
        model_config: &Map<String, Value>,
        device: Option<&str>,
        fallback_eos: Option<i64>,
    ) -> Result<Self, ServiceError> {
        let root = Path::new(pretrained_model_name_or_path);
        let file = model_config
            .get("module_file")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MODULE_FILE);
        let module_path = root.join(file);
        if !module_path.exists() {
            return Err(ServiceError::Other(format!(
                "model artifact missing: {}",
                module_path.display()
            )));
        }
        let size_bytes = fs::metadata(&module_path)?.len();
        let device = device.map(parse_device).unwrap_or(Device::Cpu);
        let mut module = tch::CModule::load_on_device(&module_path, device)
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        module.set_eval();
        info!(path = %module_path.display(), ?device, size_bytes, "loaded TorchScript module");
        let defaults = ModelDefaults::load(root, model_config, fallback_eos)?;

        Ok(Self {
            module: Mutex::new(module),
            device,
            size_bytes,
            defaults,
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn input_device(&self, prompt: &EncodedPrompt) -> Device {
        prompt.device.as_deref().map(parse_device).unwrap_or(self.device)
    }

    /// Runs the module and returns the logits for the final position.
    fn last_logits(&self, inputs: Vec<Tensor>) -> Result<Tensor, ServiceError> {
        let inputs: Vec<IValue> = inputs.into_iter().map(IValue::Tensor).collect();
        let output = self
            .module
            .lock()
            .forward_is(&inputs)
            .map_err(|e| ServiceError::Inference(e.to_string()))?;

        // either a tensor or a tuple with the logits first
        let logits = match output {
            IValue::Tensor(t) => t,
            IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                IValue::Tensor(t) => t.shallow_clone(),
                _ => {
                    return Err(ServiceError::Inference(
                        "Expected tensor as first tuple element".into(),
                    ));
                }
            },
            _ => {
                return Err(ServiceError::Inference(
                    "Unexpected model output format".into(),
                ));
            }
        };

        // [1, seq_len, vocab] -> [vocab]
        Ok(logits.select(1, -1).squeeze())
    }

    fn next_token(&self, logits: Tensor, options: &GenerationOptions) -> Result<i64, ServiceError> {
        if !options.do_sample {
            return Ok(logits.argmax(0, false).int64_value(&[]));
        }
        let host = logits.to_kind(Kind::Float).to_device(Device::Cpu);
        let values = Vec::<f32>::try_from(&host).map_err(|e| ServiceError::Inference(e.to_string()))?;
        match sampling_distribution(&values, options) {
            Some(probs) => Ok(Tensor::from_slice(&probs)
                .multinomial(1, false)
                .int64_value(&[0])),
            None => Ok(logits.argmax(0, false).int64_value(&[])),
        }
    }
}

fn ids_tensor(ids: &[i64], device: Device) -> Tensor {
    Tensor::from_slice(ids)
        .reshape([1, ids.len() as i64])
        .to(device)
}

fn prompt_ids(prompt: &EncodedPrompt) -> Vec<i64> {
    let mut ids: Vec<i64> = prompt.ids.iter().map(|&id| id as i64).collect();
    if ids.is_empty() {
        ids.push(0);
    }
    ids
}

fn to_output(ids: &[i64]) -> Vec<u32> {
    ids.iter().map(|&id| id as u32).collect()
}

/// Decoder-only generation; the returned sequence starts with the prompt.
pub struct CausalLmGenerator {
    module: TorchModule,
}

impl CausalLmGenerator {
    pub fn new(module: TorchModule) -> Self {
        Self { module }
    }
}

impl Generator for CausalLmGenerator {
    fn generate(
        &self,
        prompt: &EncodedPrompt,
        args: &GenerateArgs,
    ) -> Result<Vec<Vec<u32>>, ServiceError> {
        let options = GenerationOptions::from_args(args, &self.module.defaults)?;
        let device = self.module.input_device(prompt);
        let mut ids = prompt_ids(prompt);
        let budget = options.new_token_budget(ids.len());

        no_grad(|| {
            for _ in 0..budget {
                let logits = self.module.last_logits(vec![ids_tensor(&ids, device)])?;
                let next = self.module.next_token(logits, &options)?;
                ids.push(next);
                if options.is_eos(next) {
                    break;
                }
            }
            Ok::<(), ServiceError>(())
        })?;

        Ok(vec![to_output(&ids)])
    }
}

/// Encoder-decoder generation; the module takes `(input_ids,
/// decoder_input_ids)` and the returned sequence is the decoder side.
pub struct Seq2SeqGenerator {
    module: TorchModule,
}

impl Seq2SeqGenerator {
    pub fn new(module: TorchModule) -> Self {
        Self { module }
    }
}

impl Generator for Seq2SeqGenerator {
    fn generate(
        &self,
        prompt: &EncodedPrompt,
        args: &GenerateArgs,
    ) -> Result<Vec<Vec<u32>>, ServiceError> {
        let options = GenerationOptions::from_args(args, &self.module.defaults)?;
        let device = self.module.input_device(prompt);
        let input_ids = prompt_ids(prompt);
        let mut decoder_ids = vec![options.decoder_start_token_id];
        let budget = options.new_token_budget(decoder_ids.len());

        no_grad(|| {
            let encoder_input = ids_tensor(&input_ids, device);
            for _ in 0..budget {
                let logits = self.module.last_logits(vec![
                    encoder_input.shallow_clone(),
                    ids_tensor(&decoder_ids, device),
                ])?;
                let next = self.module.next_token(logits, &options)?;
                decoder_ids.push(next);
                if options.is_eos(next) {
                    break;
                }
            }
            Ok::<(), ServiceError>(())
        })?;

        Ok(vec![to_output(&decoder_ids)])
    }
}
