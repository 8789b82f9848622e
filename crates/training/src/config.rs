use std::{
    collections::HashSet,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use candle_core::{DType, Device};
use model::{ModelConfig, SlotFeatureSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use slot_data::{SlotDType, SlotLevel, SlotSchema};

/// One experiment, loaded from `<conf_dir>/<exp>.toml` (or `.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub exp: String,
    /// Directory of the configuration file; relative paths resolve against it.
    #[serde(skip)]
    base_dir: PathBuf,
    /// JSON slot schema describing the archives.
    pub npz_config_path: PathBuf,
    pub train_npz_list: Vec<PathBuf>,
    #[serde(default)]
    pub test_npz_list: Vec<PathBuf>,
    /// Fields read from the archives. Defaults to every slot plus the label.
    #[serde(default)]
    pub requested_npz_names: Vec<String>,
    #[serde(default)]
    pub user_slot_names: Vec<String>,
    pub item_slot_names: Vec<String>,
    #[serde(default = "default_label_name")]
    pub label_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub lr: f64,
    #[serde(default)]
    pub optimizer: OptimizerType,
    /// Exclusive upper bound of the epoch index.
    #[serde(default = "default_max_train_steps")]
    pub max_train_steps: usize,
    #[serde(default = "default_prt_interval")]
    pub prt_interval: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub model_dir: PathBuf,
    #[serde(default)]
    pub summary_dir: PathBuf,
    #[serde(default)]
    pub model: ModelSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_embed_size")]
    pub embed_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default)]
    pub dropout: Option<f32>,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default = "default_sampling_eps")]
    pub sampling_eps: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            embed_size: default_embed_size(),
            hidden_size: default_hidden_size(),
            num_blocks: default_num_blocks(),
            num_heads: default_num_heads(),
            dropout: None,
            max_seq_len: default_max_seq_len(),
            sampling_eps: default_sampling_eps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerType {
    #[default]
    #[serde(rename = "Adam", alias = "adam")]
    Adam,
    #[serde(rename = "SGD", alias = "sgd")]
    Sgd,
}

impl Config {
    /// Loads `<conf_dir>/<exp>.toml`, falling back to `<conf_dir>/<exp>.json`.
    pub fn for_experiment(conf_dir: impl AsRef<Path>, exp: &str) -> Result<Self, TrainingError> {
        let conf_dir = conf_dir.as_ref();
        let toml_path = conf_dir.join(format!("{exp}.toml"));
        let json_path = conf_dir.join(format!("{exp}.json"));
        if toml_path.is_file() {
            Self::from_path(&toml_path)
        } else if json_path.is_file() {
            Self::from_path(&json_path)
        } else {
            Err(TrainingError::ConfigFormat(format!(
                "no configuration for experiment '{exp}' in {} (expected {exp}.toml or {exp}.json)",
                conf_dir.display()
            )))
        }
    }

    /// Parses, resolves and validates a configuration file. The experiment id
    /// is the file stem.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: Config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        config.exp = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("default")
            .to_string();
        config.base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let base_dir = config.base_dir.clone();
        config.apply_base_path(&base_dir);
        config.fill_defaults();
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.train_npz_list.is_empty() {
            errors.push("train_npz_list must not be empty".to_string());
        }
        if self.item_slot_names.is_empty() {
            errors.push("item_slot_names must not be empty".to_string());
        }
        if self.label_name.trim().is_empty() {
            errors.push("label_name must not be empty".to_string());
        }
        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            errors.push("lr must be a positive number".to_string());
        }
        if self.prt_interval == 0 {
            errors.push("prt_interval must be greater than 0".to_string());
        }

        let mut seen = HashSet::new();
        for name in self.slot_names() {
            if !seen.insert(name) {
                errors.push(format!("slot '{name}' is declared more than once"));
            }
        }
        if seen.contains(self.label_name.as_str()) {
            errors.push(format!(
                "label '{}' cannot also be an input slot",
                self.label_name
            ));
        }

        for name in self.slot_names().chain(std::iter::once(self.label_name.as_str())) {
            if !self.requested_npz_names.iter().any(|requested| requested == name) {
                errors.push(format!("requested_npz_names must include '{name}'"));
            }
        }

        let model = &self.model;
        if model.embed_size == 0 {
            errors.push("model.embed_size must be greater than 0".to_string());
        }
        if model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }
        if model.num_blocks == 0 {
            errors.push("model.num_blocks must be greater than 0".to_string());
        }
        if model.num_heads == 0 || model.hidden_size % model.num_heads != 0 {
            errors.push("model.hidden_size must be divisible by model.num_heads".to_string());
        }
        if model.max_seq_len == 0 {
            errors.push("model.max_seq_len must be greater than 0".to_string());
        }
        if let Some(p) = model.dropout {
            if !(0.0..1.0).contains(&p) {
                errors.push("model.dropout must be in [0, 1)".to_string());
            }
        }
        if !(0.0..=1.0).contains(&model.sampling_eps) {
            errors.push("model.sampling_eps must be in [0, 1]".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// User slots followed by item slots, in declaration order.
    pub fn slot_names(&self) -> impl Iterator<Item = &str> {
        self.user_slot_names
            .iter()
            .chain(&self.item_slot_names)
            .map(String::as_str)
    }

    /// Resolves slot declarations against the archive schema.
    pub fn model_config(
        &self,
        schema: &SlotSchema,
        device: &Device,
    ) -> Result<ModelConfig, TrainingError> {
        let user_slots = self
            .user_slot_names
            .iter()
            .map(|name| slot_feature(schema, name, SlotLevel::User))
            .collect::<Result<Vec<_>, _>>()?;
        let item_slots = self
            .item_slot_names
            .iter()
            .map(|name| slot_feature(schema, name, SlotLevel::Item))
            .collect::<Result<Vec<_>, _>>()?;

        let label = schema
            .slot(&self.label_name)
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        if label.level != SlotLevel::Item || label.dtype != SlotDType::Int64 {
            return Err(TrainingError::initialization(format!(
                "label '{}' must be an item-level int64 field",
                self.label_name
            )));
        }

        Ok(ModelConfig {
            user_slots,
            item_slots,
            embed_size: self.model.embed_size,
            hidden_size: self.model.hidden_size,
            num_blocks: self.model.num_blocks,
            num_heads: self.model.num_heads,
            max_seq_len: self.model.max_seq_len,
            dropout_p: self.model.dropout.filter(|p| *p > 0.0),
            dtype: DType::F32,
            device: device.clone(),
        })
    }

    /// Applies `key=value` overrides on top of the loaded configuration.
    pub fn apply_overrides(self, overrides: &[ConfigOverride]) -> Result<Self, TrainingError> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let exp = self.exp.clone();
        let base_dir = self.base_dir.clone();
        let mut value = serde_json::to_value(&self).map_err(|err| {
            TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
        })?;

        for override_arg in overrides {
            log::info!("config override {}={}", override_arg.path, override_arg.value);
            let new_value = parse_override_value(&override_arg.value);
            set_value_at_path(&mut value, &override_arg.path, new_value)?;
        }

        let mut config: Config = serde_json::from_value(value).map_err(|err| {
            TrainingError::ConfigFormat(format!("failed to deserialize config after overrides: {err}"))
        })?;
        config.exp = exp;
        for override_arg in overrides {
            config.resolve_overridden_path(&override_arg.path, &base_dir);
        }
        config.base_dir = base_dir;
        config.fill_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.npz_config_path, base);
        for path in self.train_npz_list.iter_mut().chain(self.test_npz_list.iter_mut()) {
            absolutize_in_place(path, base);
        }
        if !self.model_dir.as_os_str().is_empty() {
            absolutize_in_place(&mut self.model_dir, base);
        }
        if !self.summary_dir.as_os_str().is_empty() {
            absolutize_in_place(&mut self.summary_dir, base);
        }
    }

    /// Overridden path values are relative to the configuration file, like
    /// the ones read from it.
    fn resolve_overridden_path(&mut self, key: &str, base: &Path) {
        match key {
            "npz_config_path" => absolutize_in_place(&mut self.npz_config_path, base),
            "train_npz_list" => {
                for path in &mut self.train_npz_list {
                    absolutize_in_place(path, base);
                }
            }
            "test_npz_list" => {
                for path in &mut self.test_npz_list {
                    absolutize_in_place(path, base);
                }
            }
            "model_dir" if !self.model_dir.as_os_str().is_empty() => {
                absolutize_in_place(&mut self.model_dir, base)
            }
            "summary_dir" if !self.summary_dir.as_os_str().is_empty() => {
                absolutize_in_place(&mut self.summary_dir, base)
            }
            _ => {}
        }
    }

    fn fill_defaults(&mut self) {
        if self.model_dir.as_os_str().is_empty() {
            self.model_dir = Path::new("output").join(&self.exp).join("model");
        }
        if self.summary_dir.as_os_str().is_empty() {
            self.summary_dir = Path::new("output").join(&self.exp).join("summary");
        }
        if self.requested_npz_names.is_empty() {
            let mut names: Vec<String> = self.slot_names().map(str::to_string).collect();
            names.push(self.label_name.clone());
            self.requested_npz_names = names;
        }
    }
}

fn slot_feature(
    schema: &SlotSchema,
    name: &str,
    level: SlotLevel,
) -> Result<SlotFeatureSpec, TrainingError> {
    let spec = schema
        .slot(name)
        .map_err(|err| TrainingError::initialization(err.to_string()))?;
    if spec.level != level {
        return Err(TrainingError::initialization(format!(
            "slot '{name}' is declared as {:?}-level in the schema but listed as {:?}-level",
            spec.level, level
        )));
    }
    match (spec.dtype, spec.vocab_size) {
        (SlotDType::Int64, Some(vocab_size)) => Ok(SlotFeatureSpec::categorical(name, vocab_size)),
        (SlotDType::Int64, None) => Err(TrainingError::initialization(format!(
            "int64 slot '{name}' needs a vocab_size in the schema"
        ))),
        (SlotDType::Float32, _) => Ok(SlotFeatureSpec::dense(name, spec.row_width())),
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_label_name() -> String {
    "click_id".to_string()
}

fn default_batch_size() -> usize {
    32
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_max_train_steps() -> usize {
    10
}

fn default_prt_interval() -> usize {
    100
}

fn default_seed() -> u64 {
    42
}

fn default_embed_size() -> usize {
    16
}

fn default_hidden_size() -> usize {
    32
}

fn default_num_blocks() -> usize {
    2
}

fn default_num_heads() -> usize {
    4
}

fn default_max_seq_len() -> usize {
    128
}

fn default_sampling_eps() -> f64 {
    0.1
}

/// A `key=value` override with a dot-separated key, e.g. `model.hidden_size=64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: String,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::validation(vec![format!(
            "invalid override path '{path}'"
        )]));
    }

    let mut current = target;
    for (idx, segment) in segments.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().ok_or_else(|| {
            TrainingError::validation(vec![format!(
                "override path segment '{segment}' points into a non-object value"
            )])
        })?;
        let entry = map.entry(segment.to_string()).or_insert(Value::Null);
        if idx + 1 == segments.len() {
            *entry = new_value;
            return Ok(());
        }
        current = entry;
    }

    Ok(())
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "I/O error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "task initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "run failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) => None,
            TrainingError::Validation(_) => None,
            TrainingError::Initialization(_) | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<slot_data::DataError> for TrainingError {
    fn from(value: slot_data::DataError) -> Self {
        match value {
            slot_data::DataError::Io(err) => TrainingError::Io(err),
            other => TrainingError::Runtime(other.to_string()),
        }
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
