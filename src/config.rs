use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::backend::{BackendKind, Hyperparameters};
use crate::cross_validation::SplitConfig;
use crate::datasets::{expand_path, EncodingOptions};
use crate::error::RecError;
use crate::evaluation::EvaluationConfig;
use crate::Flt;

pub const ENV_PREFIX: &str = "RECSYS";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dataset: DatasetConfig,
    pub split: SplitConfig,
    pub model: ModelConfig,
    pub evaluation: EvaluationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub path: String,
    /// A single byte, or `tab`.
    pub separator: String,
    pub binarize: bool,
    pub min_rating: Option<Flt>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        DatasetConfig {
            path: "u.data".to_string(),
            separator: "\t".to_string(),
            binarize: false,
            min_rating: None,
        }
    }
}

impl DatasetConfig {
    pub fn path(&self) -> PathBuf {
        expand_path(&self.path)
    }

    pub fn separator_byte(&self) -> Result<u8, RecError> {
        match self.separator.as_str() {
            "\t" | "\\t" | "tab" => Ok(b'\t'),
            s if s.len() == 1 => Ok(s.as_bytes()[0]),
            s => Err(RecError::InvalidConfig(format!("separator must be a single byte, got {:?}", s))),
        }
    }

    pub fn encoding(&self) -> EncodingOptions {
        EncodingOptions { binarize: self.binarize, min_rating: self.min_rating }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub backend: BackendKind,
    pub hyperparameters: Hyperparameters,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig { backend: BackendKind::Als, hyperparameters: Hyperparameters::default() }
    }
}

impl PipelineConfig {
    /// Layers an optional config file and `RECSYS__SECTION__KEY` environment
    /// variables over the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<PipelineConfig, RecError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<(), RecError> {
        self.dataset.separator_byte()?;
        if let Some(min_rating) = self.dataset.min_rating {
            if !min_rating.is_finite() || min_rating < 0.0 {
                return Err(RecError::InvalidConfig("min_rating must be a non-negative number".to_string()));
            }
        }
        self.split.hold_out().validate()?;
        if self.evaluation.k == 0 {
            return Err(RecError::InvalidConfig("k must be greater than 0".to_string()));
        }
        self.model.hyperparameters.validate()?;
        if self.model.backend == BackendKind::Als {
            crate::als::ensure_ridge(&self.model.hyperparameters)?;
        }
        Ok(())
    }
}
