use crate::error::{ReceiptError, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

/// Where the config is looked up when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = ".config/receipt_ingest.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub crop: CropConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
}

fn default_db_path() -> String {
    "receipts/receipts.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CropConfig {
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    /// Padding in normalized units; 10 units is 1% of the page dimension.
    #[serde(default = "default_padding")]
    pub padding: f64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Path to the `pdftoppm` binary, or the poppler `bin` directory. `None` means `$PATH`.
    #[serde(default)]
    pub pdftoppm: Option<PathBuf>,
}

fn default_dpi() -> u32 {
    300
}

fn default_padding() -> f64 {
    20.0
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("extracted_receipts_padded")
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            dpi: default_dpi(),
            padding: default_padding(),
            output_dir: default_output_dir(),
            pdftoppm: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            gemini: GeminiConfig::default(),
            crop: CropConfig::default(),
            extract: ExtractConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(content).map_err(|e| ReceiptError::Config(e.to_string()))?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Load from an explicit path, or fall back to the default location, or to defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            info!(path = %default_path.display(), "Loading configuration");
            Self::load(default_path)
        } else {
            Ok(Self::default())
        }
    }

    fn check(&self) -> Result<()> {
        self.crop.check()
    }
}

impl CropConfig {
    /// Run again after command-line overrides are applied.
    pub fn check(&self) -> Result<()> {
        if self.dpi == 0 {
            return Err(ReceiptError::Config("crop.dpi must be positive".into()));
        }
        // NaN fails the range test too
        if !(0.0..=1000.0).contains(&self.padding) {
            return Err(ReceiptError::Config(format!(
                "crop.padding must be within 0..=1000, got {}",
                self.padding
            )));
        }
        Ok(())
    }
}

impl GeminiConfig {
    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ReceiptError::CredentialMissing {
                var: self.api_key_env.clone(),
            }),
        }
    }
}
