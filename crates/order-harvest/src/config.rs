//! Run configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Command-line flags ([`Overrides`])
//! 2. Environment variables (a `.env` file is loaded by the binary)
//! 3. TOML file passed with `--config` ([`FileConfig`])
//! 4. Profile defaults ([`PipelineProfile::for_kind`])
//!
//! ## Profiles
//!
//! | Constant                 | trial            | production         |
//! |--------------------------|------------------|--------------------|
//! | pre-fetch delay          | 5-8 s            | 15-25 s            |
//! | post-fetch cooldown      | 3-4 s            | 10-15 s            |
//! | per-message pause        | none             | 4-8 s              |
//! | checkpoint every         | 3 orders         | 5 orders           |
//! | checkpoint pause         | 5 s              | 45-65 s            |
//! | LLM attempts             | 3                | 4                  |
//! | model                    | Claude 3.5 Haiku | Claude 3.5 Sonnet  |

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::ClassifierSettings;
use crate::crm::CrmSettings;
use crate::errors::HarvestError;
use crate::formatter::FormatterSettings;
use crate::ledger::Pricing;
use crate::llm::DEFAULT_LLM_BASE_URL;
use crate::pacing::DelayRange;
use crate::retry::{Backoff, RetryPolicy};
use crate::source::{FetchPacing, DEFAULT_GATEWAY_BASE_URL};

const ENV_GATEWAY_INSTANCE: &str = "HARVEST_GATEWAY_INSTANCE";
const ENV_GATEWAY_TOKEN: &str = "HARVEST_GATEWAY_TOKEN";
const ENV_GATEWAY_URL: &str = "HARVEST_GATEWAY_URL";
const ENV_CHAT_ID: &str = "HARVEST_CHAT_ID";
const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";
const ENV_LLM_URL: &str = "HARVEST_LLM_URL";
const ENV_MODEL: &str = "HARVEST_MODEL";
const ENV_PROFILE: &str = "HARVEST_PROFILE";
const ENV_BATCH_LIMIT: &str = "HARVEST_BATCH_LIMIT";
const ENV_MAX_ATTEMPTS: &str = "HARVEST_MAX_ATTEMPTS";
const ENV_PRICE_INPUT: &str = "HARVEST_PRICE_INPUT_PER_M";
const ENV_PRICE_OUTPUT: &str = "HARVEST_PRICE_OUTPUT_PER_M";
const ENV_OUT_DIR: &str = "HARVEST_OUT_DIR";
const ENV_CHECKPOINT: &str = "HARVEST_CHECKPOINT";

/// Which set of pacing and retry constants to run with.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Short delays and a cheaper model, for trying things out.
    #[default]
    #[value(alias = "prueba")]
    Trial,
    /// Conservative pacing for full-history runs.
    #[value(aliases = ["prod", "produccion"])]
    Production,
}

impl ProfileKind {
    /// Tag used in output file names.
    pub fn file_tag(self) -> &'static str {
        match self {
            Self::Trial => "PRUEBA",
            Self::Production => "PRODUCCION",
        }
    }

    pub fn default_checkpoint_name(self) -> String {
        format!("progreso_{self}.txt")
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trial => write!(f, "trial"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl FromStr for ProfileKind {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trial" | "prueba" => Ok(Self::Trial),
            "production" | "prod" | "produccion" => Ok(Self::Production),
            other => Err(HarvestError::Configuration(format!(
                "unknown profile `{other}` (expected trial or production)"
            ))),
        }
    }
}

/// Every constant that differs between the two profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineProfile {
    pub kind: ProfileKind,
    pub fetch: FetchPacing,
    /// Taken after each analysed message.
    pub message_pause: DelayRange,
    #[serde(with = "crate::pacing::duration_secs")]
    pub prefilter_reject_pause: Duration,
    /// Partial cost report and checkpoint pause after this many orders.
    pub checkpoint_every: usize,
    pub checkpoint_pause: DelayRange,
    pub classifier: ClassifierSettings,
    pub formatter: FormatterSettings,
    pub crm: CrmSettings,
    pub batch_limit: usize,
    pub model: String,
}

impl PipelineProfile {
    pub fn for_kind(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::Trial => Self::trial(),
            ProfileKind::Production => Self::production(),
        }
    }

    fn trial() -> Self {
        Self {
            kind: ProfileKind::Trial,
            fetch: FetchPacing {
                before: DelayRange::new(5.0, 8.0),
                after: DelayRange::new(3.0, 4.0),
                failure_cooldown: Duration::from_secs(30),
            },
            message_pause: DelayRange::ZERO,
            prefilter_reject_pause: Duration::ZERO,
            checkpoint_every: 3,
            checkpoint_pause: DelayRange::fixed(5.0),
            classifier: ClassifierSettings {
                retry: RetryPolicy::uniform(3, Backoff::linear(1, 1)),
                max_tokens: 5,
                timeout: Duration::from_secs(15),
                prompt_char_cap: 500,
                success_pause: Duration::from_millis(500),
            },
            formatter: FormatterSettings {
                retry: RetryPolicy::uniform(3, Backoff::linear(3, 2)),
                max_tokens: 800,
                timeout: Duration::from_secs(20),
                success_pause: Duration::from_secs(1),
            },
            crm: CrmSettings {
                retry: RetryPolicy::uniform(3, Backoff::fixed(2))
                    .with_parse_failure(Backoff::fixed(1)),
                max_tokens: 200,
                timeout: Duration::from_secs(15),
                success_pause: Duration::from_millis(500),
                between_records: Duration::from_millis(500),
                long_pause: Duration::from_millis(500),
            },
            batch_limit: 20,
            model: "claude-3-5-haiku-20241022".to_string(),
        }
    }

    fn production() -> Self {
        Self {
            kind: ProfileKind::Production,
            fetch: FetchPacing {
                before: DelayRange::new(15.0, 25.0),
                after: DelayRange::new(10.0, 15.0),
                failure_cooldown: Duration::from_secs(120),
            },
            message_pause: DelayRange::new(4.0, 8.0),
            prefilter_reject_pause: Duration::from_millis(300),
            checkpoint_every: 5,
            checkpoint_pause: DelayRange::new(45.0, 65.0),
            classifier: ClassifierSettings {
                retry: RetryPolicy::tiered(
                    4,
                    Backoff::linear(8, 4),
                    Backoff::linear(15, 5),
                    Backoff::linear(5, 3),
                ),
                max_tokens: 5,
                timeout: Duration::from_secs(20),
                prompt_char_cap: 600,
                success_pause: Duration::from_secs(1),
            },
            formatter: FormatterSettings {
                retry: RetryPolicy::tiered(
                    4,
                    Backoff::linear(10, 5),
                    Backoff::linear(20, 10),
                    Backoff::linear(7, 4),
                ),
                max_tokens: 1000,
                timeout: Duration::from_secs(25),
                success_pause: Duration::from_secs(2),
            },
            crm: CrmSettings {
                retry: RetryPolicy::uniform(4, Backoff::linear(3, 1))
                    .with_parse_failure(Backoff::linear(2, 1)),
                max_tokens: 200,
                timeout: Duration::from_secs(20),
                success_pause: Duration::from_millis(500),
                between_records: Duration::from_secs(1),
                long_pause: Duration::from_secs(3),
            },
            batch_limit: 1000,
            model: "claude-3-5-sonnet-20240620".to_string(),
        }
    }

    /// Apply one attempt budget to all three LLM stages.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.classifier.retry = self.classifier.retry.with_max_attempts(max_attempts);
        self.formatter.retry = self.formatter.retry.with_max_attempts(max_attempts);
        self.crm.retry = self.crm.retry.with_max_attempts(max_attempts);
        self
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub base_url: String,
    pub instance_id: String,
    pub token: String,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("instance_id", &self.instance_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

/// Fully resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub profile: PipelineProfile,
    pub gateway: GatewayConfig,
    pub llm: LlmConfig,
    pub chat_id: String,
    pub batch_limit: usize,
    pub pricing: Pricing,
    pub out_dir: PathBuf,
    pub checkpoint_path: PathBuf,
}

/// Values taken from command-line flags.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub profile: Option<ProfileKind>,
    pub batch_limit: Option<usize>,
    pub chat_id: Option<String>,
    pub out_dir: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileGateway {
    pub url: Option<String>,
    pub instance: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileLlm {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilePricing {
    pub input_per_million: Option<f64>,
    pub output_per_million: Option<f64>,
}

/// Shape of the `--config` TOML file. Every field is optional.
///
/// ```toml
/// profile = "production"
/// chat_id = "573000000000-1600000000@g.us"
///
/// [gateway]
/// instance = "instance000000"
/// token = "..."
///
/// [llm]
/// max_attempts = 3
///
/// [pricing]
/// input_per_million = 3.0
/// output_per_million = 15.0
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub profile: Option<ProfileKind>,
    pub chat_id: Option<String>,
    pub batch_limit: Option<usize>,
    pub out_dir: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
    pub gateway: FileGateway,
    pub llm: FileLlm,
    pub pricing: FilePricing,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, HarvestError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&text).map_err(|e| {
            HarvestError::Configuration(format!("invalid config {}: {e}", path.display()))
        })
    }
}

fn parsed<T: FromStr>(name: &str, raw: Option<String>) -> Result<Option<T>, HarvestError>
where
    T::Err: fmt::Display,
{
    raw.map(|value| {
        value.trim().parse::<T>().map_err(|e| {
            HarvestError::Configuration(format!("{name}={value:?} is not valid: {e}"))
        })
    })
    .transpose()
}

fn required(name: &str, value: Option<String>) -> Result<String, HarvestError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| HarvestError::Configuration(format!("{name} is not set")))
}

impl HarvestConfig {
    /// Resolve from flags, the process environment and an optional file.
    pub fn load(overrides: Overrides, config_file: Option<&Path>) -> Result<Self, HarvestError> {
        let file = match config_file {
            Some(path) => FileConfig::from_path(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(overrides, file, |key| env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve<E>(overrides: Overrides, file: FileConfig, env: E) -> Result<Self, HarvestError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let kind = match overrides.profile {
            Some(kind) => kind,
            None => match env(ENV_PROFILE) {
                Some(raw) => raw.parse()?,
                None => file.profile.unwrap_or_default(),
            },
        };
        let mut profile = PipelineProfile::for_kind(kind);

        let max_attempts = parsed::<u32>(ENV_MAX_ATTEMPTS, env(ENV_MAX_ATTEMPTS))?
            .or(file.llm.max_attempts);
        if let Some(n) = max_attempts {
            if n == 0 {
                return Err(HarvestError::Configuration(format!(
                    "{ENV_MAX_ATTEMPTS} must be at least 1"
                )));
            }
            profile = profile.with_max_attempts(n);
        }

        let batch_limit = match overrides.batch_limit {
            Some(n) => n,
            None => parsed::<usize>(ENV_BATCH_LIMIT, env(ENV_BATCH_LIMIT))?
                .or(file.batch_limit)
                .unwrap_or(profile.batch_limit),
        };

        let defaults = Pricing::default();
        let pricing = Pricing {
            input_per_million: parsed::<f64>(ENV_PRICE_INPUT, env(ENV_PRICE_INPUT))?
                .or(file.pricing.input_per_million)
                .unwrap_or(defaults.input_per_million),
            output_per_million: parsed::<f64>(ENV_PRICE_OUTPUT, env(ENV_PRICE_OUTPUT))?
                .or(file.pricing.output_per_million)
                .unwrap_or(defaults.output_per_million),
        };
        if pricing.input_per_million < 0.0 || pricing.output_per_million < 0.0 {
            return Err(HarvestError::Configuration("prices must not be negative".into()));
        }

        let gateway = GatewayConfig {
            base_url: env(ENV_GATEWAY_URL)
                .or(file.gateway.url)
                .unwrap_or_else(|| DEFAULT_GATEWAY_BASE_URL.to_string()),
            instance_id: required(ENV_GATEWAY_INSTANCE, env(ENV_GATEWAY_INSTANCE).or(file.gateway.instance))?,
            token: required(ENV_GATEWAY_TOKEN, env(ENV_GATEWAY_TOKEN).or(file.gateway.token))?,
        };

        let llm = LlmConfig {
            base_url: env(ENV_LLM_URL)
                .or(file.llm.url)
                .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string()),
            api_key: required(ENV_API_KEY, env(ENV_API_KEY).or(file.llm.api_key))?,
            model: env(ENV_MODEL)
                .or(file.llm.model)
                .unwrap_or_else(|| profile.model.clone()),
        };
        profile.model = llm.model.clone();

        let chat_id = required(
            ENV_CHAT_ID,
            overrides.chat_id.or_else(|| env(ENV_CHAT_ID)).or(file.chat_id),
        )?;

        let out_dir = overrides
            .out_dir
            .or_else(|| env(ENV_OUT_DIR).map(PathBuf::from))
            .or(file.out_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        let checkpoint_path = overrides
            .checkpoint
            .or_else(|| env(ENV_CHECKPOINT).map(PathBuf::from))
            .or(file.checkpoint)
            .unwrap_or_else(|| out_dir.join(kind.default_checkpoint_name()));

        Ok(Self {
            profile,
            gateway,
            llm,
            chat_id,
            batch_limit,
            pricing,
            out_dir,
            checkpoint_path,
        })
    }
}
