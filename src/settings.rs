use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::BrokerSettings;
use crate::capability::{CapabilityVariant, DocumentOptions};
use crate::error::ConfigError;
use crate::job::StageName;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub version: u32,
    pub workers: usize,
    pub capabilities: CapabilitySettings,
    pub pipeline: PipelineSettings,
    pub broker: BrokerConfig,
    pub store: StoreSettings,
    pub metrics: MetricsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: 1,
            workers: 2,
            capabilities: CapabilitySettings::default(),
            pipeline: PipelineSettings::default(),
            broker: BrokerConfig::default(),
            store: StoreSettings::default(),
            metrics: MetricsSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Loads and rejects anything [`validate_settings`] reports as an error.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let settings = Self::load(path)?;
        let report = validate_settings(&settings);
        if report.is_ok() {
            Ok(settings)
        } else {
            Err(ConfigError::Invalid(report.errors))
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CapabilitySettings {
    pub default: CapabilityVariant,
    /// Per-stage variant overrides keyed by stage name.
    pub overrides: BTreeMap<String, CapabilityVariant>,
    pub empty_output_valid: Vec<StageName>,
    pub live: DocumentOptions,
}

impl CapabilitySettings {
    pub fn variant_for(&self, stage: StageName) -> CapabilityVariant {
        self.overrides
            .get(stage.as_str())
            .copied()
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub retry: RetrySettings,
    pub soft_timeout_ms: u64,
    pub hard_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            soft_timeout_ms: 25 * 60 * 1_000,
            hard_timeout_ms: 30 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub visibility_timeout_ms: u64,
    pub nack_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 60 * 60 * 1_000,
            nack_delay_ms: 5_000,
        }
    }
}

impl BrokerConfig {
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            visibility_timeout: Duration::from_millis(self.visibility_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub model: Option<String>,
    pub usd_per_1k_tokens: f64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            model: None,
            usd_per_1k_tokens: 0.0,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn validate_settings(settings: &Settings) -> ValidationReport {
    let mut report = ValidationReport::default();

    if settings.version != 1 {
        report
            .errors
            .push(format!("Unsupported settings version: {}", settings.version));
    }

    if settings.workers == 0 {
        report
            .errors
            .push("At least one worker is required".into());
    }

    for name in settings.capabilities.overrides.keys() {
        if let Err(err) = name.parse::<StageName>() {
            report.errors.push(format!("Capability override: {err}"));
        }
    }

    if settings.capabilities.live.max_document_bytes == 0 {
        report
            .errors
            .push("capabilities.live.max_document_bytes must be positive".into());
    }

    let retry = &settings.pipeline.retry;
    if retry.max_attempts == 0 {
        report
            .errors
            .push("pipeline.retry.max_attempts must be at least 1".into());
    }
    if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
        report
            .errors
            .push("pipeline.retry.multiplier must be a finite value >= 1.0".into());
    }
    if retry.initial_backoff_ms > retry.max_backoff_ms {
        report.warnings.push(format!(
            "pipeline.retry.initial_backoff_ms ({}) exceeds max_backoff_ms ({}); backoff will be capped",
            retry.initial_backoff_ms, retry.max_backoff_ms
        ));
    }

    let pipeline = &settings.pipeline;
    if pipeline.hard_timeout_ms == 0 {
        report
            .errors
            .push("pipeline.hard_timeout_ms must be positive".into());
    }
    if pipeline.soft_timeout_ms >= pipeline.hard_timeout_ms {
        report.warnings.push(format!(
            "pipeline.soft_timeout_ms ({}) is not below hard_timeout_ms ({}); soft warnings will never fire",
            pipeline.soft_timeout_ms, pipeline.hard_timeout_ms
        ));
    }

    let stage_budget = pipeline.hard_timeout_ms;
    if settings.broker.visibility_timeout_ms == 0 {
        report
            .errors
            .push("broker.visibility_timeout_ms must be positive".into());
    } else if settings.broker.visibility_timeout_ms <= stage_budget {
        report.warnings.push(format!(
            "broker.visibility_timeout_ms ({}) does not exceed one stage attempt's hard timeout ({} ms); a stalled worker holds its job until the lease lapses",
            settings.broker.visibility_timeout_ms, stage_budget
        ));
    }

    if settings.metrics.usd_per_1k_tokens < 0.0 {
        report
            .errors
            .push("metrics.usd_per_1k_tokens cannot be negative".into());
    }

    if let Some(path) = &settings.store.path
        && path.as_os_str().is_empty()
    {
        report.errors.push("store.path cannot be empty".into());
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_takes_defaults() {
        let settings = Settings::from_yaml("{}").unwrap();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.pipeline.retry.max_attempts, 3);
        assert_eq!(settings.pipeline.hard_timeout_ms, 30 * 60 * 1_000);
        assert_eq!(
            settings.capabilities.variant_for(StageName::Verification),
            CapabilityVariant::Stub
        );
    }

    #[test]
    fn overrides_select_per_stage_variant() {
        let settings = Settings::from_yaml(
            "capabilities:\n  default: stub\n  overrides:\n    risk_assessment: live\n",
        )
        .unwrap();
        assert_eq!(
            settings.capabilities.variant_for(StageName::RiskAssessment),
            CapabilityVariant::Live
        );
        assert_eq!(
            settings.capabilities.variant_for(StageName::FinancialAnalysis),
            CapabilityVariant::Stub
        );
    }
}
