use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, StageError};
use crate::job::{JobId, StageName};
use crate::registry::CapabilityRegistry;
use crate::settings::CapabilitySettings;

mod document;

pub use document::{DocumentCapability, DocumentOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityVariant {
    Live,
    #[default]
    Stub,
}

impl CapabilityVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityVariant::Live => "live",
            CapabilityVariant::Stub => "stub",
        }
    }
}

impl FromStr for CapabilityVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "live" => Ok(CapabilityVariant::Live),
            "stub" => Ok(CapabilityVariant::Stub),
            other => Err(format!("Unknown capability variant '{other}'")),
        }
    }
}

impl fmt::Display for CapabilityVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PriorOutput {
    pub stage: StageName,
    pub output: String,
}

/// Input handed to a capability: the job's request plus everything earlier
/// stages produced, in stage order.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: JobId,
    pub input_ref: String,
    pub query: String,
    pub prior: Vec<PriorOutput>,
    pub attempt: u32,
}

impl StageContext {
    pub fn prior_output(&self, stage: StageName) -> Option<&str> {
        self.prior
            .iter()
            .find(|prior| prior.stage == stage)
            .map(|prior| prior.output.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutput {
    pub content: String,
    pub tokens_used: Option<u64>,
}

impl StageOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tokens_used: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn variant(&self) -> CapabilityVariant;

    async fn run(&self, stage: StageName, ctx: &StageContext) -> Result<StageOutput, StageError>;
}

/// Deterministic placeholder used when no live analysis is wanted.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubCapability;

#[async_trait]
impl Capability for StubCapability {
    fn variant(&self) -> CapabilityVariant {
        CapabilityVariant::Stub
    }

    async fn run(&self, stage: StageName, ctx: &StageContext) -> Result<StageOutput, StageError> {
        Ok(StageOutput::text(format!(
            "[stub] {stage} for query '{}' ({} prior section(s))",
            ctx.query,
            ctx.prior.len()
        )))
    }
}

/// Binds every stage to the variant the settings select for it.
pub fn build_registry(settings: &CapabilitySettings) -> Result<CapabilityRegistry, RegistryError> {
    let live: Arc<dyn Capability> = Arc::new(DocumentCapability::new(settings.live.clone()));
    let stub: Arc<dyn Capability> = Arc::new(StubCapability);

    let mut builder = CapabilityRegistry::builder();
    for stage in StageName::ALL {
        let capability = match settings.variant_for(stage) {
            CapabilityVariant::Live => Arc::clone(&live),
            CapabilityVariant::Stub => Arc::clone(&stub),
        };
        builder = builder.bind(stage, capability);
    }
    for stage in &settings.empty_output_valid {
        builder = builder.allow_empty_output(*stage);
    }
    builder.build()
}
