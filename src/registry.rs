use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::capability::{Capability, CapabilityVariant};
use crate::error::RegistryError;
use crate::job::StageName;

#[derive(Clone)]
pub struct StageBinding {
    pub capability: Arc<dyn Capability>,
    pub empty_output_valid: bool,
}

/// Validated stage → capability table. Construction fails unless every
/// stage in [`StageName::ALL`] has a binding.
#[derive(Clone)]
pub struct CapabilityRegistry {
    bindings: BTreeMap<StageName, StageBinding>,
}

impl CapabilityRegistry {
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::default()
    }

    pub fn binding(&self, stage: StageName) -> &StageBinding {
        // `build` guarantees every stage is present.
        &self.bindings[&stage]
    }

    /// Stages paired with their bindings, in execution order.
    pub fn stages(&self) -> impl Iterator<Item = (StageName, &StageBinding)> {
        StageName::ALL
            .into_iter()
            .map(move |stage| (stage, self.binding(stage)))
    }

    /// "live", "stub" or "mixed" depending on how the stages are bound.
    pub fn variant_label(&self) -> &'static str {
        let variants: BTreeSet<&'static str> = self
            .bindings
            .values()
            .map(|binding| binding.capability.variant().as_str())
            .collect();
        match variants.len() {
            1 if variants.contains(CapabilityVariant::Live.as_str()) => "live",
            1 => "stub",
            _ => "mixed",
        }
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (stage, binding) in self.stages() {
            map.entry(
                &stage.as_str(),
                &format_args!(
                    "{}{}",
                    binding.capability.variant(),
                    if binding.empty_output_valid {
                        " (empty output allowed)"
                    } else {
                        ""
                    }
                ),
            );
        }
        map.finish()
    }
}

#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    bindings: BTreeMap<StageName, Arc<dyn Capability>>,
    empty_output_valid: BTreeSet<StageName>,
}

impl CapabilityRegistryBuilder {
    pub fn bind(mut self, stage: StageName, capability: Arc<dyn Capability>) -> Self {
        self.bindings.insert(stage, capability);
        self
    }

    pub fn allow_empty_output(mut self, stage: StageName) -> Self {
        self.empty_output_valid.insert(stage);
        self
    }

    pub fn build(mut self) -> Result<CapabilityRegistry, RegistryError> {
        let missing: Vec<StageName> = StageName::ALL
            .into_iter()
            .filter(|stage| !self.bindings.contains_key(stage))
            .collect();
        if !missing.is_empty() {
            return Err(RegistryError::MissingBindings(missing));
        }

        let bindings = StageName::ALL
            .into_iter()
            .filter_map(|stage| {
                self.bindings.remove(&stage).map(|capability| {
                    (
                        stage,
                        StageBinding {
                            capability,
                            empty_output_valid: self.empty_output_valid.contains(&stage),
                        },
                    )
                })
            })
            .collect();
        Ok(CapabilityRegistry { bindings })
    }
}
