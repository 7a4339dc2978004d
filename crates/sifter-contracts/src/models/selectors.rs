use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        self.select_from(requested, capability, self.registry.by_capability(capability))
    }

    /// Like [`ModelSelector::select`], restricted to one provider. A
    /// requested model from another provider falls back to that provider's
    /// first model for the capability.
    pub fn select_for_provider(
        &self,
        requested: Option<&str>,
        provider: &str,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        if let Some(requested_value) = requested {
            if let Some(model) = self.registry.ensure(requested_value, capability) {
                if model.provider != provider {
                    let candidates = self.registry.by_provider(provider, capability);
                    let Some(fallback) = candidates.first().cloned() else {
                        return Err(format!(
                            "No '{provider}' models available for capability '{capability}'."
                        ));
                    };
                    return Ok(ModelSelection {
                        model: fallback,
                        requested: Some(requested_value.to_string()),
                        fallback_reason: Some(format!(
                            "Requested model '{requested_value}' belongs to provider '{}', not '{provider}'.",
                            model.provider
                        )),
                    });
                }
            }
        }
        self.select_from(
            requested,
            capability,
            self.registry.by_provider(provider, capability),
        )
        .map_err(|_| format!("No '{provider}' models available for capability '{capability}'."))
    }

    fn select_from(
        &self,
        requested: Option<&str>,
        capability: &str,
        candidates: Vec<ModelSpec>,
    ) -> Result<ModelSelection, String> {
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = candidates
                .iter()
                .find(|model| model.name == requested_value)
                .cloned()
            {
                return Ok(ModelSelection {
                    model,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' unavailable for capability '{capability}'."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (Some("No model specified; using default.".to_string()), None)
        };

        let Some(model) = candidates.first().cloned() else {
            return Err(format!(
                "No models available for capability '{capability}'."
            ));
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }
}
