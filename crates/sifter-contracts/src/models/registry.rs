use indexmap::IndexMap;

/// Capability tags understood by the selector.
pub const CAPABILITY_DETECT: &str = "detect";
pub const CAPABILITY_CHAT: &str = "chat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    /// Longest image edge the model is sent; stills are downscaled past it.
    pub max_image_dim: Option<u32>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn by_provider(&self, provider: &str, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.provider == provider && model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, capabilities: &[&str], max_image_dim: Option<u32>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                max_image_dim,
            },
        );
    };

    insert(
        "gemini-2.0-flash",
        "gemini",
        &[CAPABILITY_DETECT, CAPABILITY_CHAT],
        Some(3072),
    );
    insert(
        "gemini-2.5-flash",
        "gemini",
        &[CAPABILITY_DETECT, CAPABILITY_CHAT],
        Some(3072),
    );
    insert(
        "gemini-2.5-pro",
        "gemini",
        &[CAPABILITY_DETECT, CAPABILITY_CHAT],
        Some(3072),
    );
    insert(
        "gpt-4o-mini",
        "openai",
        &[CAPABILITY_DETECT, CAPABILITY_CHAT],
        Some(2048),
    );
    insert(
        "gpt-4.1-mini",
        "openai",
        &[CAPABILITY_DETECT, CAPABILITY_CHAT],
        Some(2048),
    );
    insert(
        "dryrun-detect-1",
        "dryrun",
        &[CAPABILITY_DETECT, CAPABILITY_CHAT],
        None,
    );

    map
}
