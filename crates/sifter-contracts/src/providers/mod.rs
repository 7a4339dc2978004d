/// Ordered set of providers addressed by name.
#[derive(Debug, Clone)]
pub struct ProviderRegistry<T: NamedProvider> {
    providers: Vec<T>,
}

pub trait NamedProvider {
    fn name(&self) -> &str;
}

impl<T: NamedProvider + ?Sized> NamedProvider for Box<T> {
    fn name(&self) -> &str {
        self.as_ref().name()
    }
}

impl<T: NamedProvider> Default for ProviderRegistry<T> {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
        }
    }
}

impl<T: NamedProvider> ProviderRegistry<T> {
    pub fn new(providers: Vec<T>) -> Self {
        Self { providers }
    }

    /// Adds a provider, replacing any existing one with the same name.
    pub fn register(&mut self, provider: T) {
        if let Some(slot) = self
            .providers
            .iter_mut()
            .find(|existing| existing.name() == provider.name())
        {
            *slot = provider;
            return;
        }
        self.providers.push(provider);
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.providers
            .iter()
            .find(|provider| provider.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names = self
            .providers
            .iter()
            .map(|provider| provider.name().to_string())
            .collect::<Vec<String>>();
        names.sort();
        names
    }

    pub fn providers(&self) -> &[T] {
        self.providers.as_slice()
    }
}
