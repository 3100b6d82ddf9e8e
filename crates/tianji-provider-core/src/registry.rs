use std::collections::HashMap;
use std::sync::Arc;

use crate::Provider;

/// Name -> provider lookup. Populated once at startup; read-only after.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.providers.keys().cloned().collect();
        out.sort();
        out
    }
}

/// Split `vendor/model` on the first slash. Without a slash the provider
/// part is empty and the caller resolves through the deployment table.
pub fn parse_model_name(name: &str) -> (&str, &str) {
    match name.split_once('/') {
        Some((provider, model)) => (provider, model),
        None => ("", name),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_model_name;

    #[test]
    fn splits_on_first_slash_only() {
        assert_eq!(
            parse_model_name("bedrock/anthropic.claude-3/sonnet"),
            ("bedrock", "anthropic.claude-3/sonnet")
        );
        assert_eq!(parse_model_name("gpt-4o"), ("", "gpt-4o"));
    }
}
