//! Provider registry.
//!
//! Built once from configuration and immutable afterwards. A provider is
//! enabled iff its config block is present, not explicitly disabled, and
//! carries a non-empty API key after environment interpolation. The
//! registry never probes providers at startup; reachability is the health
//! endpoint's concern.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{GatewayConfig, KNOWN_PROVIDERS};

#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    /// Native model names this provider serves, in configuration order.
    pub models: Vec<String>,
    pub timeout: Duration,
    pub extra_headers: HashMap<String, String>,
}

impl ProviderDescriptor {
    pub fn supports(&self, native_model: &str) -> bool {
        self.models.iter().any(|m| m == native_model)
    }
}

#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<ProviderDescriptor>>,
    /// Enabled provider names in configuration order.
    order: Vec<String>,
}

impl ProviderRegistry {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut providers = HashMap::new();
        let mut order = Vec::new();

        for (name, pc) in &config.providers {
            if !pc.enabled {
                tracing::debug!(provider = %name, "provider disabled by config");
                continue;
            }
            if pc.api_key.is_empty() {
                tracing::debug!(provider = %name, "provider has no API key, skipping");
                continue;
            }

            let base_url = match pc.base_url.clone().or_else(|| default_base_url(name)) {
                Some(url) => url.trim_end_matches('/').to_string(),
                None => {
                    tracing::warn!(
                        provider = %name,
                        "unknown provider without base_url, skipping"
                    );
                    continue;
                }
            };

            let descriptor = ProviderDescriptor {
                name: name.clone(),
                base_url,
                api_key: pc.api_key.clone(),
                models: pc.models.clone(),
                timeout: Duration::from_secs(pc.timeout),
                extra_headers: pc.extra_headers.clone().unwrap_or_default(),
            };

            tracing::info!(
                provider = %name,
                base_url = %descriptor.base_url,
                models = descriptor.models.len(),
                "provider enabled"
            );
            providers.insert(name.clone(), Arc::new(descriptor));
            order.push(name.clone());
        }

        Self { providers, order }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderDescriptor>> {
        self.providers.get(name).cloned()
    }

    /// All enabled providers in configuration order.
    pub fn list(&self) -> Vec<Arc<ProviderDescriptor>> {
        self.order
            .iter()
            .filter_map(|name| self.providers.get(name).cloned())
            .collect()
    }

    pub fn supports(&self, provider: &str, native_model: &str) -> bool {
        self.providers
            .get(provider)
            .is_some_and(|p| p.supports(native_model))
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

fn default_base_url(name: &str) -> Option<String> {
    KNOWN_PROVIDERS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, url)| (*url).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn registry_from(yaml: &str) -> ProviderRegistry {
        ProviderRegistry::from_config(&GatewayConfig::from_yaml(yaml).unwrap())
    }

    #[test]
    fn keyless_and_disabled_providers_are_not_enabled() {
        let registry = registry_from(
            r#"
providers:
  groq:
    api_key: gsk-1
    models: [llama-3.1-70b-versatile]
  together:
    api_key: ""
    models: [x]
  cerebras:
    enabled: false
    api_key: ck-1
    models: [y]
"#,
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get("groq").is_some());
        assert!(registry.get("together").is_none());
        assert!(registry.get("cerebras").is_none());
    }

    #[test]
    fn list_preserves_configuration_order() {
        let registry = registry_from(
            r#"
providers:
  together:
    api_key: tk
    models: [a]
  groq:
    api_key: gk
    models: [b]
"#,
        );
        let names: Vec<String> = registry.list().iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, ["together", "groq"]);
    }

    #[test]
    fn known_providers_get_default_base_urls() {
        let registry = registry_from("providers:\n  groq:\n    api_key: gk\n");
        assert_eq!(
            registry.get("groq").unwrap().base_url,
            "https://api.groq.com/openai/v1"
        );
    }

    #[test]
    fn unknown_provider_requires_base_url() {
        let registry = registry_from(
            r#"
providers:
  local:
    api_key: none-needed
    models: [m]
"#,
        );
        assert!(registry.get("local").is_none());

        let registry = registry_from(
            r#"
providers:
  local:
    api_key: none-needed
    base_url: http://localhost:8000/v1/
    models: [m]
"#,
        );
        assert_eq!(registry.get("local").unwrap().base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn supports_checks_native_model_membership() {
        let registry = registry_from(
            "providers:\n  groq:\n    api_key: gk\n    models: [a, b]\n",
        );
        assert!(registry.supports("groq", "a"));
        assert!(!registry.supports("groq", "c"));
        assert!(!registry.supports("missing", "a"));
    }
}
