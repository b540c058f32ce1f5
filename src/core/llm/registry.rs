use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const PROVIDERS_JSON: &str = include_str!("providers.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDef {
    pub id: String,
    pub name: String,
    pub base_url: String,
    /// Environment variable holding the key; `None` for keyless local servers.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub default_model: String,
    #[serde(default)]
    pub models: Vec<ModelDef>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDef {
    pub id: String,
    pub name: String,
}

impl ProviderRegistry {
    pub fn load() -> Result<Self> {
        serde_json::from_str(PROVIDERS_JSON)
            .map_err(|e| anyhow!("embedded providers.json is invalid: {}", e))
    }

    pub fn get_provider(&self, id: &str) -> Option<&ProviderDef> {
        let normalized = id.to_lowercase();
        self.providers
            .iter()
            .find(|p| p.id == normalized || p.name.to_lowercase() == normalized)
    }
}

impl ProviderDef {
    pub fn resolve_api_key(&self, inline: Option<&str>) -> Result<String> {
        if let Some(key) = inline
            && !key.is_empty()
        {
            return Ok(key.to_string());
        }
        match &self.api_key_env {
            None => Ok(String::new()),
            Some(var) => std::env::var(var).map_err(|_| {
                anyhow!(
                    "No API key for provider '{}'. Set {} or llm.api_key.",
                    self.id,
                    var
                )
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_registry_parses() {
        let registry = ProviderRegistry::load().unwrap();
        assert!(registry.providers.len() >= 5);
        let sf = registry.get_provider("SiliconFlow").unwrap();
        assert_eq!(sf.id, "siliconflow");
        assert_eq!(sf.default_model, "deepseek-ai/DeepSeek-V3.1-Terminus");
    }

    #[test]
    fn keyless_provider_resolves_empty_key() {
        let registry = ProviderRegistry::load().unwrap();
        let ollama = registry.get_provider("ollama").unwrap();
        assert_eq!(ollama.resolve_api_key(None).unwrap(), "");
    }

    #[test]
    fn inline_key_wins() {
        let registry = ProviderRegistry::load().unwrap();
        let openai = registry.get_provider("openai").unwrap();
        assert_eq!(openai.resolve_api_key(Some("sk-test")).unwrap(), "sk-test");
    }
}
