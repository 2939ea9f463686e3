use std::sync::Arc;
use std::time::Duration;

use agent_provider::{ChatProvider, ProviderInitError};
use agent_provider_llm_api::{LlmApiProvider, LlmApiProviderConfig};
use agent_provider_mock::{MockProvider, MOCK_PROVIDER_ID};
use llm_api::Backend;

use crate::config::ProviderSection;

pub const DEFAULT_PROVIDER_ID: &str = MOCK_PROVIDER_ID;

/// Every id accepted by [`provider_for`].
pub const PROVIDER_IDS: &[&str] = &[MOCK_PROVIDER_ID, "openai", "anthropic", "gemini", "ollama"];

/// Builds the provider named `provider_id`. `model` overrides the configured
/// model; API keys are read from the environment only.
pub fn provider_for(
    provider_id: &str,
    model: Option<&str>,
    settings: &ProviderSection,
) -> Result<Arc<dyn ChatProvider>, ProviderInitError> {
    let model = model
        .or(settings.model.as_deref())
        .map(str::trim)
        .filter(|model| !model.is_empty());

    if provider_id == MOCK_PROVIDER_ID {
        let provider = match model {
            Some(model) => MockProvider::new().with_model(model),
            None => MockProvider::new(),
        };
        return Ok(Arc::new(provider));
    }

    let backend = provider_id.parse::<Backend>().map_err(|_| {
        ProviderInitError::new(format!(
            "Unsupported provider '{provider_id}'. Available providers: {}",
            PROVIDER_IDS.join(", ")
        ))
    })?;

    let mut config = LlmApiProviderConfig::new(backend).with_streaming(settings.streaming);
    if let Some(model) = model {
        config = config.with_model(model);
    }
    if let Some(base_url) = settings.base_url.as_deref() {
        config = config.with_base_url(base_url);
    }
    if let Some(timeout) = settings.timeout_sec {
        config = config.with_timeout(Duration::from_secs(timeout));
    }
    config.max_tokens = settings.max_tokens;
    config.temperature = settings.temperature;
    if let Some(api_key) = api_key_from_env(backend) {
        config = config.with_api_key(api_key);
    }

    Ok(Arc::new(LlmApiProvider::new(config)?))
}

fn api_key_from_env(backend: Backend) -> Option<String> {
    backend
        .api_key_env_vars()
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_for_supports_mock_with_model_override() {
        let provider = provider_for("mock", Some("scripted"), &ProviderSection::default())
            .expect("mock provider should resolve");
        let profile = provider.profile();
        assert_eq!(profile.provider_id, "mock");
        assert_eq!(profile.model_id, "scripted");
    }

    #[test]
    fn provider_for_rejects_unknown_provider() {
        let error = match provider_for("custom", None, &ProviderSection::default()) {
            Ok(_) => panic!("unknown providers should fail"),
            Err(error) => error,
        };

        assert!(error.message().contains("Unsupported provider 'custom'"));
    }

    #[test]
    fn ollama_needs_no_api_key() {
        let provider = provider_for("ollama", Some("llama3.2"), &ProviderSection::default())
            .expect("ollama builds without credentials");
        assert_eq!(provider.profile().provider_id, "ollama");
        assert_eq!(provider.profile().model_id, "llama3.2");
    }
}
