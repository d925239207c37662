use serde::{Deserialize, Serialize};

/// WireConfig is the exact provider configuration shape sent to the remote
/// inference service. This type is the single source of truth for that
/// shape: every outbound dispatch serializes one of these, and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireConfig {
    pub provider_type: String,
    pub base_url: String,
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn api_key_is_omitted_when_absent() {
        let config = WireConfig {
            provider_type: "ollama".to_string(),
            base_url: "http://studio.local:11434".to_string(),
            model_name: "gemma3".to_string(),
            api_key: None,
        };
        let value = serde_json::to_value(&config).unwrap();
        assert!(value.get("api_key").is_none());
        assert_eq!(value["provider_type"], "ollama");
    }
}
