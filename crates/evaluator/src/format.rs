//! Normalization of a connection record into the exact wire shape the
//! inference RPC expects. This module is the single source of truth for that
//! shape; historical misroutings traced back to callers composing it by hand.

use eval_sql::connections::ConnectionInfo;
use models::WireConfig;

const DEFAULT_PROVIDER: &str = "ollama";
const DEFAULT_BASE_URL: &str = "http://localhost";

/// Build the outbound provider config from a connection joined with its
/// provider and model. Never fails: missing fields substitute defaults, and
/// an unresolvable model name degrades to `"default"` with a warning.
///
/// Model-name resolution from a bare model id is the caller's concern (it
/// needs a catalog lookup); pass the resolved name via `resolved_model`.
pub fn format_wire_config(info: &ConnectionInfo, resolved_model: Option<&str>) -> WireConfig {
    let provider_type = info
        .provider_type
        .clone()
        .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());

    let base_url = info
        .base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

    let model_name = match resolved_model.or(info.model_name.as_deref()) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            tracing::warn!(
                connection_id = info.id,
                "connection has no resolvable model name, using 'default'"
            );
            "default".to_string()
        }
    };

    WireConfig {
        provider_type,
        base_url: compose_base_url(&base_url, info.port_no),
        model_name,
        api_key: info.api_key.clone().filter(|k| !k.is_empty()),
    }
}

/// Append `:port` to a base URL's host component unless a port is already
/// present, preserving any scheme and path.
pub fn compose_base_url(base_url: &str, port: Option<i32>) -> String {
    let base_url = if base_url.is_empty() {
        DEFAULT_BASE_URL
    } else {
        base_url
    };

    let Some(port) = port else {
        return base_url.to_string();
    };

    match base_url.split_once("://") {
        Some((scheme, rest)) => {
            let (host, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, ""),
            };
            if host.contains(':') {
                base_url.to_string()
            } else {
                format!("{scheme}://{host}:{port}{path}")
            }
        }
        // No scheme: a bare host, possibly already carrying a port.
        None => {
            if base_url.contains(':') {
                base_url.to_string()
            } else {
                format!("{base_url}:{port}")
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use models::ConnectionState;

    fn info(base_url: &str, port: Option<i32>) -> ConnectionInfo {
        ConnectionInfo {
            id: 7,
            name: "studio".to_string(),
            description: None,
            base_url: Some(base_url.to_string()),
            port_no: port,
            api_key: None,
            is_active: true,
            connection_status: ConnectionState::Unknown,
            last_tested: None,
            created_at: Utc::now(),
            provider_id: Some(1),
            provider_type: Some("ollama".to_string()),
            provider_name: Some("Ollama".to_string()),
            model_id: Some(3),
            model_name: Some("gemma3".to_string()),
            model_identifier: Some("gemma3:latest".to_string()),
        }
    }

    #[test]
    fn appends_port_after_host() {
        let config = format_wire_config(&info("http://studio.local", Some(11434)), None);
        assert_eq!(config.provider_type, "ollama");
        assert_eq!(config.base_url, "http://studio.local:11434");
        assert_eq!(config.model_name, "gemma3");
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn existing_port_is_preserved_verbatim() {
        assert_eq!(
            compose_base_url("http://studio.local:8080", Some(11434)),
            "http://studio.local:8080"
        );
        assert_eq!(
            compose_base_url("http://studio.local:11434", Some(11434)),
            "http://studio.local:11434"
        );
    }

    #[test]
    fn no_port_leaves_url_unchanged() {
        assert_eq!(
            compose_base_url("http://studio.local/v1", None),
            "http://studio.local/v1"
        );
    }

    #[test]
    fn path_survives_port_insertion() {
        assert_eq!(
            compose_base_url("http://studio.local/v1/api", Some(11434)),
            "http://studio.local:11434/v1/api"
        );
    }

    #[test]
    fn bare_host_gets_port() {
        assert_eq!(compose_base_url("studio.local", Some(11434)), "studio.local:11434");
        assert_eq!(compose_base_url("studio.local:9999", Some(11434)), "studio.local:9999");
    }

    #[test]
    fn missing_model_name_falls_back_to_default() {
        let mut info = info("http://studio.local", None);
        info.model_name = None;
        let config = format_wire_config(&info, None);
        assert_eq!(config.model_name, "default");
    }

    #[test]
    fn resolved_model_name_wins() {
        let mut info = info("http://studio.local", None);
        info.model_name = None;
        let config = format_wire_config(&info, Some("qwen3"));
        assert_eq!(config.model_name, "qwen3");
    }

    #[test]
    fn empty_api_key_is_dropped() {
        let mut info = info("http://studio.local", None);
        info.api_key = Some(String::new());
        assert_eq!(format_wire_config(&info, None).api_key, None);
    }
}
