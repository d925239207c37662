//! Frozen, non-secret snapshots of a connection and its provider and model,
//! captured when a response row is created. The archived view stays stable
//! even if the live connection is later mutated or deleted.

use chrono::{DateTime, Utc};
use eval_sql::connections::ConnectionInfo;
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionDetails {
    pub connection: ConnectionFields,
    pub provider: Option<ProviderFields>,
    pub model: Option<ModelFields>,
    pub captured_at: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionFields {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub base_url: Option<String>,
    pub port_no: Option<i32>,
    pub is_active: bool,
    pub connection_status: models::ConnectionState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProviderFields {
    pub id: i32,
    pub provider_type: Option<String>,
    pub provider_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelFields {
    pub id: i32,
    pub display_name: Option<String>,
    pub model_identifier: Option<String>,
}

/// Capture the snapshot for a connection id, or None when the connection is
/// gone or the catalog store errored. Capture failure must never fail the
/// parent operation, so errors degrade to a warning.
pub async fn capture(connection_id: i32, catalog: &sqlx::PgPool) -> Option<serde_json::Value> {
    let info = match eval_sql::connections::fetch_info(connection_id, catalog).await {
        Ok(Some(info)) => info,
        Ok(None) => {
            tracing::warn!(connection_id, "connection not found while capturing snapshot");
            return None;
        }
        Err(err) => {
            tracing::warn!(connection_id, ?err, "failed to capture connection snapshot");
            return None;
        }
    };

    let details = freeze(&info, Utc::now());
    match serde_json::to_value(&details) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(connection_id, ?err, "failed to serialize connection snapshot");
            None
        }
    }
}

/// Build the snapshot record from a joined connection row. The secret is
/// deliberately absent from the output type.
pub fn freeze(info: &ConnectionInfo, captured_at: DateTime<Utc>) -> ConnectionDetails {
    ConnectionDetails {
        connection: ConnectionFields {
            id: info.id,
            name: info.name.clone(),
            description: info.description.clone(),
            base_url: info.base_url.clone(),
            port_no: info.port_no,
            is_active: info.is_active,
            connection_status: info.connection_status,
            created_at: info.created_at,
        },
        provider: info.provider_id.map(|id| ProviderFields {
            id,
            provider_type: info.provider_type.clone(),
            provider_name: info.provider_name.clone(),
        }),
        model: info.model_id.map(|id| ModelFields {
            id,
            display_name: info.model_name.clone(),
            model_identifier: info.model_identifier.clone(),
        }),
        captured_at,
        version: SNAPSHOT_VERSION.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::ConnectionState;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            id: 12,
            name: "studio-ollama".to_string(),
            description: Some("workbench".to_string()),
            base_url: Some("http://studio.local".to_string()),
            port_no: Some(11434),
            api_key: Some("super-secret".to_string()),
            is_active: true,
            connection_status: ConnectionState::Connected,
            last_tested: None,
            created_at: Utc::now(),
            provider_id: Some(2),
            provider_type: Some("ollama".to_string()),
            provider_name: Some("Ollama".to_string()),
            model_id: None,
            model_name: None,
            model_identifier: None,
        }
    }

    #[test]
    fn secret_never_appears_in_snapshot() {
        let details = freeze(&info(), Utc::now());
        let json = serde_json::to_string(&details).unwrap();
        assert!(!json.contains("super-secret"));
        assert!(!json.contains("api_key"));
    }

    #[test]
    fn missing_model_yields_null_section() {
        let details = freeze(&info(), Utc::now());
        assert!(details.model.is_none());
        assert_eq!(details.provider.as_ref().unwrap().id, 2);
        assert_eq!(details.version, SNAPSHOT_VERSION);
    }
}
