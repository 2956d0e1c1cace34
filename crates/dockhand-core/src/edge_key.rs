//! Edge key decoding.
//!
//! The bootstrap token handed to an edge agent is the standard base64
//! encoding of five `|` separated fields:
//!
//! ```text
//! controller_url|tunnel_server_addr|tunnel_server_fingerprint|endpoint_id|credentials
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{ConfigError, ConfigResult};

/// Material needed to poll the controller and open reverse tunnels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeKey {
    pub controller_url: String,
    pub endpoint_id: String,
    pub tunnel_server_address: String,
    pub tunnel_server_fingerprint: String,
    pub tunnel_credentials: String,
}

impl EdgeKey {
    /// Decode a base64 edge key.
    pub fn decode(encoded: &str) -> ConfigResult<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ConfigError::InvalidEdgeKey(format!("not valid base64: {e}")))?;
        let text = String::from_utf8(raw)
            .map_err(|_| ConfigError::InvalidEdgeKey("not valid UTF-8".to_string()))?;

        let fields: Vec<&str> = text.split('|').collect();
        let [url, tunnel_addr, fingerprint, endpoint_id, credentials] = fields.as_slice() else {
            return Err(ConfigError::InvalidEdgeKey(format!(
                "expected 5 fields, found {}",
                fields.len()
            )));
        };

        if url.is_empty() || tunnel_addr.is_empty() || endpoint_id.is_empty() {
            return Err(ConfigError::InvalidEdgeKey(
                "controller URL, tunnel server and endpoint ID are required".to_string(),
            ));
        }

        Ok(EdgeKey {
            controller_url: url.trim_end_matches('/').to_string(),
            endpoint_id: endpoint_id.to_string(),
            tunnel_server_address: tunnel_addr.to_string(),
            tunnel_server_fingerprint: fingerprint.to_string(),
            tunnel_credentials: credentials.to_string(),
        })
    }

    /// Encode back into the bootstrap form.
    pub fn encode(&self) -> String {
        STANDARD.encode(format!(
            "{}|{}|{}|{}|{}",
            self.controller_url,
            self.tunnel_server_address,
            self.tunnel_server_fingerprint,
            self.endpoint_id,
            self.tunnel_credentials
        ))
    }

    /// URL of this endpoint's status resource on the controller.
    pub fn status_url(&self) -> String {
        format!(
            "{}/api/endpoints/{}/status",
            self.controller_url, self.endpoint_id
        )
    }
}
