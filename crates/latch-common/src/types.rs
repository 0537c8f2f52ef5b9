use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A protected endpoint and the authorization service that controls it.
///
/// The pair `(auth_service_id, resource_id)` is the stable identity; the
/// server host fields are lookup keys for the knock transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub auth_service_id: String,
    pub resource_id: String,
    #[serde(default)]
    pub server_hostname: String,
    pub server_ip: String,
    pub server_port: u16,
}

impl Resource {
    /// Stable identity of the resource.
    pub fn id(&self) -> String {
        format!("{}/{}", self.auth_service_id, self.resource_id)
    }

    /// The `host:port` string to knock at. The hostname wins over the IP
    /// when both are configured.
    pub fn server_addr(&self) -> String {
        let host = if self.server_hostname.is_empty() {
            self.server_ip.as_str()
        } else {
            self.server_hostname.as_str()
        };
        if self.server_port == 0 {
            host.to_string()
        } else {
            format!("{host}:{}", self.server_port)
        }
    }
}

/// Result of a knock transaction, parsed from the decrypted JSON payload.
///
/// The server emits the host list under either `resourceHost` or the short
/// `resHost`; both spellings are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnockAck {
    #[serde(rename = "errCode", default)]
    pub err_code: String,
    #[serde(rename = "errMsg", default)]
    pub err_msg: String,
    #[serde(rename = "openTime", default)]
    pub open_time: u64,
    #[serde(rename = "resourceHost", alias = "resHost", default)]
    pub resource_host: Vec<String>,
}

impl KnockAck {
    /// `errCode` of `"0"` means the server granted access.
    pub fn granted(&self) -> bool {
        self.err_code == "0"
    }
}

/// The identity presented with every knock request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnockIdentity {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub device_id: String,
    /// Posture-check results forwarded verbatim to the server.
    #[serde(default)]
    pub check_results: HashMap<String, serde_json::Value>,
}
