//! `GatewayConfig` (spec §6 "Environment & CLI"). Grounded on `flux::logging::LoggingConfig`
//! for the serde/`serdeconv` loading convention the teacher uses for its own config structs.

use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketType {
    Tcp,
    Udp,
    Wss,
    HttpLongPoll,
    Mqtt,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttConfig {
    pub broker_url: String,
    pub raw_topic_template: String,
    pub action_topic_template: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    pub name: String,
    pub listen_addr: String,
    pub socket_type: SocketType,
    /// Address the control-plane gRPC server (`Bind`/`Conn`/`Group`/`Message`/`Slb`, spec §4.8)
    /// binds to; separate from `listen_addr`, which is the client-facing transport socket.
    pub rpc_listen_addr: String,
    /// `None` disables reuse-addr (default off, matching the teacher's socket2 usage).
    #[serde(default)]
    pub reuse_addr: bool,
    #[serde(with = "duration_secs")]
    pub keepalive: Duration,
    #[serde(with = "duration_secs")]
    pub tick_interval: Duration,
    pub rsa_private_key_path: Option<String>,
    pub rsa_public_key_path: Option<String>,
    #[serde(with = "duration_secs")]
    pub handshake_secret_ttl: Duration,
    /// `true` writes symmetric-crypto ciphertext as base64 text on the wire instead of raw
    /// bytes, for transports (HTTP long-poll) that cannot carry arbitrary binary.
    #[serde(default)]
    pub encode_on_wire: bool,
    pub default_data_format: String,
    /// Hint passed to the proxy-protocol stripper about the expected preamble's declared
    /// address family; informational only, stripping itself is preamble-driven.
    pub proxy_socket_type_hint: Option<String>,
    pub mqtt: Option<MqttConfig>,
}

impl GatewayConfig {
    pub fn from_toml_file(path: &str) -> Result<GatewayConfig, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
