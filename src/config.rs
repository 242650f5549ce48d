//! Configuration loading (spec.md §6 config surface; ambient per `SPEC_FULL.md`).
//!
//! TOML is the sole config source; no environment variable overrides. A
//! `Raw*` family mirrors the TOML shape with `Option<T>` everywhere, then
//! `Config::from_raw` fills in defaults and validates into the fully
//! populated, `Option`-free public types below — the same split
//! `services/forwarder/src/config.rs` uses.

use crate::error::{ConfigError, SchemaError};
use crate::schema::{RawPdu, Schema, SensorMeta};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Public, validated config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub schema: Schema,
    pub client: ClientConfig,
    pub emulation: EmulationConfig,
    pub server: ServerConfig,
    pub restful: RestfulConfig,
    pub sockets_io: Vec<SocketIoConfig>,
}

#[derive(Debug, Clone)]
pub enum ClientConfig {
    /// Listens for inbound connections (spec.md §4.3 variant a); resolved
    /// against `examples/original_source/src/protocol_factory.py`'s
    /// `create_server` call.
    Socket { host: String, port: u16 },
    /// Connects outbound to a fixed TCP peer (spec.md §4.3 variant b).
    Tcp { host: String, port: u16 },
    Xbee { com: String, baud: u32, mac: String },
}

#[derive(Debug, Clone)]
pub struct EmulationConfig {
    pub enable: bool,
    pub interval_ms: u64,
    /// `sensor_name -> expression source` (spec.md §4.8; evaluated by
    /// `emulator::expr`, never `eval`).
    pub expressions: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    pub database: String,
    pub verbose: bool,
    pub commit_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RestfulConfig {
    pub url: String,
    pub port: u16,
    pub keep_alive: bool,
}

#[derive(Debug, Clone)]
pub struct SocketIoConfig {
    pub name: String,
    pub url: String,
    pub namespace: String,
    pub interval_ms: u64,
    pub retries: u32,
    pub retry_interval_ms: u64,
    /// Supplemented feature (SPEC_FULL.md): passed through verbatim to the
    /// transport-level connect call, never validated or refreshed here.
    pub auth_header: Option<String>,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema: Option<RawSchema>,
    client: Option<RawClient>,
    emulation: Option<RawEmulation>,
    server: Option<RawServer>,
    restful: Option<RawRestful>,
    sockets_io: Option<HashMap<String, RawSocketIo>>,
    sensors: Option<HashMap<String, RawSensor>>,
}

#[derive(Debug, Deserialize)]
struct RawSchema {
    start_byte: Option<u8>,
    pdu: Option<HashMap<String, RawPduConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawPduConfig {
    id: Option<u8>,
    fields: Option<Vec<RawField>>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    name: Option<String>,
    c_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawClient {
    socket: Option<RawSocket>,
    tcp: Option<RawSocket>,
    xbee: Option<RawXbee>,
}

#[derive(Debug, Deserialize)]
struct RawSocket {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawXbee {
    com: Option<String>,
    baud: Option<u32>,
    mac: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEmulation {
    enable: Option<bool>,
    interval: Option<u64>,
    modules: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    ip: Option<String>,
    port: Option<u16>,
    database: Option<String>,
    verbose: Option<bool>,
    commit_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawRestful {
    url: Option<String>,
    port: Option<u16>,
    keep_alive: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawSocketIo {
    url: Option<String>,
    namespace: Option<String>,
    interval: Option<u64>,
    retries: Option<u32>,
    retry_interval: Option<u64>,
    auth_header: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSensor {
    enable: Option<bool>,
    group: Option<String>,
    min: Option<f64>,
    max: Option<f64>,
    on_dash: Option<bool>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl Config {
    /// Load and validate config from a file path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_str = std::fs::read_to_string(path)?;
        Self::from_str(&toml_str)
    }

    /// Parse and validate config from a TOML string.
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(toml_str)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let raw_schema = raw.schema.ok_or(ConfigError::MissingKey("schema"))?;
        let start_byte = raw_schema.start_byte.unwrap_or(0x01);

        let sensors: HashMap<String, SensorMeta> = raw
            .sensors
            .unwrap_or_default()
            .into_iter()
            .map(|(name, s)| {
                (
                    name,
                    SensorMeta {
                        group: s.group.unwrap_or_else(|| "default".to_owned()),
                        min: s.min.unwrap_or(f64::MIN),
                        max: s.max.unwrap_or(f64::MAX),
                        on_dash: s.on_dash.unwrap_or(true),
                        enable: s.enable.unwrap_or(true),
                    },
                )
            })
            .collect();

        let raw_pdus = raw_schema
            .pdu
            .ok_or(ConfigError::MissingKey("schema.pdu"))?;

        // Owned storage so `RawPdu` (which borrows `&str`) can reference it.
        let mut pdu_names = Vec::with_capacity(raw_pdus.len());
        let mut pdu_ids = Vec::with_capacity(raw_pdus.len());
        let mut pdu_fields: Vec<Vec<(String, String)>> = Vec::with_capacity(raw_pdus.len());

        for (name, pdu) in &raw_pdus {
            let id = pdu
                .id
                .ok_or_else(|| ConfigError::Schema(SchemaError::EmptyPdu(name.clone())))?;
            let fields = pdu.fields.as_deref().unwrap_or(&[]);
            let mut owned_fields = Vec::with_capacity(fields.len() + 1);
            owned_fields.push(("valid_bitfield".to_owned(), "u32".to_owned()));
            for f in fields {
                let field_name = f
                    .name
                    .clone()
                    .ok_or_else(|| ConfigError::Schema(SchemaError::EmptyPdu(name.clone())))?;
                let c_type = f
                    .c_type
                    .clone()
                    .ok_or_else(|| ConfigError::Schema(SchemaError::EmptyPdu(name.clone())))?;
                owned_fields.push((field_name, c_type));
            }
            pdu_names.push(name.clone());
            pdu_ids.push(id);
            pdu_fields.push(owned_fields);
        }

        let field_refs: Vec<Vec<(&str, &str)>> = pdu_fields
            .iter()
            .map(|fields| fields.iter().map(|(n, t)| (n.as_str(), t.as_str())).collect())
            .collect();

        let raw_pdu_refs: Vec<RawPdu<'_>> = pdu_names
            .iter()
            .zip(pdu_ids.iter())
            .zip(field_refs.iter())
            .map(|((name, id), fields)| RawPdu {
                name,
                pdu_id: *id,
                fields: fields.as_slice(),
            })
            .collect();

        let schema = Schema::build(start_byte, &raw_pdu_refs, sensors)?;

        let raw_client = raw.client.ok_or(ConfigError::MissingKey("client"))?;
        let client = if let Some(socket) = raw_client.socket {
            ClientConfig::Socket {
                host: socket.host.ok_or(ConfigError::MissingKey("client.socket.host"))?,
                port: socket.port.ok_or(ConfigError::MissingKey("client.socket.port"))?,
            }
        } else if let Some(tcp) = raw_client.tcp {
            ClientConfig::Tcp {
                host: tcp.host.ok_or(ConfigError::MissingKey("client.tcp.host"))?,
                port: tcp.port.ok_or(ConfigError::MissingKey("client.tcp.port"))?,
            }
        } else if let Some(xbee) = raw_client.xbee {
            ClientConfig::Xbee {
                com: xbee.com.ok_or(ConfigError::MissingKey("client.xbee.com"))?,
                baud: xbee.baud.unwrap_or(9600),
                mac: xbee.mac.ok_or(ConfigError::MissingKey("client.xbee.mac"))?,
            }
        } else {
            return Err(ConfigError::MissingKey("client.socket|client.tcp|client.xbee"));
        };

        let emulation = match raw.emulation {
            Some(e) => EmulationConfig {
                enable: e.enable.unwrap_or(false),
                interval_ms: e.interval.unwrap_or(1000),
                expressions: e.modules.unwrap_or_default(),
            },
            None => EmulationConfig {
                enable: false,
                interval_ms: 1000,
                expressions: HashMap::new(),
            },
        };

        let raw_server = raw.server.ok_or(ConfigError::MissingKey("server"))?;
        let server = ServerConfig {
            ip: raw_server.ip.unwrap_or_else(|| "0.0.0.0".to_owned()),
            port: raw_server.port.ok_or(ConfigError::MissingKey("server.port"))?,
            database: raw_server
                .database
                .ok_or(ConfigError::MissingKey("server.database"))?,
            verbose: raw_server.verbose.unwrap_or(false),
            commit_interval_ms: raw_server.commit_interval_ms.unwrap_or(5000),
        };

        let restful = match raw.restful {
            Some(r) => RestfulConfig {
                url: r.url.unwrap_or_else(|| "0.0.0.0".to_owned()),
                port: r.port.ok_or(ConfigError::MissingKey("restful.port"))?,
                keep_alive: r.keep_alive.unwrap_or(true),
            },
            None => return Err(ConfigError::MissingKey("restful")),
        };

        let sockets_io = raw
            .sockets_io
            .unwrap_or_default()
            .into_iter()
            .map(|(name, s)| {
                Ok(SocketIoConfig {
                    name: name.clone(),
                    url: s.url.ok_or(ConfigError::MissingKey("sockets_io.<srv>.url"))?,
                    namespace: s.namespace.unwrap_or_else(|| "/".to_owned()),
                    interval_ms: s.interval.unwrap_or(1000),
                    retries: s.retries.unwrap_or(5),
                    retry_interval_ms: s.retry_interval.unwrap_or(2000),
                    auth_header: s.auth_header,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Config {
            schema,
            client,
            emulation,
            server,
            restful,
            sockets_io,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [schema]
        start_byte = 1

        [schema.pdu.CORE]
        id = 0
        fields = [
            { name = "rpm", c_type = "u16" },
            { name = "water", c_type = "u16" },
        ]

        [sensors.rpm]
        group = "core"

        [sensors.water]
        group = "core"

        [client.socket]
        host = "0.0.0.0"
        port = 9000

        [server]
        port = 8080
        database = "telemetry.sqlite3"

        [restful]
        port = 8000
    "#;

    #[test]
    fn loads_minimal_config() {
        let config = Config::from_str(MINIMAL).unwrap();
        assert_eq!(config.schema.start_byte(), 1);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.restful.port, 8000);
        match config.client {
            ClientConfig::Socket { port, .. } => assert_eq!(port, 9000),
            other => panic!("expected socket client, got {other:?}"),
        }
        assert!(!config.emulation.enable);
    }

    #[test]
    fn loads_tcp_client() {
        let toml_str = MINIMAL.replace(
            "[client.socket]\n        host = \"0.0.0.0\"\n        port = 9000",
            "[client.tcp]\n        host = \"10.0.0.1\"\n        port = 7000",
        );
        let config = Config::from_str(&toml_str).unwrap();
        match config.client {
            ClientConfig::Tcp { host, port } => {
                assert_eq!(host, "10.0.0.1");
                assert_eq!(port, 7000);
            }
            other => panic!("expected tcp client, got {other:?}"),
        }
    }

    #[test]
    fn missing_schema_is_an_error() {
        let err = Config::from_str("[server]\nport = 1\ndatabase = \"x\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("schema")));
    }

    #[test]
    fn missing_client_selector_is_an_error() {
        let toml_str = MINIMAL.replace("[client.socket]", "[client.nothing]");
        let err = Config::from_str(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(_)));
    }

    #[test]
    fn xbee_client_defaults_baud_rate() {
        let toml_str = MINIMAL.replace(
            "[client.socket]\n        host = \"0.0.0.0\"\n        port = 9000",
            "[client.xbee]\n        com = \"/dev/ttyUSB0\"\n        mac = \"0013A20012345678\"",
        );
        let config = Config::from_str(&toml_str).unwrap();
        match config.client {
            ClientConfig::Xbee { baud, .. } => assert_eq!(baud, 9600),
            other => panic!("expected xbee client, got {other:?}"),
        }
    }
}
