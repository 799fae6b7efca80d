use std::collections::HashMap;
use std::path::Path;
use std::{env, fs};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use zeroize::Zeroize;

// server.config property names.
pub const TARGET_SERVER: &str = "targetServer";
pub const AUTH_TOKEN: &str = "authToken";
pub const SOURCES: &str = "sources";
pub const SEND_PINGS: &str = "sendPings";
pub const FAIL_ON_CONNECTION_ERROR: &str = "failOnConnectionError";
pub const TCP_PROBE_PORT: &str = "tcpProbePort";
pub const FIXED_RECONNECT_SECRET: &str = "reconnectSecret";
pub const CONNECT_KW_ARGS: &str = "connectKWArgs";
pub const DISABLE_SSL_VERIFICATION: &str = "disableSslVerification";

/// Environment variable consulted when `authToken` is absent from the file.
pub const CONNECTOR_AUTH_TOKEN_VAR: &str = "CONNECTOR_AUTH_TOKEN";

pub const TCP_PROBE_PORT_DEFAULT: u16 = 8000;

const CONFIG_SEARCH_PATHS: [&str; 2] = ["serverConfig/server.config", "server.config"];
const WEBSOCKET_V1_PATH: &str = "/api/v1/wsock/websocket";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no server.config file found")]
    Missing,

    #[error("invalid connector configuration: {0}")]
    Invalid(String),
}

/// The connector configuration, loaded from a `server.config` properties file.
///
/// Each source connection keeps its own snapshot, so the struct stays `Clone`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server URL, already normalized to its WebSocket form.
    pub target_server: String,
    /// Access token used for the `validate` handshake.
    pub auth_token: Option<String>,
    /// Source names this process connects on behalf of, in file order.
    pub sources: Vec<String>,
    /// Send periodic keepalive pings while a session is up.
    pub send_pings: bool,
    /// Treat the first reconnect-loop failure as fatal.
    pub fail_on_connection_error: bool,
    /// TCP port for the health probe listener.
    pub tcp_probe_port: u16,
    /// Fixed suffix for the reconnect secret; a fresh UUID is used when absent.
    pub fixed_reconnect_secret: Option<String>,
    /// Skip peer-certificate verification on the socket and document client.
    pub disable_ssl_verification: bool,
}

impl ServerConfig {
    /// Loads the configuration from the standard search paths
    /// (`serverConfig/server.config`, then `server.config`).
    pub fn load() -> Result<Self, ConfigError> {
        for path in CONFIG_SEARCH_PATHS {
            if Path::new(path).exists() {
                return Self::load_from(path);
            }
            warn!(path, "failed to open config file");
        }
        Err(ConfigError::Missing)
    }

    /// Loads the configuration from an explicit properties file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::Invalid(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_properties(parse_properties(&text))
    }

    /// Builds a validated configuration from raw key/value properties.
    pub fn from_properties(mut props: HashMap<String, String>) -> Result<Self, ConfigError> {
        let raw_target = props.remove(TARGET_SERVER).ok_or_else(|| {
            ConfigError::Invalid(format!("required property {TARGET_SERVER} is absent"))
        })?;
        let target_server = normalize_ws_url(&raw_target)?;

        // The file's authToken wins over the environment variable.
        let auth_token = props
            .remove(AUTH_TOKEN)
            .or_else(|| env::var(CONNECTOR_AUTH_TOKEN_VAR).ok());

        let sources = props
            .remove(SOURCES)
            .map(|raw| split_sources(&raw))
            .unwrap_or_default();

        let send_pings = props.get(SEND_PINGS).is_some_and(|v| boolean_value(v));
        let fail_on_connection_error = props
            .get(FAIL_ON_CONNECTION_ERROR)
            .is_some_and(|v| boolean_value(v));

        let tcp_probe_port = match props.remove(TCP_PROBE_PORT) {
            Some(raw) => raw.parse().map_err(|e| {
                ConfigError::Invalid(format!("{TCP_PROBE_PORT} is not a port number: {e}"))
            })?,
            None => TCP_PROBE_PORT_DEFAULT,
        };

        let fixed_reconnect_secret = props.remove(FIXED_RECONNECT_SECRET);

        let mut disable_ssl_verification = false;
        if let Some(raw) = props.remove(CONNECT_KW_ARGS) {
            let parsed: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                ConfigError::Invalid(format!(
                    "{CONNECT_KW_ARGS} did not contain a valid JSON string: {e}"
                ))
            })?;
            let entries = parsed.as_object().ok_or_else(|| {
                ConfigError::Invalid(format!("{CONNECT_KW_ARGS} must be a JSON object"))
            })?;
            for (key, value) in entries {
                if key == DISABLE_SSL_VERIFICATION {
                    disable_ssl_verification = json_boolean_value(value);
                } else {
                    // No portable transport equivalent; see DESIGN.md.
                    warn!(option = %key, "unsupported connectKWArgs entry ignored");
                }
            }
        }

        Ok(ServerConfig {
            target_server,
            auth_token,
            sources,
            send_pings,
            fail_on_connection_error,
            tcp_probe_port,
            fixed_reconnect_secret,
            disable_ssl_verification,
        })
    }
}

impl Zeroize for ServerConfig {
    fn zeroize(&mut self) {
        self.auth_token.zeroize();
    }
}

impl Drop for ServerConfig {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Rewrites an HTTP(S) server URL to its WebSocket form with the canonical
/// API path. Already-normalized URLs pass through unchanged.
pub fn normalize_ws_url(raw: &str) -> Result<String, ConfigError> {
    let mut url =
        Url::parse(raw).map_err(|e| ConfigError::Invalid(format!("bad server URL {raw}: {e}")))?;

    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => other,
    }
    .to_string();
    if scheme != url.scheme() && url.set_scheme(&scheme).is_err() {
        return Err(ConfigError::Invalid(format!(
            "cannot rewrite scheme of server URL {raw}"
        )));
    }

    if !is_socket_path(url.path()) {
        url.set_path(WEBSOCKET_V1_PATH);
    }

    let clean = String::from(url);
    debug!(configured = raw, normalized = %clean, "server URL normalized");
    Ok(clean)
}

/// Derives the HTTP base URL (scheme + authority) from a normalized
/// WebSocket URL, for the document store client.
pub fn http_url_from_ws(ws_url: &str) -> Result<String, ConfigError> {
    let url = Url::parse(ws_url)
        .map_err(|e| ConfigError::Invalid(format!("bad server URL {ws_url}: {e}")))?;
    let scheme = match url.scheme() {
        "wss" => "https",
        "ws" => "http",
        other => other,
    };
    let host = url
        .host_str()
        .ok_or_else(|| ConfigError::Invalid(format!("server URL {ws_url} has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}

fn is_socket_path(path: &str) -> bool {
    path.rfind("/api/v")
        .map(|i| &path[i + "/api/v".len()..])
        .and_then(|rest| rest.strip_suffix("/wsock/websocket"))
        .map(|version| !version.is_empty() && version.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Case notwithstanding, `yes`, `true`, `t`, and `1` are true; everything
/// else is false.
pub fn boolean_value(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "yes" | "true" | "t" | "1"
    )
}

/// Boolean-ish reading of a JSON value: real booleans pass through, strings
/// go through [`boolean_value`], anything else is false.
pub fn json_boolean_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => boolean_value(s),
        _ => false,
    }
}

fn split_sources(raw: &str) -> Vec<String> {
    raw.replace(' ', "")
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn normalize_rewrites_http_schemes() {
        let ws = normalize_ws_url("http://localhost:8080").unwrap();
        assert_eq!(ws, "ws://localhost:8080/api/v1/wsock/websocket");

        let wss = normalize_ws_url("https://example.com/some/other/path").unwrap();
        assert_eq!(wss, "wss://example.com/api/v1/wsock/websocket");
    }

    #[test]
    fn normalize_keeps_versioned_socket_path() {
        let ws = normalize_ws_url("https://example.com/api/v2/wsock/websocket").unwrap();
        assert_eq!(ws, "wss://example.com/api/v2/wsock/websocket");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_ws_url("http://h:9/x").unwrap();
        let twice = normalize_ws_url(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn http_url_reverses_ws_scheme() {
        assert_eq!(
            http_url_from_ws("wss://example.com/api/v1/wsock/websocket").unwrap(),
            "https://example.com"
        );
        assert_eq!(
            http_url_from_ws("ws://localhost:8080/api/v1/wsock/websocket").unwrap(),
            "http://localhost:8080"
        );
    }

    #[test]
    fn boolean_values() {
        for truthy in ["yes", "True", "t", "1", "TRUE"] {
            assert!(boolean_value(truthy), "{truthy} should be true");
        }
        for falsy in ["no", "false", "0", "", "maybe"] {
            assert!(!boolean_value(falsy), "{falsy} should be false");
        }
    }

    #[test]
    fn properties_parsing_skips_comments() {
        let props = parse_properties("# comment\ntargetServer=http://h:9\n\nsources = a, b\n");
        assert_eq!(props["targetServer"], "http://h:9");
        assert_eq!(props["sources"], "a, b");
        assert_eq!(props.len(), 2);
    }

    #[test]
    fn from_properties_builds_full_config() {
        let mut props = HashMap::new();
        props.insert(TARGET_SERVER.to_string(), "http://h:9/x".to_string());
        props.insert(AUTH_TOKEN.to_string(), "T".to_string());
        props.insert(SOURCES.to_string(), "S1, S2,S1".to_string());
        props.insert(TCP_PROBE_PORT.to_string(), "9000".to_string());
        props.insert(FIXED_RECONNECT_SECRET.to_string(), "fixed".to_string());
        props.insert(SEND_PINGS.to_string(), "True".to_string());

        let config = ServerConfig::from_properties(props).unwrap();
        assert_eq!(config.target_server, "ws://h:9/api/v1/wsock/websocket");
        assert_eq!(config.auth_token.as_deref(), Some("T"));
        // Order preserved, duplicates kept.
        assert_eq!(config.sources, vec!["S1", "S2", "S1"]);
        assert_eq!(config.tcp_probe_port, 9000);
        assert_eq!(config.fixed_reconnect_secret.as_deref(), Some("fixed"));
        assert!(config.send_pings);
        assert!(!config.fail_on_connection_error);
    }

    #[test]
    fn missing_target_server_is_invalid() {
        let err = ServerConfig::from_properties(HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn connect_kw_args_controls_ssl_verification() {
        let mut props = HashMap::new();
        props.insert(TARGET_SERVER.to_string(), "http://h:9".to_string());
        props.insert(
            CONNECT_KW_ARGS.to_string(),
            r#"{"disableSslVerification": true, "somethingElse": 3}"#.to_string(),
        );
        let config = ServerConfig::from_properties(props).unwrap();
        assert!(config.disable_ssl_verification);
    }

    #[test]
    fn bad_connect_kw_args_is_invalid() {
        let mut props = HashMap::new();
        props.insert(TARGET_SERVER.to_string(), "http://h:9".to_string());
        props.insert(CONNECT_KW_ARGS.to_string(), "not json".to_string());
        assert!(matches!(
            ServerConfig::from_properties(props),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn load_from_reads_properties_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "targetServer=http://h:9/x").unwrap();
        writeln!(file, "authToken=T").unwrap();
        writeln!(file, "sources=S").unwrap();
        let config = ServerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.sources, vec!["S"]);
        assert_eq!(config.auth_token.as_deref(), Some("T"));
    }
}
