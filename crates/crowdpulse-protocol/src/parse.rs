//! Parsing of JSON bodies exchanged with the worker and the peer.
//!
//! Event bodies are read leniently: a missing or ill-typed field reads as
//! an empty string and the caller decides validity through `is_valid()`.
//! This keeps a single validation rule per event type instead of two
//! (schema + content).

use std::collections::{BTreeMap, HashMap};

use crowdpulse_core::{
    AnalyticsEvent, Credentials, DiagnosticEvent, DiagnosticLevel, PeerInfo,
    ANALYTICS_CAPABILITY_KEY,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Errors produced while parsing wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Body is not a JSON object
    #[error("expected a JSON object: {0}")]
    NotAnObject(String),

    /// Peer response lacked a usable `url`
    #[error("can't extract port from server url {0:?}")]
    NoPort(String),
}

/// Reads a string field, treating absent or non-string values as empty.
fn string_field(json: &Value, key: &str) -> String {
    json.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_value(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

/// Parses a `/plugin/sendDiagEvent` body: `{level?, caption, description}`.
pub fn parse_diagnostic_event(body: &[u8]) -> DiagnosticEvent {
    let json = parse_value(body);
    DiagnosticEvent {
        level: DiagnosticLevel::from_name(&string_field(&json, "level")),
        caption: string_field(&json, "caption"),
        description: string_field(&json, "description"),
    }
}

/// Parses a `/device/{id}/sendEvent` body:
/// `{type, caption?, description?, attributes?: {string: string}}`.
///
/// Attributes with empty or non-string values are dropped.
pub fn parse_analytics_event(body: &[u8]) -> AnalyticsEvent {
    let json = parse_value(body);

    let attributes: BTreeMap<String, String> = json
        .get("attributes")
        .and_then(Value::as_object)
        .map(|items| {
            items
                .iter()
                .filter_map(|(key, value)| {
                    value
                        .as_str()
                        .filter(|v| !v.is_empty())
                        .map(|v| (key.clone(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    AnalyticsEvent {
        event_type: string_field(&json, "type"),
        caption: string_field(&json, "caption"),
        description: string_field(&json, "description"),
        attributes,
    }
}

/// Parses a `/plugin/token` body: `{user, token}`.
///
/// Fails only when the body is not a JSON object; empty fields are left
/// for `Credentials::is_valid` to reject.
pub fn parse_credentials(body: &[u8]) -> Result<Credentials, ParseError> {
    let json: Value =
        serde_json::from_slice(body).map_err(|e| ParseError::NotAnObject(e.to_string()))?;
    if !json.is_object() {
        return Err(ParseError::NotAnObject(json.to_string()));
    }
    Ok(Credentials {
        user: string_field(&json, "user"),
        token: string_field(&json, "token"),
    })
}

/// Peer response to `GET /rest/v3/servers/this` (only the parts we use).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawServerInfo {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub parameters: RawServerParameters,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawServerParameters {
    #[serde(default)]
    pub analytics_taxonomy_descriptors: RawTaxonomyDescriptors,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTaxonomyDescriptors {
    #[serde(default)]
    pub plugin_descriptors: HashMap<String, Value>,
}

impl RawServerInfo {
    /// Extracts the peer port from `url`.
    ///
    /// Accepts bare `host:port` the way user-typed URLs are accepted, and
    /// falls back to the scheme's default port.
    pub fn port(&self) -> Option<u16> {
        let url = Url::parse(&self.url)
            .ok()
            .filter(|u| u.has_host())
            .or_else(|| Url::parse(&format!("http://{}", self.url)).ok())?;
        if url.host_str().map_or(true, str::is_empty) {
            return None;
        }
        url.port_or_known_default()
    }

    pub fn capability_present(&self) -> bool {
        self.parameters
            .analytics_taxonomy_descriptors
            .plugin_descriptors
            .contains_key(ANALYTICS_CAPABILITY_KEY)
    }
}

/// Parses the peer's server description into `PeerInfo`.
pub fn parse_server_info(body: &[u8]) -> Result<PeerInfo, ParseError> {
    let raw: RawServerInfo =
        serde_json::from_slice(body).map_err(|e| ParseError::NotAnObject(e.to_string()))?;
    let port = raw.port().ok_or_else(|| ParseError::NoPort(raw.url.clone()))?;
    Ok(PeerInfo::new(port, raw.capability_present()))
}
