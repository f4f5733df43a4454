//! Events the worker pushes back to the host through the control API.
//!
//! Events are transient: built from a request body, validated, handed to
//! the host and dropped. Nothing here is persisted.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a plugin diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    #[default]
    Info,
    Warning,
    Error,
}

impl DiagnosticLevel {
    /// Parses a level name. Anything other than `warning`/`error` is `Info`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "error" => Self::Error,
            "warning" => Self::Warning,
            _ => Self::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plugin-level diagnostic shown to the operator by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub level: DiagnosticLevel,
    pub caption: String,
    pub description: String,
}

impl DiagnosticEvent {
    pub fn new(
        level: DiagnosticLevel,
        caption: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            level,
            caption: caption.into(),
            description: description.into(),
        }
    }

    pub fn warning(caption: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(DiagnosticLevel::Warning, caption, description)
    }

    pub fn error(caption: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(DiagnosticLevel::Error, caption, description)
    }

    /// Both caption and description are required.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.caption.is_empty() && !self.description.is_empty()
    }
}

/// A per-device analytics event (e.g. engagement crossed a threshold).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub caption: String,
    pub description: String,
    pub attributes: BTreeMap<String, String>,
}

impl AnalyticsEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = caption.into();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Only the type is required.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.event_type.is_empty()
    }
}
