//! # Config File Loading
//!
//! Reads the declarative JSON/JSONC config, strips comments, validates the
//! schema and splits connections into valid and invalid entries.

use crate::schema::{AppConfig, ConnectionConfig, SearchContextConfig, Settings, SyncConfig};
use errors::ConfigValidationError;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;
use validator::Validate;

static KEY_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new("^[a-zA-Z0-9_-]+$"));

/// Top-level shape before per-entity validation. Unknown keys (for example
/// `$schema` or `models`) are ignored.
#[derive(Debug, Deserialize)]
struct RawSyncConfig {
    #[serde(default)]
    settings: Option<Settings>,
    #[serde(default)]
    connections: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    contexts: Option<BTreeMap<String, SearchContextConfig>>,
    #[serde(default)]
    apps: Option<Vec<AppConfig>>
}

/// Replaces `//` and `/* */` comments with whitespace, leaving string
/// literals untouched. Newlines inside comments are kept so parse errors still
/// point at the right line.
pub fn strip_json_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                chars.next();
                out.push_str("  ");
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                    out.push(if next == '\t' { '\t' } else { ' ' });
                }
            }
            ('/', Some('*')) => {
                chars.next();
                out.push_str("  ");
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        out.push(' ');
                        break;
                    }
                    out.push(if next == '\n' { '\n' } else { ' ' });
                    prev = next;
                }
            }
            _ => out.push(c)
        }
    }

    out
}

/// Parse and validate config text.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Turns JSONC text into a [`SyncConfig`].
///
/// ## Error Handling
/// Structural problems (bad JSON, invalid settings, invalid contexts or apps)
/// fail the whole load with [`ConfigValidationError`] so the caller can abort
/// the sync run before mutating anything. A single malformed connection is
/// recorded in `invalid_connections` instead.
pub fn parse_config(text: &str, origin: &str) -> Result<SyncConfig, ConfigValidationError> {
    let stripped = strip_json_comments(text);
    let raw: RawSyncConfig =
        serde_json::from_str(&stripped).map_err(|e| ConfigValidationError::Parse {
            path: origin.to_string(),
            reason: e.to_string()
        })?;

    let key_pattern = KEY_PATTERN
        .as_ref()
        .map_err(|e| ConfigValidationError::Schema {
            reason: e.to_string()
        })?;

    let settings = raw.settings.unwrap_or_default();
    settings
        .validate()
        .map_err(|e| ConfigValidationError::Schema {
            reason: format!("settings: {e}")
        })?;

    if let Some(contexts) = &raw.contexts {
        for (name, context) in contexts {
            if !key_pattern.is_match(name) {
                return Err(ConfigValidationError::Schema {
                    reason: format!("invalid search context name '{name}'")
                });
            }
            context
                .validate()
                .map_err(|e| ConfigValidationError::Schema {
                    reason: format!("contexts.{name}: {e}")
                })?;
        }
    }

    let apps = raw.apps.unwrap_or_default();
    for app in &apps {
        let AppConfig::Github(github) = app;
        github
            .validate()
            .map_err(|e| ConfigValidationError::Schema {
                reason: format!("apps.{}: {e}", github.id)
            })?;
    }

    let mut connections = BTreeMap::new();
    let mut invalid_connections = BTreeMap::new();
    for (name, value) in raw.connections.unwrap_or_default() {
        match parse_connection(&name, value, key_pattern) {
            Ok(connection) => {
                connections.insert(name, connection);
            }
            Err(e) => {
                warn!(connection = %name, error = %e, "Skipping invalid connection config");
                invalid_connections.insert(name, e.to_string());
            }
        }
    }

    Ok(SyncConfig {
        settings,
        connections,
        invalid_connections,
        contexts: raw.contexts,
        apps
    })
}

fn parse_connection(
    name: &str,
    value: serde_json::Value,
    key_pattern: &Regex
) -> Result<ConnectionConfig, ConfigValidationError> {
    let invalid = |reason: String| ConfigValidationError::InvalidConnection {
        name: name.to_string(),
        reason
    };

    if !key_pattern.is_match(name) {
        return Err(invalid("name must match ^[a-zA-Z0-9_-]+$".to_string()));
    }

    let connection: ConnectionConfig =
        serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
    connection.validate().map_err(|e| invalid(e.to_string()))?;
    Ok(connection)
}

/// Load configuration from a file on disk.
pub async fn load_config(path: &Path) -> Result<SyncConfig, ConfigValidationError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigValidationError::Io {
            path: path.display().to_string(),
            reason: e.to_string()
        })?;
    parse_config(&text, &path.display().to_string())
}
