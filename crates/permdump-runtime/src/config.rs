use std::path::Path;

use permdump_protocol::DEFAULT_CLIENT_IDENTIFIER_HEADER;
use serde::{Deserialize, Serialize};

use crate::{RuntimeError, RuntimeResult};

/// Option names understood by [`RecorderConfig::set_option`]. The `vs_*`
/// aliases are the names used by the mitmproxy addon this tool replaces.
const CAPTURE_KEYS: [&str; 2] = ["capture-output-path", "vs_dump_flows"];
const TABULAR_KEYS: [&str; 2] = ["tabular-output-path", "vs_dump_csv"];
const DUPLICATES_KEYS: [&str; 2] = ["show-duplicates", "vs_duplicates"];
const CLIENT_HEADER_KEYS: [&str; 1] = ["client-identifier-header"];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct RecorderConfig {
    pub capture_output_path: String,
    pub tabular_output_path: String,
    pub show_duplicates: bool,
    pub client_identifier_header: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            capture_output_path: String::new(),
            tabular_output_path: String::new(),
            show_duplicates: false,
            client_identifier_header: DEFAULT_CLIENT_IDENTIFIER_HEADER.to_string(),
        }
    }
}

impl RecorderConfig {
    pub fn capture_path(&self) -> Option<&Path> {
        non_empty_path(&self.capture_output_path)
    }

    pub fn tabular_path(&self) -> Option<&Path> {
        non_empty_path(&self.tabular_output_path)
    }

    /// Applies a single `key=value` style option.
    pub fn set_option(&mut self, key: &str, value: &str) -> RuntimeResult<()> {
        let key = key.trim();
        let value = value.trim();
        if CAPTURE_KEYS.contains(&key) {
            self.capture_output_path = value.to_string();
        } else if TABULAR_KEYS.contains(&key) {
            self.tabular_output_path = value.to_string();
        } else if DUPLICATES_KEYS.contains(&key) {
            self.show_duplicates = parse_bool(key, value)?;
        } else if CLIENT_HEADER_KEYS.contains(&key) {
            if value.is_empty() {
                return Err(RuntimeError::InvalidOption(format!(
                    "{key} must not be empty"
                )));
            }
            self.client_identifier_header = value.to_string();
        } else {
            return Err(RuntimeError::InvalidOption(format!("unknown option {key}")));
        }
        Ok(())
    }

    /// Parses `key=value` and applies it.
    pub fn apply_assignment(&mut self, assignment: &str) -> RuntimeResult<()> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            RuntimeError::InvalidOption(format!("expected key=value, got {assignment}"))
        })?;
        self.set_option(key, value)
    }
}

fn non_empty_path(raw: &str) -> Option<&Path> {
    if raw.trim().is_empty() {
        None
    } else {
        Some(Path::new(raw))
    }
}

fn parse_bool(key: &str, value: &str) -> RuntimeResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(RuntimeError::InvalidOption(format!(
            "{key} expects a boolean, got {value}"
        ))),
    }
}
