/// Flow version documents and schema versions

use crate::flow::{step::Step, traverse::visit};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// A persisted, versioned workflow definition
///
/// The trigger is the single root of the step tree. `schema_version` is stamped by the
/// migration runner only; `backup_files` maps a schema version to the file holding the
/// snapshot taken while the document was at that version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowVersion {
    pub id: String,
    pub flow_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub backup_files: BTreeMap<String, String>,
    #[serde(default)]
    pub connection_ids: Vec<String>,
}

impl FlowVersion {
    /// Parsed schema stamp; `Ok(None)` when the document was never stamped
    pub fn parsed_schema_version(&self) -> Result<Option<SchemaVersion>, ParseSchemaVersionError> {
        self.schema_version.as_deref().map(str::parse).transpose()
    }

    /// Names of the app connections referenced by piece steps, sorted and deduplicated
    ///
    /// A connection is referenced through the `auth` input of a piece step, written as
    /// `{{connections['<name>']}}`.
    pub fn referenced_connections(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        visit(self.trigger.as_ref(), &mut |step| {
            let auth = step
                .piece_settings()
                .and_then(|settings| settings.input.get("auth"))
                .and_then(|auth| auth.as_str());
            if let Some(name) = auth.and_then(connection_name) {
                names.insert(name.to_string());
            }
        });
        names.into_iter().collect()
    }
}

fn connection_name(expression: &str) -> Option<&str> {
    let inner = expression
        .trim()
        .strip_prefix("{{")?
        .strip_suffix("}}")?
        .trim()
        .strip_prefix("connections[")?
        .strip_suffix(']')?;
    let name = inner
        .strip_prefix('\'')
        .and_then(|n| n.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|n| n.strip_suffix('"')))?;
    (!name.is_empty()).then_some(name)
}

/// Monotonic step-schema version, stored as a decimal string
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion(u32);

impl SchemaVersion {
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// The version immediately below this one, if any
    pub fn previous(self) -> Option<SchemaVersion> {
        self.0.checked_sub(1).map(SchemaVersion)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid schema version '{0}'")]
pub struct ParseSchemaVersionError(pub String);

impl FromStr for SchemaVersion {
    type Err = ParseSchemaVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(SchemaVersion)
            .map_err(|_| ParseSchemaVersionError(s.to_string()))
    }
}

/// Deepest JSON nesting accepted in a stored document
///
/// Decoding, walking and re-encoding a step tree all recurse once per level, so the bound
/// has to hold on a default-sized worker thread stack.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Decode a JSON document nested up to [`MAX_NESTING_DEPTH`] levels
///
/// Long `nextAction` chains nest one object per step, past serde_json's default limit of
/// 128. Deeper documents are rejected before decoding starts.
pub fn decode_json<T: serde::de::DeserializeOwned>(json: &str) -> serde_json::Result<T> {
    if exceeds_depth(json, MAX_NESTING_DEPTH) {
        return Err(serde::de::Error::custom(format!(
            "document nests deeper than {} levels",
            MAX_NESTING_DEPTH
        )));
    }

    let mut deserializer = serde_json::Deserializer::from_str(json);
    deserializer.disable_recursion_limit();
    let value = T::deserialize(&mut deserializer)?;
    deserializer.end()?;
    Ok(value)
}

/// Whether objects and arrays in `json` nest deeper than `limit`
fn exceeds_depth(json: &str, limit: usize) -> bool {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for byte in json.bytes() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                if depth > limit {
                    return true;
                }
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    false
}
