/// Step tree model
///
/// A flow version's trigger is the root of a tree of steps. Every step can chain forward
/// through `nextAction`; routers, legacy branches and loops additionally own nested
/// sub-trees. Settings of the kinds that migrations reshape are typed records, everything
/// else is carried through as raw JSON so a decode/encode cycle never drops data.

use serde::{de::DeserializeOwned, Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// One node of a flow version's step tree
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "StepRecord")]
pub struct Step {
    /// Unique step name within the flow version (e.g. "step_1", "trigger")
    pub name: String,
    /// Human-readable label shown in the builder
    pub display_name: String,
    /// Whether the builder considered the step complete when it was saved
    pub valid: bool,
    /// Kind discriminant plus kind-specific settings and children
    pub body: StepBody,
    /// Next sequential step, present on every kind
    pub next_action: Option<Box<Step>>,
    /// Top-level fields this model does not interpret
    pub extra: Map<String, Value>,
}

/// Kind-specific payload of a step
///
/// Adding a variant here is a compile error in `flow::traverse` until the traversal
/// engine learns how to walk it.
#[derive(Debug, Clone, PartialEq)]
pub enum StepBody {
    Empty {
        settings: Value,
    },
    Code {
        settings: CodeSettings,
    },
    Piece {
        settings: PieceSettings,
    },
    PieceTrigger {
        settings: PieceSettings,
    },
    LoopOnItems {
        settings: LoopSettings,
        first_loop_action: Option<Box<Step>>,
    },
    Router {
        settings: RouterSettings,
        /// One slot per declared branch; `None` is an empty branch
        children: Vec<Option<Step>>,
    },
    /// Legacy two-way branch, superseded by `Router`
    Branch {
        settings: BranchSettings,
        on_success_action: Option<Box<Step>>,
        on_failure_action: Option<Box<Step>>,
    },
    Webhook {
        settings: Value,
    },
    Missing {
        settings: Value,
    },
    /// A kind this build does not know about yet
    Unknown {
        kind: String,
        settings: Value,
    },
}

/// Copyable discriminant of [`StepBody`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Empty,
    Code,
    Piece,
    PieceTrigger,
    LoopOnItems,
    Router,
    Branch,
    Webhook,
    Missing,
    Unknown,
}

impl StepKind {
    /// Wire name of the kind; `None` for [`StepKind::Unknown`]
    pub fn wire_name(self) -> Option<&'static str> {
        match self {
            StepKind::Empty => Some("EMPTY"),
            StepKind::Code => Some("CODE"),
            StepKind::Piece => Some("PIECE"),
            StepKind::PieceTrigger => Some("PIECE_TRIGGER"),
            StepKind::LoopOnItems => Some("LOOP_ON_ITEMS"),
            StepKind::Router => Some("ROUTER"),
            StepKind::Branch => Some("BRANCH"),
            StepKind::Webhook => Some("WEBHOOK"),
            StepKind::Missing => Some("MISSING"),
            StepKind::Unknown => None,
        }
    }
}

impl StepBody {
    pub fn kind(&self) -> StepKind {
        match self {
            StepBody::Empty { .. } => StepKind::Empty,
            StepBody::Code { .. } => StepKind::Code,
            StepBody::Piece { .. } => StepKind::Piece,
            StepBody::PieceTrigger { .. } => StepKind::PieceTrigger,
            StepBody::LoopOnItems { .. } => StepKind::LoopOnItems,
            StepBody::Router { .. } => StepKind::Router,
            StepBody::Branch { .. } => StepKind::Branch,
            StepBody::Webhook { .. } => StepKind::Webhook,
            StepBody::Missing { .. } => StepKind::Missing,
            StepBody::Unknown { .. } => StepKind::Unknown,
        }
    }

    /// The `type` string written to JSON
    pub fn kind_name(&self) -> &str {
        match self {
            StepBody::Unknown { kind, .. } => kind,
            other => other.kind().wire_name().unwrap_or_default(),
        }
    }
}

impl Step {
    /// Build a step with no successor and no extra fields
    pub fn new(name: impl Into<String>, body: StepBody) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            valid: true,
            body,
            next_action: None,
            extra: Map::new(),
        }
    }

    /// Builder-style helper to chain a successor
    pub fn then(mut self, next: Step) -> Self {
        self.next_action = Some(Box::new(next));
        self
    }

    pub fn kind(&self) -> StepKind {
        self.body.kind()
    }

    /// Piece settings for `PIECE` and `PIECE_TRIGGER` steps
    pub fn piece_settings(&self) -> Option<&PieceSettings> {
        match &self.body {
            StepBody::Piece { settings } | StepBody::PieceTrigger { settings } => Some(settings),
            _ => None,
        }
    }

    pub fn piece_settings_mut(&mut self) -> Option<&mut PieceSettings> {
        match &mut self.body {
            StepBody::Piece { settings } | StepBody::PieceTrigger { settings } => Some(settings),
            _ => None,
        }
    }
}

/// Settings of a `CODE` step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSettings {
    /// Id of the zipped source artifact in the file store (pre-inline layout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_source_id: Option<String>,
    /// Inlined source code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<SourceCode>,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling_options: Option<ErrorHandlingOptions>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCode {
    pub code: String,
    pub package_json: String,
}

/// Settings of `PIECE` and `PIECE_TRIGGER` steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceSettings {
    /// Package name of the piece (e.g. "@activepieces/piece-slack")
    pub piece_name: String,
    /// Version (or range) of the piece the step was authored against
    pub piece_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_name: Option<String>,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling_options: Option<ErrorHandlingOptions>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-step failure policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandlingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_failure: Option<Toggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on_failure: Option<Toggle>,
}

impl ErrorHandlingOptions {
    /// Both policies switched off
    pub fn disabled() -> Self {
        Self {
            continue_on_failure: Some(Toggle { value: false }),
            retry_on_failure: Some(Toggle { value: false }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toggle {
    pub value: bool,
}

/// Settings of a `LOOP_ON_ITEMS` step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSettings {
    /// Expression producing the items to iterate
    #[serde(default)]
    pub items: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Settings of a `ROUTER` step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterSettings {
    #[serde(default)]
    pub branches: Vec<RouterBranch>,
    #[serde(default = "default_execution_type")]
    pub execution_type: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub const EXECUTE_FIRST_MATCH: &str = "EXECUTE_FIRST_MATCH";

fn default_execution_type() -> String {
    EXECUTE_FIRST_MATCH.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterBranch {
    pub branch_name: String,
    pub branch_type: BranchType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchType {
    Condition,
    Fallback,
}

/// Settings of a legacy `BRANCH` step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchSettings {
    #[serde(default)]
    pub conditions: Vec<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Wire shape of a step, decoded before the kind is interpreted
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepRecord {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    display_name: String,
    #[serde(default = "default_valid")]
    valid: bool,
    #[serde(default)]
    settings: Value,
    #[serde(default)]
    next_action: Option<Box<Step>>,
    #[serde(default)]
    first_loop_action: Option<Box<Step>>,
    #[serde(default)]
    on_success_action: Option<Box<Step>>,
    #[serde(default)]
    on_failure_action: Option<Box<Step>>,
    #[serde(default)]
    children: Option<Vec<Option<Step>>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn default_valid() -> bool {
    true
}

fn typed_settings<T: DeserializeOwned>(kind: &str, settings: Value) -> Result<T, String> {
    let settings = match settings {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(settings).map_err(|e| format!("invalid {} settings: {}", kind, e))
}

/// Keep a structural field the kind does not own so it survives a round trip
fn stash<T: Serialize>(
    extra: &mut Map<String, Value>,
    key: &str,
    field: Option<T>,
) -> Result<(), String> {
    if let Some(field) = field {
        let value = serde_json::to_value(field).map_err(|e| e.to_string())?;
        extra.insert(key.to_string(), value);
    }
    Ok(())
}

impl TryFrom<StepRecord> for Step {
    type Error = String;

    fn try_from(mut record: StepRecord) -> Result<Self, Self::Error> {
        let settings = std::mem::take(&mut record.settings);
        let kind = record.kind.as_str();
        let body = match kind {
            "EMPTY" => StepBody::Empty { settings },
            "CODE" => StepBody::Code { settings: typed_settings(kind, settings)? },
            "PIECE" => StepBody::Piece { settings: typed_settings(kind, settings)? },
            "PIECE_TRIGGER" => StepBody::PieceTrigger { settings: typed_settings(kind, settings)? },
            "LOOP_ON_ITEMS" => StepBody::LoopOnItems {
                settings: typed_settings(kind, settings)?,
                first_loop_action: record.first_loop_action.take(),
            },
            "ROUTER" => StepBody::Router {
                settings: typed_settings(kind, settings)?,
                children: record.children.take().unwrap_or_default(),
            },
            "BRANCH" => StepBody::Branch {
                settings: typed_settings(kind, settings)?,
                on_success_action: record.on_success_action.take(),
                on_failure_action: record.on_failure_action.take(),
            },
            "WEBHOOK" => StepBody::Webhook { settings },
            "MISSING" => StepBody::Missing { settings },
            _ => StepBody::Unknown { kind: record.kind.clone(), settings },
        };

        let mut extra = record.extra;
        stash(&mut extra, "firstLoopAction", record.first_loop_action)?;
        stash(&mut extra, "onSuccessAction", record.on_success_action)?;
        stash(&mut extra, "onFailureAction", record.on_failure_action)?;
        stash(&mut extra, "children", record.children)?;

        Ok(Step {
            name: record.name,
            display_name: record.display_name,
            valid: record.valid,
            body,
            next_action: record.next_action,
            extra,
        })
    }
}

/// Borrowed view of a step used for encoding without cloning sub-trees
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StepRecordRef<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    display_name: &'a str,
    valid: bool,
    #[serde(skip_serializing_if = "SettingsRef::is_absent")]
    settings: SettingsRef<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_loop_action: Option<&'a Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    on_success_action: Option<&'a Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    on_failure_action: Option<&'a Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    children: Option<&'a [Option<Step>]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_action: Option<&'a Step>,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum SettingsRef<'a> {
    Code(&'a CodeSettings),
    Piece(&'a PieceSettings),
    Loop(&'a LoopSettings),
    Router(&'a RouterSettings),
    Branch(&'a BranchSettings),
    Raw(&'a Value),
}

impl SettingsRef<'_> {
    fn is_absent(&self) -> bool {
        matches!(self, SettingsRef::Raw(Value::Null))
    }
}

static NO_SETTINGS: Value = Value::Null;

impl Serialize for Step {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut record = StepRecordRef {
            name: &self.name,
            kind: self.body.kind_name(),
            display_name: &self.display_name,
            valid: self.valid,
            settings: SettingsRef::Raw(&NO_SETTINGS),
            first_loop_action: None,
            on_success_action: None,
            on_failure_action: None,
            children: None,
            next_action: self.next_action.as_deref(),
            extra: &self.extra,
        };

        match &self.body {
            StepBody::Empty { settings }
            | StepBody::Webhook { settings }
            | StepBody::Missing { settings }
            | StepBody::Unknown { settings, .. } => record.settings = SettingsRef::Raw(settings),
            StepBody::Code { settings } => record.settings = SettingsRef::Code(settings),
            StepBody::Piece { settings } | StepBody::PieceTrigger { settings } => {
                record.settings = SettingsRef::Piece(settings)
            }
            StepBody::LoopOnItems { settings, first_loop_action } => {
                record.settings = SettingsRef::Loop(settings);
                record.first_loop_action = first_loop_action.as_deref();
            }
            StepBody::Router { settings, children } => {
                record.settings = SettingsRef::Router(settings);
                record.children = Some(children.as_slice());
            }
            StepBody::Branch { settings, on_success_action, on_failure_action } => {
                record.settings = SettingsRef::Branch(settings);
                record.on_success_action = on_success_action.as_deref();
                record.on_failure_action = on_failure_action.as_deref();
            }
        }

        record.serialize(serializer)
    }
}
