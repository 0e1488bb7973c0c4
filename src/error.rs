/// Migration errors
///
/// Typed per-document failures and the coarse kinds they are reported under.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Why a single flow version could not be migrated
///
/// A migration error only ever aborts the document it was raised for; the runner logs
/// it, leaves the stored document untouched and moves on.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// The stored document could not be decoded into a step tree
    #[error("flow version {flow_version_id} is malformed: {reason}")]
    Malformed { flow_version_id: String, reason: String },

    /// The stamp is below the oldest version the registry can upgrade from
    #[error("flow version {flow_version_id} has unsupported schema version {schema_version} (oldest supported is {baseline})")]
    UnsupportedSchemaVersion {
        flow_version_id: String,
        schema_version: String,
        baseline: String,
    },

    /// A step points at a file that no longer exists
    #[error("artifact {file_id} referenced by step {step_name} of flow version {flow_version_id} is missing")]
    MissingArtifact {
        flow_version_id: String,
        step_name: String,
        file_id: String,
    },

    /// A step depends on a piece the reference data knows nothing about
    #[error("piece {piece_name} used by step {step_name} of flow version {flow_version_id} has no published version")]
    UnresolvedPiece {
        flow_version_id: String,
        step_name: String,
        piece_name: String,
    },

    /// A migration stamped a version other than the one it declares
    #[error("migration {migration} stamped schema version {actual}, expected {expected}")]
    VersionMismatch {
        migration: String,
        expected: String,
        actual: String,
    },

    /// A storage collaborator failed
    #[error("storage error while {action}: {reason}")]
    Storage { action: String, reason: String },

    /// A storage collaborator did not answer in time
    #[error("timed out after {timeout:?} while {action}")]
    Timeout { action: String, timeout: Duration },
}

/// Coarse classification of migration failures, used for logging and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MalformedInput,
    UnresolvedDependency,
    EngineDefect,
    Persistence,
}

impl MigrationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MigrationError::Malformed { .. }
            | MigrationError::UnsupportedSchemaVersion { .. }
            | MigrationError::MissingArtifact { .. } => FailureKind::MalformedInput,
            MigrationError::UnresolvedPiece { .. } => FailureKind::UnresolvedDependency,
            MigrationError::VersionMismatch { .. } => FailureKind::EngineDefect,
            MigrationError::Storage { .. } | MigrationError::Timeout { .. } => {
                FailureKind::Persistence
            }
        }
    }

    pub fn malformed(flow_version_id: &str, reason: impl ToString) -> Self {
        MigrationError::Malformed {
            flow_version_id: flow_version_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn storage(action: impl Into<String>, error: &anyhow::Error) -> Self {
        MigrationError::Storage {
            action: action.into(),
            reason: format!("{:#}", error),
        }
    }
}
