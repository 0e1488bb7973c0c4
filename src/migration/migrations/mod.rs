/// Concrete step-schema migrations
///
/// One module per target version. Each migration stamps its own target version on the
/// document it returns.

// 7 -> 8: legacy branches become routers
pub mod branch_to_router;

// 8 -> 9: rebuild router children from the pre-router backup
pub mod recover_router_children;

// 9 -> 10: code artifacts inlined into the step
pub mod inline_code_artifacts;

// 10 -> 11: explicit error handling options
pub mod error_handling_defaults;

// 11 -> 12: piece steps pinned to the latest published version
pub mod bump_piece_versions;

pub use branch_to_router::BranchToRouter;
pub use bump_piece_versions::BumpPieceVersions;
pub use error_handling_defaults::ErrorHandlingDefaults;
pub use inline_code_artifacts::InlineCodeArtifacts;
pub use recover_router_children::RecoverRouterChildren;

use crate::flow::{FlowVersion, SchemaVersion};

/// Stamp `version` on a document
pub(crate) fn stamp(flow_version: &mut FlowVersion, version: SchemaVersion) {
    flow_version.schema_version = Some(version.to_string());
}
