/// Flow Model Layer
///
/// This module defines the documents being migrated:
/// - The step tree (`Step`, `StepBody`) with typed per-kind settings
/// - Flow version documents and schema versions
/// - The traversal engine every migration walks the tree with

// Step tree types
pub mod step;

// Flow version documents and schema versions
pub mod version;

// Recursive walk / transform over step trees
pub mod traverse;

// Re-export commonly used types
pub use step::{
    BranchSettings, BranchType, CodeSettings, ErrorHandlingOptions, LoopSettings, PieceSettings,
    RouterBranch, RouterSettings, SourceCode, Step, StepBody, StepKind, Toggle,
};
pub use traverse::{all_steps, transform, traverse, visit};
pub use version::{decode_json, FlowVersion, ParseSchemaVersionError, SchemaVersion};
