/// Explicit error handling options on every action step
///
/// `PIECE` and `CODE` steps saved before the options existed behave as if both policies
/// were off. This migration writes that down.

use super::stamp;
use crate::error::MigrationError;
use crate::flow::{traverse, ErrorHandlingOptions, FlowVersion, SchemaVersion, StepBody};
use crate::migration::{Migrated, Migration, MigrationContext};
use async_trait::async_trait;

pub struct ErrorHandlingDefaults;

fn fill_defaults(options: &mut Option<ErrorHandlingOptions>) -> bool {
    if options.is_some() {
        return false;
    }
    *options = Some(ErrorHandlingOptions::disabled());
    true
}

#[async_trait]
impl Migration for ErrorHandlingDefaults {
    fn name(&self) -> &'static str {
        "error-handling-defaults"
    }

    fn target_schema_version(&self) -> SchemaVersion {
        SchemaVersion::new(11)
    }

    async fn migrate(
        &self,
        mut flow_version: FlowVersion,
        _ctx: &MigrationContext,
    ) -> Result<Migrated, MigrationError> {
        let changed = traverse(flow_version.trigger.as_mut(), &mut |step| match &mut step.body {
            StepBody::Piece { settings } => fill_defaults(&mut settings.error_handling_options),
            StepBody::Code { settings } => fill_defaults(&mut settings.error_handling_options),
            _ => false,
        });

        stamp(&mut flow_version, self.target_schema_version());
        Ok(Migrated { flow_version, tree_changed: changed })
    }
}
