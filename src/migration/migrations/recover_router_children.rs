/// Repair routers produced by the slot-dropping branch conversion
///
/// The tree is rebuilt from the backup taken before `BranchToRouter` ran, this time
/// keeping empty slots. Documents without a backup never contained a branch, or lost the
/// backup; either way they are only stamped.

use super::branch_to_router::{branch_into_router, PRE_ROUTER_SCHEMA_VERSION};
use super::stamp;
use crate::error::MigrationError;
use crate::flow::{transform, FlowVersion, SchemaVersion};
use crate::migration::{Migrated, Migration, MigrationContext};
use async_trait::async_trait;

pub struct RecoverRouterChildren;

#[async_trait]
impl Migration for RecoverRouterChildren {
    fn name(&self) -> &'static str {
        "recover-router-children"
    }

    fn target_schema_version(&self) -> SchemaVersion {
        SchemaVersion::new(9)
    }

    async fn migrate(
        &self,
        mut flow_version: FlowVersion,
        ctx: &MigrationContext,
    ) -> Result<Migrated, MigrationError> {
        let backup_version = PRE_ROUTER_SCHEMA_VERSION.to_string();
        let backup = ctx
            .bounded(
                format!(
                    "loading backup of flow version {} at schema {}",
                    flow_version.id, backup_version
                ),
                ctx.backups.get(&flow_version.id, &backup_version),
            )
            .await?;

        stamp(&mut flow_version, self.target_schema_version());

        let Some(backup) = backup else {
            tracing::debug!(
                "🩹 No schema {} backup for flow version {}, nothing to recover",
                backup_version,
                flow_version.id
            );
            return Ok(Migrated::unchanged(flow_version));
        };

        let recovered = transform(backup.trigger, &mut |step| Some(branch_into_router(step, true)));
        if recovered == flow_version.trigger {
            return Ok(Migrated::unchanged(flow_version));
        }

        tracing::info!(
            "🩹 Rebuilt router children of flow version {} from backup",
            flow_version.id
        );
        flow_version.trigger = recovered;
        Ok(Migrated::changed(flow_version))
    }
}
