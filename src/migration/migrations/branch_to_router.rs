/// Legacy `BRANCH` steps rewritten as two-slot `ROUTER` steps
///
/// The success path becomes a condition branch carrying the old conditions, the failure
/// path becomes the fallback. The document is backed up first whenever it contains a
/// branch, because this conversion has always dropped empty slots: a branch with no
/// success path ends up with its failure path under the condition branch.
/// `RecoverRouterChildren` repairs that from the backup.

use super::stamp;
use crate::error::MigrationError;
use crate::flow::step::EXECUTE_FIRST_MATCH;
use crate::flow::{
    transform, visit, BranchType, FlowVersion, RouterBranch, RouterSettings, SchemaVersion, Step,
    StepBody, StepKind,
};
use crate::migration::{Migrated, Migration, MigrationContext};
use async_trait::async_trait;

/// Schema version whose backup holds the pre-router tree
pub const PRE_ROUTER_SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(7);

pub const CONDITION_BRANCH_NAME: &str = "Branch 1";
pub const FALLBACK_BRANCH_NAME: &str = "Otherwise";

pub struct BranchToRouter;

#[async_trait]
impl Migration for BranchToRouter {
    fn name(&self) -> &'static str {
        "branch-to-router"
    }

    fn target_schema_version(&self) -> SchemaVersion {
        SchemaVersion::new(8)
    }

    async fn migrate(
        &self,
        mut flow_version: FlowVersion,
        ctx: &MigrationContext,
    ) -> Result<Migrated, MigrationError> {
        if !contains_branch(flow_version.trigger.as_ref()) {
            stamp(&mut flow_version, self.target_schema_version());
            return Ok(Migrated::unchanged(flow_version));
        }

        let backup_key = flow_version
            .schema_version
            .clone()
            .unwrap_or_else(|| PRE_ROUTER_SCHEMA_VERSION.to_string());
        let file_id = ctx
            .bounded(
                format!("backing up flow version {}", flow_version.id),
                ctx.backups.store(&flow_version),
            )
            .await?;
        if let Some(file_id) = file_id {
            flow_version.backup_files.insert(backup_key, file_id);
        }

        flow_version.trigger = transform(flow_version.trigger.take(), &mut |step| {
            Some(branch_into_router(step, false))
        });
        stamp(&mut flow_version, self.target_schema_version());

        Ok(Migrated::changed(flow_version))
    }
}

pub(crate) fn contains_branch(root: Option<&Step>) -> bool {
    let mut found = false;
    visit(root, &mut |step| found |= step.kind() == StepKind::Branch);
    found
}

/// Rewrite a `BRANCH` step as a `ROUTER`; other kinds are returned as they are
///
/// With `keep_empty_slots` an absent path stays as an empty slot so children line up with
/// the declared branches. Without it empty slots are dropped.
pub(crate) fn branch_into_router(mut step: Step, keep_empty_slots: bool) -> Step {
    step.body = match step.body {
        StepBody::Branch { settings, on_success_action, on_failure_action } => {
            let slots = vec![on_success_action.map(|s| *s), on_failure_action.map(|s| *s)];
            let children = if keep_empty_slots {
                slots
            } else {
                slots.into_iter().filter(Option::is_some).collect()
            };

            StepBody::Router {
                settings: RouterSettings {
                    branches: vec![
                        RouterBranch {
                            branch_name: CONDITION_BRANCH_NAME.to_string(),
                            branch_type: BranchType::Condition,
                            conditions: settings.conditions,
                        },
                        RouterBranch {
                            branch_name: FALLBACK_BRANCH_NAME.to_string(),
                            branch_type: BranchType::Fallback,
                            conditions: Vec::new(),
                        },
                    ],
                    execution_type: EXECUTE_FIRST_MATCH.to_string(),
                    extra: settings.extra,
                },
                children,
            }
        }
        other => other,
    };
    step
}
