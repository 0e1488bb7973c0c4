/// Piece steps pinned to the latest published piece version
///
/// Versions come from the reference snapshot loaded once per run. A step whose piece is
/// not in the snapshot fails the whole document so nothing is half-upgraded.

use super::stamp;
use crate::error::MigrationError;
use crate::flow::{traverse, visit, FlowVersion, SchemaVersion};
use crate::migration::{Migrated, Migration, MigrationContext};
use async_trait::async_trait;

pub struct BumpPieceVersions;

#[async_trait]
impl Migration for BumpPieceVersions {
    fn name(&self) -> &'static str {
        "bump-piece-versions"
    }

    fn target_schema_version(&self) -> SchemaVersion {
        SchemaVersion::new(12)
    }

    async fn migrate(
        &self,
        mut flow_version: FlowVersion,
        ctx: &MigrationContext,
    ) -> Result<Migrated, MigrationError> {
        let versions = &ctx.piece_versions;

        let mut unresolved = None;
        visit(flow_version.trigger.as_ref(), &mut |step| {
            if unresolved.is_some() {
                return;
            }
            if let Some(settings) = step.piece_settings() {
                if versions.latest(&settings.piece_name).is_none() {
                    unresolved = Some((step.name.clone(), settings.piece_name.clone()));
                }
            }
        });
        if let Some((step_name, piece_name)) = unresolved {
            return Err(MigrationError::UnresolvedPiece {
                flow_version_id: flow_version.id.clone(),
                step_name,
                piece_name,
            });
        }

        let changed = traverse(flow_version.trigger.as_mut(), &mut |step| {
            let Some(settings) = step.piece_settings_mut() else {
                return false;
            };
            match versions.latest(&settings.piece_name) {
                Some(latest) if latest != settings.piece_version => {
                    settings.piece_version = latest.to_string();
                    true
                }
                _ => false,
            }
        });

        stamp(&mut flow_version, self.target_schema_version());
        Ok(Migrated { flow_version, tree_changed: changed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::migration::PieceVersions;
    use crate::storage::memory::MemoryFileStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn context(pieces: &[(&str, &str)]) -> MigrationContext {
        let latest: HashMap<String, String> = pieces
            .iter()
            .map(|(name, version)| (name.to_string(), version.to_string()))
            .collect();
        MigrationContext::new(
            Arc::new(MemoryFileStore::new()),
            PieceVersions::new(latest),
            Duration::from_secs(5),
        )
    }

    fn piece_flow_version() -> FlowVersion {
        serde_json::from_value(json!({
            "id": "fv1",
            "flowId": "flow-1",
            "schemaVersion": "11",
            "trigger": {
                "name": "trigger",
                "type": "PIECE_TRIGGER",
                "settings": { "pieceName": "@activepieces/piece-gmail", "pieceVersion": "~0.8.0", "triggerName": "new_email", "input": {} },
                "nextAction": {
                    "name": "step_1",
                    "type": "ROUTER",
                    "settings": { "branches": [{ "branchName": "A", "branchType": "CONDITION" }] },
                    "children": [
                        { "name": "step_2", "type": "PIECE", "settings": { "pieceName": "@activepieces/piece-slack", "pieceVersion": "0.5.0", "actionName": "send", "input": {} } }
                    ]
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_piece_versions_are_bumped() {
        let ctx = context(&[
            ("@activepieces/piece-gmail", "0.9.1"),
            ("@activepieces/piece-slack", "0.5.0"),
        ]);

        let migrated = BumpPieceVersions.migrate(piece_flow_version(), &ctx).await.unwrap();
        assert!(migrated.tree_changed);
        assert_eq!(migrated.flow_version.schema_version.as_deref(), Some("12"));

        let versions: Vec<String> = crate::flow::all_steps(migrated.flow_version.trigger.as_ref())
            .into_iter()
            .filter_map(|s| s.piece_settings().map(|p| p.piece_version.clone()))
            .collect();
        assert_eq!(versions, vec!["0.9.1", "0.5.0"]);
    }

    #[tokio::test]
    async fn test_up_to_date_pieces_report_no_change() {
        let ctx = context(&[
            ("@activepieces/piece-gmail", "~0.8.0"),
            ("@activepieces/piece-slack", "0.5.0"),
        ]);
        let migrated = BumpPieceVersions.migrate(piece_flow_version(), &ctx).await.unwrap();
        assert!(!migrated.tree_changed);
    }

    #[tokio::test]
    async fn test_unknown_piece_fails_the_document() {
        let ctx = context(&[("@activepieces/piece-gmail", "0.9.1")]);

        let err = BumpPieceVersions.migrate(piece_flow_version(), &ctx).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::UnresolvedDependency);
        match err {
            MigrationError::UnresolvedPiece { flow_version_id, step_name, piece_name } => {
                assert_eq!(flow_version_id, "fv1");
                assert_eq!(step_name, "step_2");
                assert_eq!(piece_name, "@activepieces/piece-slack");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
