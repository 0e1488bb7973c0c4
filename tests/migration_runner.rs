mod common;

use async_trait::async_trait;
use common::{assert_structurally_valid, flow_version, slot_names, step, zip_of};
use flowshift::error::{FailureKind, MigrationError};
use flowshift::flow::{FlowVersion, SchemaVersion, StepBody};
use flowshift::migration::migrations::ErrorHandlingDefaults;
use flowshift::migration::{
    Migrated, Migration, MigrationContext, MigrationRegistry, MigrationRunner, RunnerConfig,
};
use flowshift::storage::memory::{MemoryFileStore, MemoryFlowVersionStore, StaticPieceVersions};
use flowshift::storage::{FileMetadata, FileStore, FileType};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const GMAIL: &str = "@activepieces/piece-gmail";
const SLACK: &str = "@activepieces/piece-slack";

fn pieces() -> Arc<StaticPieceVersions> {
    Arc::new(StaticPieceVersions::new([(GMAIL, "0.9.0"), (SLACK, "0.6.1")]))
}

fn runner_with(
    store: Arc<MemoryFlowVersionStore>,
    files: Arc<MemoryFileStore>,
    registry: MigrationRegistry,
    config: RunnerConfig,
) -> MigrationRunner {
    MigrationRunner::new(store, files, pieces(), registry, config)
}

fn standard_runner(
    store: Arc<MemoryFlowVersionStore>,
    files: Arc<MemoryFileStore>,
) -> MigrationRunner {
    runner_with(store, files, MigrationRegistry::standard(), RunnerConfig::default())
}

fn slack_step(name: &str) -> serde_json::Value {
    json!({
        "name": name,
        "type": "PIECE",
        "displayName": "Send message",
        "settings": {
            "pieceName": SLACK,
            "pieceVersion": "0.5.0",
            "actionName": "send_message",
            "input": { "auth": "{{connections['slack-bot']}}", "text": "hi" }
        }
    })
}

/// Trigger with a branch whose success path is empty, as written by old builders
fn legacy_branch_document(id: &str) -> FlowVersion {
    flow_version(json!({
        "id": id,
        "flowId": "flow-1",
        "displayName": "Route invoices",
        "schemaVersion": "7",
        "trigger": {
            "name": "trigger",
            "type": "PIECE_TRIGGER",
            "settings": {
                "pieceName": GMAIL,
                "pieceVersion": "~0.8.0",
                "triggerName": "new_email",
                "input": { "auth": "{{connections['gmail-main']}}" }
            },
            "nextAction": {
                "name": "step_1",
                "type": "BRANCH",
                "settings": { "conditions": [[{ "firstValue": "{{trigger.subject}}", "operator": "TEXT_CONTAINS", "secondValue": "invoice" }]] },
                "onFailureAction": slack_step("step_2"),
                "nextAction": slack_step("step_3")
            }
        }
    }))
}

#[tokio::test]
async fn test_full_chain_upgrades_legacy_document() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    let files = Arc::new(MemoryFileStore::new());
    store.insert(legacy_branch_document("fv1")).await;

    let report = standard_runner(store.clone(), files.clone()).migrate_all().await.unwrap();

    assert_eq!(report.candidates, 1);
    assert_eq!(report.migrated, 1);
    assert_eq!(report.failed(), 0);
    assert_eq!(report.target_schema_version, "12");

    let migrated = store.get("fv1").await.unwrap();
    assert_structurally_valid(&migrated);
    assert_eq!(migrated.schema_version.as_deref(), Some("12"));

    // Recovered from the schema 7 backup, so the empty success path keeps its slot
    assert_eq!(slot_names(&migrated, "step_1"), vec![None, Some("step_2".to_string())]);
    assert!(migrated.backup_files.contains_key("7"));
    assert_eq!(files.count(FileType::FlowVersionBackup).await, 1);

    for name in ["step_2", "step_3"] {
        let settings = step(&migrated, name).piece_settings().unwrap();
        assert_eq!(settings.piece_version, "0.6.1");
        assert!(settings.error_handling_options.is_some());
    }
    assert_eq!(step(&migrated, "trigger").piece_settings().unwrap().piece_version, "0.9.0");
    assert_eq!(migrated.connection_ids, vec!["gmail-main", "slack-bot"]);
}

#[tokio::test]
async fn test_second_run_writes_nothing() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    let files = Arc::new(MemoryFileStore::new());
    store.insert(legacy_branch_document("fv1")).await;
    store.insert(legacy_branch_document("fv2")).await;
    let runner = standard_runner(store.clone(), files.clone());

    runner.migrate_all().await.unwrap();
    let after_first = store.get("fv1").await.unwrap();
    assert_eq!(store.save_count(), 2);

    let report = runner.migrate_all().await.unwrap();

    assert_eq!(report.candidates, 0);
    assert_eq!(report.migrated, 0);
    assert_eq!(store.save_count(), 2);
    assert_eq!(store.get("fv1").await.unwrap(), after_first);
    assert_eq!(files.count(FileType::FlowVersionBackup).await, 2);
}

#[tokio::test]
async fn test_router_null_slot_survives_every_migration() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    store
        .insert(flow_version(json!({
            "id": "fv1",
            "flowId": "flow-1",
            "schemaVersion": "8",
            "trigger": {
                "name": "trigger",
                "type": "WEBHOOK",
                "settings": {},
                "nextAction": {
                    "name": "step_1",
                    "type": "ROUTER",
                    "settings": {
                        "branches": [
                            { "branchName": "A", "branchType": "CONDITION", "conditions": [[{ "firstValue": "a" }]] },
                            { "branchName": "B", "branchType": "CONDITION", "conditions": [[{ "firstValue": "b" }]] },
                            { "branchName": "Otherwise", "branchType": "FALLBACK" }
                        ]
                    },
                    "children": [slack_step("step_2"), null, slack_step("step_3")]
                }
            }
        })))
        .await;

    let report = standard_runner(store.clone(), Arc::new(MemoryFileStore::new()))
        .migrate_all()
        .await
        .unwrap();
    assert_eq!(report.migrated, 1);

    let migrated = store.get("fv1").await.unwrap();
    assert_eq!(
        slot_names(&migrated, "step_1"),
        vec![Some("step_2".to_string()), None, Some("step_3".to_string())]
    );
    assert_structurally_valid(&migrated);
}

#[tokio::test]
async fn test_upgrade_on_read_writes_no_backup() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    let files = Arc::new(MemoryFileStore::new());
    let stored = legacy_branch_document("fv1");
    store.insert(stored.clone()).await;

    let upgraded = standard_runner(store.clone(), files.clone())
        .upgrade(stored.clone())
        .await
        .unwrap();

    assert_eq!(upgraded.schema_version.as_deref(), Some("12"));
    // Recovery still sees the snapshot the conversion took
    assert_eq!(slot_names(&upgraded, "step_1"), vec![None, Some("step_2".to_string())]);
    assert!(upgraded.backup_files.is_empty());
    assert_eq!(files.count(FileType::FlowVersionBackup).await, 0);
    assert_eq!(store.save_count(), 0);
    assert_eq!(store.get("fv1").await.unwrap(), stored);
}

#[tokio::test]
async fn test_padded_stamp_is_backed_up_under_canonical_version() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    let files = Arc::new(MemoryFileStore::new());
    let mut padded = legacy_branch_document("fv1");
    padded.schema_version = Some("07".to_string());
    store.insert(padded).await;

    let report = standard_runner(store.clone(), files.clone()).migrate_all().await.unwrap();

    assert_eq!(report.migrated, 1);
    let migrated = store.get("fv1").await.unwrap();
    assert_eq!(migrated.backup_files.keys().collect::<Vec<_>>(), vec!["7"]);
    assert!(files.find_backup("fv1", "7").await.unwrap().is_some());
    assert_eq!(slot_names(&migrated, "step_1"), vec![None, Some("step_2".to_string())]);
}

#[tokio::test]
async fn test_recovery_without_backup_keeps_compacted_router() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    store
        .insert(flow_version(json!({
            "id": "fv1",
            "flowId": "flow-1",
            "schemaVersion": "8",
            "trigger": {
                "name": "trigger",
                "type": "EMPTY",
                "nextAction": {
                    "name": "step_1",
                    "type": "ROUTER",
                    "settings": {
                        "branches": [
                            { "branchName": "Branch 1", "branchType": "CONDITION" },
                            { "branchName": "Otherwise", "branchType": "FALLBACK" }
                        ]
                    },
                    "children": [slack_step("step_2")]
                }
            }
        })))
        .await;

    let report = standard_runner(store.clone(), Arc::new(MemoryFileStore::new()))
        .migrate_all()
        .await
        .unwrap();

    assert_eq!(report.migrated, 1);
    let migrated = store.get("fv1").await.unwrap();
    assert_eq!(migrated.schema_version.as_deref(), Some("12"));
    assert_eq!(slot_names(&migrated, "step_1"), vec![Some("step_2".to_string())]);
}

#[tokio::test]
async fn test_default_injection_scenario() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    let files = Arc::new(MemoryFileStore::new());
    files
        .insert(
            "A1",
            zip_of(&[("index.ts", "export const code = async () => 1;"), ("package.json", "{}")]),
            FileMetadata {
                file_type: FileType::CodeArtifact,
                flow_version_id: None,
                schema_version: None,
            },
        )
        .await;
    store
        .insert(flow_version(json!({
            "id": "fv1",
            "flowId": "flow-1",
            "schemaVersion": "10",
            "trigger": {
                "name": "trigger",
                "type": "EMPTY",
                "nextAction": { "name": "step_1", "type": "CODE", "settings": { "artifactSourceId": "A1", "input": {} } }
            }
        })))
        .await;

    let registry =
        MigrationRegistry::new(SchemaVersion::new(10), vec![Arc::new(ErrorHandlingDefaults)])
            .unwrap();
    let report = runner_with(store.clone(), files, registry, RunnerConfig::default())
        .migrate_all()
        .await
        .unwrap();
    assert_eq!(report.migrated, 1);

    let migrated = store.get("fv1").await.unwrap();
    assert_eq!(migrated.schema_version.as_deref(), Some("11"));
    let encoded = serde_json::to_value(&migrated).unwrap();
    assert_eq!(
        encoded["trigger"]["nextAction"]["settings"],
        json!({
            "artifactSourceId": "A1",
            "input": {},
            "errorHandlingOptions": { "continueOnFailure": { "value": false }, "retryOnFailure": { "value": false } }
        })
    );
}

/// Records the order migrations run in
struct Recorder {
    target: u32,
    log: Arc<Mutex<Vec<u32>>>,
    touches_tree: bool,
}

#[async_trait]
impl Migration for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn target_schema_version(&self) -> SchemaVersion {
        SchemaVersion::new(self.target)
    }

    async fn migrate(
        &self,
        mut flow_version: FlowVersion,
        _ctx: &MigrationContext,
    ) -> Result<Migrated, MigrationError> {
        self.log.lock().unwrap().push(self.target);
        if !self.touches_tree {
            return Ok(Migrated::unchanged(flow_version));
        }
        flow_version.schema_version = Some(self.target.to_string());
        if let Some(trigger) = flow_version.trigger.as_mut() {
            trigger.display_name = format!("touched by {}", self.target);
        }
        Ok(Migrated::changed(flow_version))
    }
}

fn recorders(log: &Arc<Mutex<Vec<u32>>>) -> Vec<Arc<dyn Migration>> {
    vec![
        Arc::new(Recorder { target: 2, log: log.clone(), touches_tree: true }),
        Arc::new(Recorder { target: 3, log: log.clone(), touches_tree: false }),
        Arc::new(Recorder { target: 4, log: log.clone(), touches_tree: true }),
    ]
}

fn empty_document(id: &str, schema_version: &str) -> FlowVersion {
    flow_version(json!({
        "id": id,
        "flowId": "flow-1",
        "schemaVersion": schema_version,
        "trigger": { "name": "trigger", "type": "EMPTY" }
    }))
}

#[tokio::test]
async fn test_migrations_apply_in_order_including_no_ops() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(MemoryFlowVersionStore::new());
    store.insert(empty_document("fv1", "1")).await;
    let registry = MigrationRegistry::new(SchemaVersion::new(1), recorders(&log)).unwrap();

    let files = Arc::new(MemoryFileStore::new());
    let report = runner_with(store.clone(), files, registry, RunnerConfig::default())
        .migrate_all()
        .await
        .unwrap();

    assert_eq!(report.migrated, 1);
    assert_eq!(*log.lock().unwrap(), vec![2, 3, 4]);
    let migrated = store.get("fv1").await.unwrap();
    assert_eq!(migrated.schema_version.as_deref(), Some("4"));
    assert_eq!(migrated.trigger.unwrap().display_name, "touched by 4");
}

#[tokio::test]
async fn test_only_pending_migrations_run() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(MemoryFlowVersionStore::new());
    store.insert(empty_document("fv1", "3")).await;
    let registry = MigrationRegistry::new(SchemaVersion::new(1), recorders(&log)).unwrap();

    runner_with(store, Arc::new(MemoryFileStore::new()), registry, RunnerConfig::default())
        .migrate_all()
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec![4]);
}

#[tokio::test]
async fn test_failures_are_isolated_per_document() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    let files = Arc::new(MemoryFileStore::new());

    store.insert(legacy_branch_document("fv-ok")).await;

    let mut unknown_piece = legacy_branch_document("fv-unknown-piece");
    if let Some(trigger) = unknown_piece.trigger.as_mut() {
        if let Some(settings) = trigger.piece_settings_mut() {
            settings.piece_name = "@activepieces/piece-retired".to_string();
        }
    }
    store.insert(unknown_piece.clone()).await;

    let missing_artifact = flow_version(json!({
        "id": "fv-missing-artifact",
        "flowId": "flow-2",
        "schemaVersion": "9",
        "trigger": {
            "name": "trigger",
            "type": "EMPTY",
            "nextAction": { "name": "step_1", "type": "CODE", "settings": { "artifactSourceId": "gone", "input": {} } }
        }
    }));
    store.insert(missing_artifact.clone()).await;

    let report = standard_runner(store.clone(), files).migrate_all().await.unwrap();

    assert_eq!(report.candidates, 3);
    assert_eq!(report.migrated, 1);
    assert_eq!(report.failed(), 2);

    let kinds: Vec<(String, FailureKind)> = {
        let mut kinds: Vec<_> = report
            .failures
            .iter()
            .map(|f| (f.flow_version_id.clone(), f.kind))
            .collect();
        kinds.sort_by(|a, b| a.0.cmp(&b.0));
        kinds
    };
    assert_eq!(
        kinds,
        vec![
            ("fv-missing-artifact".to_string(), FailureKind::MalformedInput),
            ("fv-unknown-piece".to_string(), FailureKind::UnresolvedDependency),
        ]
    );

    let unresolved = report
        .failures
        .iter()
        .find(|f| f.flow_version_id == "fv-unknown-piece")
        .unwrap();
    assert!(unresolved.message.contains("@activepieces/piece-retired"));
    assert!(unresolved.message.contains("trigger"));

    // Failed documents are exactly as they were stored
    assert_eq!(store.get("fv-unknown-piece").await.unwrap(), unknown_piece);
    assert_eq!(store.get("fv-missing-artifact").await.unwrap(), missing_artifact);
    assert_eq!(store.get("fv-ok").await.unwrap().schema_version.as_deref(), Some("12"));
}

#[tokio::test]
async fn test_save_failures_are_counted_and_leave_document_untouched() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    store.insert(legacy_branch_document("fv1")).await;
    store.insert(legacy_branch_document("fv2")).await;
    store.fail_saves_for("fv2").await;

    let report = standard_runner(store.clone(), Arc::new(MemoryFileStore::new()))
        .migrate_all()
        .await
        .unwrap();

    assert_eq!(report.migrated, 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.failures[0].flow_version_id, "fv2");
    assert_eq!(report.failures[0].kind, FailureKind::Persistence);
    assert_eq!(store.get("fv2").await.unwrap(), legacy_branch_document("fv2"));
}

/// File store whose reads never answer in time
struct StalledFiles;

#[async_trait]
impl FileStore for StalledFiles {
    async fn save(&self, _data: Vec<u8>, _metadata: FileMetadata) -> anyhow::Result<String> {
        Ok("stalled".to_string())
    }

    async fn get_data(&self, _id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(None)
    }

    async fn find_backup(
        &self,
        _flow_version_id: &str,
        _schema_version: &str,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_slow_storage_times_out_per_document() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    store
        .insert(flow_version(json!({
            "id": "fv1",
            "flowId": "flow-1",
            "schemaVersion": "9",
            "trigger": {
                "name": "trigger",
                "type": "EMPTY",
                "nextAction": { "name": "step_1", "type": "CODE", "settings": { "artifactSourceId": "A1", "input": {} } }
            }
        })))
        .await;
    store.insert(empty_document("fv2", "9")).await;

    let config = RunnerConfig {
        io_timeout: Duration::from_millis(50),
        ..RunnerConfig::default()
    };
    let runner = MigrationRunner::new(
        store.clone(),
        Arc::new(StalledFiles),
        pieces(),
        MigrationRegistry::standard(),
        config,
    );

    let report = runner.migrate_all().await.unwrap();

    assert_eq!(report.migrated, 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.failures[0].flow_version_id, "fv1");
    assert_eq!(report.failures[0].kind, FailureKind::Persistence);
    assert!(report.failures[0].message.contains("timed out"));
}

#[tokio::test]
async fn test_cancelled_run_starts_no_documents() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    store.insert(legacy_branch_document("fv1")).await;
    let (_tx, cancel) = watch::channel(true);

    let report = standard_runner(store.clone(), Arc::new(MemoryFileStore::new()))
        .migrate_all_until(cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.migrated, 0);
    assert_eq!(store.save_count(), 0);
}

/// Requests cancellation the first time it runs
struct CancelAfterFirst {
    cancel: watch::Sender<bool>,
}

#[async_trait]
impl Migration for CancelAfterFirst {
    fn name(&self) -> &'static str {
        "cancel-after-first"
    }

    fn target_schema_version(&self) -> SchemaVersion {
        SchemaVersion::new(2)
    }

    async fn migrate(
        &self,
        flow_version: FlowVersion,
        _ctx: &MigrationContext,
    ) -> Result<Migrated, MigrationError> {
        let _ = self.cancel.send(true);
        Ok(Migrated::unchanged(flow_version))
    }
}

#[tokio::test]
async fn test_cancellation_stops_between_documents() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    for id in ["fv1", "fv2", "fv3"] {
        store.insert(empty_document(id, "1")).await;
    }
    let (tx, cancel) = watch::channel(false);
    let migrations: Vec<Arc<dyn Migration>> = vec![Arc::new(CancelAfterFirst { cancel: tx })];
    let registry = MigrationRegistry::new(SchemaVersion::new(1), migrations).unwrap();
    let config = RunnerConfig {
        batch_size: 1,
        concurrency: 1,
        ..RunnerConfig::default()
    };

    let report = runner_with(store.clone(), Arc::new(MemoryFileStore::new()), registry, config)
        .migrate_all_until(cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.migrated, 1);
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.get("fv1").await.unwrap().schema_version.as_deref(), Some("2"));
    assert_eq!(store.get("fv3").await.unwrap().schema_version.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_stamp_only_migration_keeps_tree() {
    let store = Arc::new(MemoryFlowVersionStore::new());
    let document = flow_version(json!({
        "id": "fv1",
        "flowId": "flow-1",
        "schemaVersion": "11",
        "trigger": { "name": "trigger", "type": "WEBHOOK", "settings": { "inputUiInfo": {} } }
    }));
    store.insert(document.clone()).await;

    let report = standard_runner(store.clone(), Arc::new(MemoryFileStore::new()))
        .migrate_all()
        .await
        .unwrap();

    assert_eq!(report.migrated, 1);
    let migrated = store.get("fv1").await.unwrap();
    assert_eq!(migrated.schema_version.as_deref(), Some("12"));
    assert_eq!(migrated.trigger, document.trigger);
    assert!(matches!(migrated.trigger.unwrap().body, StepBody::Webhook { .. }));
}
