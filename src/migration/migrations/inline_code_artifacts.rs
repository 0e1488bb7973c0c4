/// Code step sources moved from zipped artifacts into the step itself
///
/// Older code steps only carry `artifactSourceId`, the id of a zip holding `index.ts`
/// (or `index.js`) and `package.json`. This migration reads those archives and writes
/// their contents to `sourceCode`. The artifact id is kept so the step can be reverted.

use super::stamp;
use crate::error::MigrationError;
use crate::flow::{traverse, visit, FlowVersion, SchemaVersion, SourceCode, StepBody};
use crate::migration::{Migrated, Migration, MigrationContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{Cursor, Read};

const CODE_ENTRIES: [&str; 2] = ["index.ts", "index.js"];
const PACKAGE_ENTRY: &str = "package.json";
const EMPTY_PACKAGE_JSON: &str = "{}";

pub struct InlineCodeArtifacts;

impl InlineCodeArtifacts {
    /// Drop inlined sources from code steps that still reference an artifact
    ///
    /// Returns true if any step was touched. The schema stamp is left alone.
    pub fn revert(flow_version: &mut FlowVersion) -> bool {
        traverse(flow_version.trigger.as_mut(), &mut |step| match &mut step.body {
            StepBody::Code { settings } if settings.artifact_source_id.is_some() => {
                settings.source_code.take().is_some()
            }
            _ => false,
        })
    }
}

#[async_trait]
impl Migration for InlineCodeArtifacts {
    fn name(&self) -> &'static str {
        "inline-code-artifacts"
    }

    fn target_schema_version(&self) -> SchemaVersion {
        SchemaVersion::new(10)
    }

    async fn migrate(
        &self,
        mut flow_version: FlowVersion,
        ctx: &MigrationContext,
    ) -> Result<Migrated, MigrationError> {
        let pending = pending_artifacts(&flow_version);

        let mut sources: HashMap<String, SourceCode> = HashMap::new();
        for (step_name, file_id) in pending {
            let data = ctx
                .bounded(
                    format!("loading artifact {} of flow version {}", file_id, flow_version.id),
                    ctx.files.get_data(&file_id),
                )
                .await?
                .ok_or_else(|| MigrationError::MissingArtifact {
                    flow_version_id: flow_version.id.clone(),
                    step_name: step_name.clone(),
                    file_id: file_id.clone(),
                })?;

            let source = extract_source(&data).map_err(|reason| {
                MigrationError::malformed(
                    &flow_version.id,
                    format!("artifact {} of step {} is unreadable: {}", file_id, step_name, reason),
                )
            })?;
            sources.insert(step_name, source);
        }

        let changed = traverse(flow_version.trigger.as_mut(), &mut |step| {
            let Some(source) = sources.remove(&step.name) else {
                return false;
            };
            match &mut step.body {
                StepBody::Code { settings } => {
                    settings.source_code = Some(source);
                    true
                }
                _ => false,
            }
        });

        stamp(&mut flow_version, self.target_schema_version());
        Ok(Migrated { flow_version, tree_changed: changed })
    }
}

/// `(step name, artifact id)` of every code step still waiting to be inlined
fn pending_artifacts(flow_version: &FlowVersion) -> Vec<(String, String)> {
    let mut pending = Vec::new();
    visit(flow_version.trigger.as_ref(), &mut |step| {
        if let StepBody::Code { settings } = &step.body {
            if let (Some(file_id), None) = (&settings.artifact_source_id, &settings.source_code) {
                pending.push((step.name.clone(), file_id.clone()));
            }
        }
    });
    pending
}

/// Read the code and package manifest out of a zipped artifact
///
/// Entries are matched on their file name so archives with a top-level folder work too.
pub fn extract_source(data: &[u8]) -> Result<SourceCode, String> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(data)).map_err(|e| format!("Invalid zip: {}", e))?;

    let mut entries: HashMap<String, String> = HashMap::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| format!("Zip entry: {}", e))?;
        if entry.is_dir() {
            continue;
        }
        let file_name = entry.name().rsplit('/').next().unwrap_or_default().to_string();
        if !CODE_ENTRIES.contains(&file_name.as_str()) && file_name != PACKAGE_ENTRY {
            continue;
        }
        let mut contents = String::new();
        entry
            .read_to_string(&mut contents)
            .map_err(|e| format!("Read {}: {}", file_name, e))?;
        entries.entry(file_name).or_insert(contents);
    }

    let code = CODE_ENTRIES
        .iter()
        .find_map(|name| entries.remove(*name))
        .ok_or_else(|| format!("no {} in archive", CODE_ENTRIES.join(" or ")))?;
    let package_json = entries
        .remove(PACKAGE_ENTRY)
        .unwrap_or_else(|| EMPTY_PACKAGE_JSON.to_string());

    Ok(SourceCode { code, package_json })
}
