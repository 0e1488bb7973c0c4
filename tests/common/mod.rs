#![allow(dead_code)]

use flowshift::flow::{all_steps, FlowVersion, Step, StepBody};
use std::collections::HashSet;
use std::io::{Cursor, Write};

/// Decode a flow version fixture
pub fn flow_version(value: serde_json::Value) -> FlowVersion {
    serde_json::from_value(value).unwrap()
}

/// Zip archive with the given entries
pub fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer.start_file(*name, zip::write::FileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Find a step anywhere in the tree by name
pub fn step<'a>(flow_version: &'a FlowVersion, name: &str) -> &'a Step {
    all_steps(flow_version.trigger.as_ref())
        .into_iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("no step named {}", name))
}

/// Router children of a named step
pub fn router_children<'a>(flow_version: &'a FlowVersion, name: &str) -> &'a Vec<Option<Step>> {
    match &step(flow_version, name).body {
        StepBody::Router { children, .. } => children,
        other => panic!("step {} is a {:?}, not a router", name, other.kind()),
    }
}

/// Names of the router's children, `None` for empty slots
pub fn slot_names(flow_version: &FlowVersion, name: &str) -> Vec<Option<String>> {
    router_children(flow_version, name)
        .iter()
        .map(|child| child.as_ref().map(|s| s.name.clone()))
        .collect()
}

/// Check the tree has a single root and that step names are unique
///
/// Every step is reached through exactly one owner, so a repeated name means a step was
/// duplicated by a migration.
pub fn assert_structurally_valid(flow_version: &FlowVersion) {
    assert!(flow_version.trigger.is_some(), "flow version {} lost its trigger", flow_version.id);

    let steps = all_steps(flow_version.trigger.as_ref());
    let mut seen = HashSet::new();
    for step in &steps {
        assert!(
            seen.insert(step.name.as_str()),
            "step {} appears twice in flow version {}",
            step.name,
            flow_version.id
        );
    }
    assert_eq!(seen.len(), steps.len());
}
