//! Display formatting for CLI output
//!
//! Pure functions that format data for display

use std::collections::BTreeMap;
use std::path::Path;

use crate::provision::{NodeState, ProvisionedCluster, ProvisionedNode};
use crate::topology::ClusterTopology;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No nodes.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: Vec<String>| {
        let line: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(w) => format!("{:width$}", cell, width = *w),
                None => cell.clone(),
            })
            .collect();
        output.push_str(line.join("   ").trim_end());
        output.push('\n');
    };

    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row);
    }

    output
}

// ============================================================================
// Cluster display
// ============================================================================

fn node_row(group: &str, node: &ProvisionedNode) -> Vec<String> {
    vec![
        group.to_string(),
        node.hostname.clone(),
        node.public_address.to_string(),
        node.private_address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string()),
    ]
}

/// Ready nodes grouped by role, one row per group membership
pub fn format_node_table(cluster: &ProvisionedCluster) -> String {
    let groups = [
        ("etcd", &cluster.etcd),
        ("master", &cluster.master),
        ("worker", &cluster.worker),
        ("ingress", &cluster.ingress),
        ("storage", &cluster.storage),
        ("bootstrap", &cluster.bootstrap),
    ];
    let rows = groups
        .iter()
        .flat_map(|(group, nodes)| nodes.iter().map(move |n| node_row(group, n)))
        .collect();

    format_table(&["ROLE", "HOSTNAME", "PUBLIC IP", "PRIVATE IP"], rows)
}

pub fn format_topology(topology: &ClusterTopology) -> String {
    let rows = topology
        .nodes
        .iter()
        .map(|n| {
            vec![
                n.spec.name.clone(),
                n.address.to_string(),
                n.spec.roles.to_string(),
            ]
        })
        .collect();

    let mut output = format!(
        "Network {} (broadcast {})\n\n",
        topology.network, topology.broadcast
    );
    output.push_str(&format_table(&["NAME", "ADDRESS", "ROLES"], rows));
    output
}

/// Per-node states after a failed run
pub fn format_node_states(states: &BTreeMap<String, NodeState>) -> String {
    let rows = states
        .iter()
        .map(|(name, state)| vec![name.clone(), format!("{:?}", state)])
        .collect();
    format_table(&["NODE", "STATE"], rows)
}

pub fn format_install_hint(plan_path: &Path) -> String {
    format!(
        "Plan written to {}\nTo install the cluster, run:\n  kismatic install apply -f {}\n",
        plan_path.display(),
        plan_path.display()
    )
}
