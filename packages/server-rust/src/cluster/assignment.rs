//! Affinity functions mapping partitions onto server nodes.
//!
//! - `ideal_assignment()`: modulo-based primaries with round-robin backups
//! - `preserve_owners()`: data-aware variant used by centralized affinity
//! - `assignment_diff()`: partitions whose owner list changed

use std::collections::BTreeMap;

use super::types::ClusterNode;

/// Partition id (index) -> ordered owners, primary first.
pub type Assignment = Vec<Vec<String>>;

/// Computes the unconstrained assignment for `nodes`.
///
/// Client nodes are ignored. Server nodes are sorted by id so every node
/// computes the same result from the same membership. Backups are taken
/// round-robin from the nodes following the primary (wrapping).
///
/// With no server nodes every partition gets an empty owner list.
#[must_use]
pub fn ideal_assignment(nodes: &[ClusterNode], partitions: u32, backups: u32) -> Assignment {
    let mut servers: Vec<&ClusterNode> = nodes.iter().filter(|n| !n.client).collect();
    servers.sort_by(|a, b| a.id.cmp(&b.id));

    let n = servers.len();
    let parts = partitions as usize;
    if n == 0 {
        return vec![Vec::new(); parts];
    }

    let copies = 1 + (backups as usize).min(n - 1);
    (0..parts)
        .map(|pid| {
            (0..copies)
                .map(|i| servers[(pid + i) % n].id.clone())
                .collect()
        })
        .collect()
}

/// Adjusts `ideal` so partitions keep a primary that actually holds data.
///
/// For each partition whose ideal primary is not among `owning(p)`, the first
/// live owning node is promoted to primary and the rest of the ideal list
/// follows (without duplicates), truncated to the ideal length.
#[must_use]
pub fn preserve_owners<F>(ideal: &Assignment, owning: F) -> Assignment
where
    F: Fn(u32) -> Vec<String>,
{
    ideal
        .iter()
        .enumerate()
        .map(|(pid, ideal_owners)| {
            let pid = u32::try_from(pid).unwrap_or(u32::MAX);
            let holders = owning(pid);
            match (ideal_owners.first(), holders.first()) {
                (Some(primary), Some(holder)) if !holders.contains(primary) => {
                    let mut owners = Vec::with_capacity(ideal_owners.len().max(1));
                    owners.push(holder.clone());
                    owners.extend(ideal_owners.iter().filter(|n| *n != holder).cloned());
                    owners.truncate(ideal_owners.len().max(1));
                    owners
                }
                (None, Some(holder)) => vec![holder.clone()],
                _ => ideal_owners.clone(),
            }
        })
        .collect()
}

/// Partitions whose owner list differs between `from` and `to`, with the new owners.
#[must_use]
pub fn assignment_diff(from: &Assignment, to: &Assignment) -> BTreeMap<u32, Vec<String>> {
    to.iter()
        .enumerate()
        .filter(|(pid, owners)| from.get(*pid) != Some(*owners))
        .map(|(pid, owners)| (u32::try_from(pid).unwrap_or(u32::MAX), owners.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(ids: &[&str]) -> Vec<ClusterNode> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| ClusterNode::server(*id, i as u64 + 1))
            .collect()
    }

    // -- ideal_assignment --

    #[test]
    fn ideal_empty_cluster_has_no_owners() {
        let result = ideal_assignment(&[], 8, 1);
        assert_eq!(result.len(), 8);
        assert!(result.iter().all(Vec::is_empty));
    }

    #[test]
    fn ideal_ignores_clients() {
        let nodes = vec![ClusterNode::client("c", 1), ClusterNode::server("s", 2)];
        let result = ideal_assignment(&nodes, 4, 1);
        assert!(result.iter().all(|o| o == &vec!["s".to_string()]));
    }

    #[test]
    fn ideal_three_nodes_one_backup() {
        let result = ideal_assignment(&servers(&["b", "a", "c"]), 6, 1);
        assert_eq!(result[0], vec!["a", "b"]);
        assert_eq!(result[1], vec!["b", "c"]);
        assert_eq!(result[2], vec!["c", "a"]);
        assert_eq!(result[3], vec!["a", "b"]);
    }

    #[test]
    fn ideal_backups_capped_by_cluster_size() {
        let result = ideal_assignment(&servers(&["a", "b"]), 2, 5);
        assert!(result.iter().all(|o| o.len() == 2));
    }

    #[test]
    fn ideal_is_deterministic_regardless_of_input_order() {
        let a = ideal_assignment(&servers(&["x", "y", "z"]), 32, 1);
        let b = ideal_assignment(&servers(&["z", "x", "y"]), 32, 1);
        assert_eq!(a, b);
    }

    // -- preserve_owners --

    #[test]
    fn preserve_promotes_data_holder() {
        let ideal = vec![vec!["a".to_string(), "b".to_string()], vec!["b".to_string(), "a".to_string()]];
        let result = preserve_owners(&ideal, |p| if p == 0 { vec!["c".to_string()] } else { vec!["b".to_string()] });
        assert_eq!(result[0], vec!["c", "a"]);
        assert_eq!(result[1], vec!["b", "a"]);
    }

    #[test]
    fn preserve_keeps_ideal_without_holders() {
        let ideal = vec![vec!["a".to_string()]];
        assert_eq!(preserve_owners(&ideal, |_| Vec::new()), ideal);
    }

    // -- assignment_diff --

    #[test]
    fn diff_reports_changed_partitions_only() {
        let from = ideal_assignment(&servers(&["a", "b", "c"]), 6, 0);
        let to = ideal_assignment(&servers(&["a", "b"]), 6, 0);
        let diff = assignment_diff(&from, &to);
        assert!(!diff.is_empty());
        for (pid, owners) in &diff {
            assert_ne!(from[*pid as usize], *owners);
        }
        assert!(assignment_diff(&to, &to).is_empty());
    }
}
