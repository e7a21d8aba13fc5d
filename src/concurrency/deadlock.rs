//! Wait-for-graph deadlock analysis
//!
//! Waiters declare their held locks and at most one requested lock. A
//! process waiting on a lock held by another process produces a wait edge;
//! strongly connected components of size >= 2, or a process requesting a
//! lock it already holds, are deadlocks.

use super::models::{DeadlockReport, DeadlockType, WaiterInfo};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Analyze a set of waiters and report every deadlock found.
pub fn detect_deadlocks(waiters: &[WaiterInfo]) -> DeadlockReport {
    // lock id -> holder process
    let mut holder_of: HashMap<&str, &str> = HashMap::new();
    for w in waiters {
        for lock in &w.held_locks {
            holder_of.insert(lock.as_str(), w.process_id.as_str());
        }
    }

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for w in waiters {
        let idx = graph.add_node(w.process_id.as_str());
        nodes.insert(w.process_id.as_str(), idx);
    }

    // waiter -> holder of its requested lock (self-edge = self-deadlock)
    let mut waits_on: HashMap<&str, &str> = HashMap::new();
    for w in waiters {
        let Some(requested) = &w.requested_lock else {
            continue;
        };
        let Some(&holder) = holder_of.get(requested.as_str()) else {
            continue;
        };
        waits_on.insert(w.process_id.as_str(), holder);
        graph.add_edge(nodes[w.process_id.as_str()], nodes[holder], ());
    }

    // Cycles: SCCs of size >= 2, plus explicit self-loops
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut grouped: HashSet<&str> = HashSet::new();

    for scc in tarjan_scc(&graph) {
        if scc.len() < 2 {
            continue;
        }
        let members: HashSet<&str> = scc.iter().map(|&i| graph[i]).collect();
        groups.push(chain_order(&members, &waits_on));
        grouped.extend(members);
    }
    for w in waiters {
        let pid = w.process_id.as_str();
        if waits_on.get(pid) == Some(&pid) && !grouped.contains(pid) {
            groups.push(vec![pid.to_string()]);
        }
    }

    groups.sort_by(|a, b| a[0].cmp(&b[0]));

    if groups.is_empty() {
        return DeadlockReport::default();
    }

    let chain = groups[0].clone();
    let deadlock_type = if chain.len() == 1 {
        DeadlockType::SelfDeadlock
    } else {
        DeadlockType::Cycle
    };
    let suggested_victim = select_victim(&chain, waiters);

    DeadlockReport {
        has_deadlock: true,
        cycle_length: chain.len(),
        deadlock_chain: chain,
        deadlock_type: Some(deadlock_type),
        suggested_victim,
        multiple_deadlocks: groups.len() > 1,
        deadlock_groups: groups,
    }
}

/// Whether granting `requested_lock` to `process_id` would close a cycle.
pub fn would_deadlock(waiters: &[WaiterInfo], process_id: &str, requested_lock: &str) -> bool {
    let mut simulated: Vec<WaiterInfo> = waiters.to_vec();
    let mut found = false;
    for w in &mut simulated {
        if w.process_id == process_id {
            w.requested_lock = Some(requested_lock.to_string());
            found = true;
        }
    }
    if !found {
        simulated.push(WaiterInfo {
            process_id: process_id.to_string(),
            held_locks: Vec::new(),
            requested_lock: Some(requested_lock.to_string()),
        });
    }

    let report = detect_deadlocks(&simulated);
    report
        .deadlock_groups
        .iter()
        .any(|group| group.iter().any(|p| p == process_id))
}

/// Order cycle members by following wait edges from the lexicographically
/// smallest member, so reports are deterministic.
fn chain_order(members: &HashSet<&str>, waits_on: &HashMap<&str, &str>) -> Vec<String> {
    let start = members.iter().min().copied().unwrap_or_default();
    let mut chain = Vec::with_capacity(members.len());
    let mut current = start;
    loop {
        chain.push(current.to_string());
        match waits_on.get(current) {
            Some(&next) if members.contains(next) && next != start && chain.len() < members.len() => {
                current = next;
            }
            _ => break,
        }
    }
    // Processes unreachable along the single wait edge (shouldn't happen
    // with one requested lock per process) are appended sorted.
    if chain.len() < members.len() {
        let mut rest: Vec<&str> = members
            .iter()
            .copied()
            .filter(|m| !chain.iter().any(|c| c == m))
            .collect();
        rest.sort_unstable();
        chain.extend(rest.into_iter().map(String::from));
    }
    chain
}

/// Victim: fewest held locks, ties broken by smallest process id.
fn select_victim(chain: &[String], waiters: &[WaiterInfo]) -> Option<String> {
    chain
        .iter()
        .map(|pid| {
            let held = waiters
                .iter()
                .find(|w| &w.process_id == pid)
                .map(|w| w.held_locks.len())
                .unwrap_or(0);
            (held, pid.clone())
        })
        .min()
        .map(|(_, pid)| pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter(pid: &str, held: &[&str], requested: Option<&str>) -> WaiterInfo {
        WaiterInfo {
            process_id: pid.to_string(),
            held_locks: held.iter().map(|s| s.to_string()).collect(),
            requested_lock: requested.map(String::from),
        }
    }

    #[test]
    fn test_no_deadlock_on_simple_wait() {
        let waiters = vec![
            waiter("p1", &["a"], Some("b")),
            waiter("p2", &["b"], None),
        ];
        let report = detect_deadlocks(&waiters);
        assert!(!report.has_deadlock);
        assert!(report.deadlock_groups.is_empty());
    }

    #[test]
    fn test_two_process_cycle() {
        let waiters = vec![
            waiter("p1", &["a"], Some("b")),
            waiter("p2", &["b"], Some("a")),
        ];
        let report = detect_deadlocks(&waiters);
        assert!(report.has_deadlock);
        assert_eq!(report.cycle_length, 2);
        assert_eq!(report.deadlock_type, Some(DeadlockType::Cycle));
        assert_eq!(report.deadlock_chain, vec!["p1", "p2"]);
        // Equal held counts: lexicographically smallest pid is the victim
        assert_eq!(report.suggested_victim.as_deref(), Some("p1"));
        assert!(!report.multiple_deadlocks);
    }

    #[test]
    fn test_self_deadlock() {
        let waiters = vec![waiter("p1", &["a"], Some("a"))];
        let report = detect_deadlocks(&waiters);
        assert!(report.has_deadlock);
        assert_eq!(report.deadlock_type, Some(DeadlockType::SelfDeadlock));
        assert_eq!(report.cycle_length, 1);
        assert_eq!(report.deadlock_chain, vec!["p1"]);
    }

    #[test]
    fn test_three_process_cycle_chain_order() {
        let waiters = vec![
            waiter("p3", &["c"], Some("a")),
            waiter("p1", &["a"], Some("b")),
            waiter("p2", &["b"], Some("c")),
        ];
        let report = detect_deadlocks(&waiters);
        assert!(report.has_deadlock);
        assert_eq!(report.cycle_length, 3);
        assert_eq!(report.deadlock_chain, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_victim_prefers_fewest_held_locks() {
        let waiters = vec![
            waiter("p1", &["a", "x", "y"], Some("b")),
            waiter("p2", &["b"], Some("a")),
        ];
        let report = detect_deadlocks(&waiters);
        assert_eq!(report.suggested_victim.as_deref(), Some("p2"));
    }

    #[test]
    fn test_multiple_independent_deadlocks() {
        let waiters = vec![
            waiter("p1", &["a"], Some("b")),
            waiter("p2", &["b"], Some("a")),
            waiter("p3", &["c"], Some("d")),
            waiter("p4", &["d"], Some("c")),
        ];
        let report = detect_deadlocks(&waiters);
        assert!(report.multiple_deadlocks);
        assert_eq!(report.deadlock_groups.len(), 2);
    }

    #[test]
    fn test_prevention_rejects_cycle_closing_request() {
        // p2 already waits on a (held by p1); p1 asking for b would close
        // the cycle.
        let waiters = vec![
            waiter("p1", &["a"], None),
            waiter("p2", &["b"], Some("a")),
        ];
        assert!(would_deadlock(&waiters, "p1", "b"));
        assert!(!would_deadlock(&waiters, "p1", "unheld"));
    }
}
