//! Constraint scheduler.
//!
//! [`plan_tick`] is a pure decision function: given a snapshot of one job's
//! hosts (in expansion order), the namespace rules, and the global lock
//! counts, it decides which hosts become ready, which are admitted to run,
//! and which are skipped or deadlocked. The caller applies the plan,
//! registering ephemeral lock slots for every admission; a stale lock count
//! is caught there by reconfirming after the lock write, costing at worst a
//! retried tick.

use std::collections::{BTreeSet, HashMap};

use crate::job::HostState;
use crate::namespace::{selector_tag, Namespace, PredecessorFailurePolicy};

/// One host's place in the tick snapshot.
#[derive(Debug, Clone)]
pub struct HostSnapshot {
    pub hostname: String,
    pub state: HostState,
}

/// Snapshot input for one scheduling tick of one job.
#[derive(Debug)]
pub struct TickInput<'a> {
    pub namespace: &'a Namespace,
    /// The job's hosts in target-expansion order.
    pub hosts: &'a [HostSnapshot],
    /// Job-wide concurrency cap, already resolved to a count.
    pub concurrent: usize,
    /// Held lock slots per tag, across every job in the namespace.
    pub lock_counts: HashMap<String, usize>,
}

/// An admitted host and the tag slots it must lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub hostname: String,
    /// Tags of capped constraints the host matches; one lock slot each.
    pub lock_tags: Vec<String>,
}

/// The scheduler's decision for one tick. Transitions are applied by the
/// job controller in the order: skip, deadlock, promote, admit.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickPlan {
    /// `waiting -> ready`: all sequence predecessors finished.
    pub promote: Vec<String>,
    /// `ready -> running`, within every cap.
    pub admit: Vec<Admission>,
    /// `waiting -> skipped`: predecessor failed and policy says skip.
    pub skip: Vec<String>,
    /// `waiting -> deadlocked`: the wait can never be satisfied.
    pub deadlock: Vec<String>,
}

impl TickPlan {
    pub fn is_noop(&self) -> bool {
        self.promote.is_empty()
            && self.admit.is_empty()
            && self.skip.is_empty()
            && self.deadlock.is_empty()
    }
}

/// How a host's sequence predecessors currently stand.
enum PredecessorStanding {
    /// Every predecessor finished (or the dependency is waived).
    Satisfied,
    /// Some predecessor is still on its way to a terminal state.
    Pending,
    /// Some predecessor is in terminal failure; resolution is the policy's.
    Failed,
}

fn tag_of(selector: &str) -> Option<&str> {
    selector_tag(selector).ok()
}

/// Tags whose hosts must finish before `hostname` may start.
fn predecessor_tags<'a>(namespace: &'a Namespace, host_tags: &BTreeSet<String>) -> Vec<&'a str> {
    let mut tags = Vec::new();
    for rule in namespace.constraints() {
        let Some(applies) = tag_of(&rule.applies_to) else {
            continue;
        };
        if !host_tags.contains(applies) {
            continue;
        }
        for selector in &rule.sequence_before {
            if let Some(tag) = tag_of(selector) {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
    }
    tags
}

fn predecessor_standing(
    namespace: &Namespace,
    hosts: &[HostSnapshot],
    states: &HashMap<&str, HostState>,
    hostname: &str,
) -> PredecessorStanding {
    let host_tags = namespace.tags_of(hostname);
    let pred_tags = predecessor_tags(namespace, &host_tags);
    if pred_tags.is_empty() {
        return PredecessorStanding::Satisfied;
    }

    let mut pending = false;
    for snapshot in hosts {
        // A host is never its own predecessor.
        if snapshot.hostname == hostname {
            continue;
        }
        let tags = namespace.tags_of(&snapshot.hostname);
        if !pred_tags.iter().any(|t| tags.contains(*t)) {
            continue;
        }
        match states.get(snapshot.hostname.as_str()) {
            Some(HostState::Finished) => {}
            Some(s) if s.is_terminal_failure() => return PredecessorStanding::Failed,
            _ => pending = true,
        }
    }
    if pending {
        PredecessorStanding::Pending
    } else {
        PredecessorStanding::Satisfied
    }
}

/// Capped constraints as (tag, resolved cap) pairs.
pub fn resolved_caps(namespace: &Namespace) -> Vec<(String, usize)> {
    namespace
        .constraints()
        .iter()
        .filter_map(|rule| {
            let cap = namespace.resolved_cap(rule)?;
            let tag = tag_of(&rule.applies_to)?;
            Some((tag.to_string(), cap))
        })
        .collect()
}

/// Decide one tick. Pure: same inputs, same plan.
pub fn plan_tick(input: &TickInput<'_>) -> TickPlan {
    let mut plan = TickPlan::default();
    let states: HashMap<&str, HostState> = input
        .hosts
        .iter()
        .map(|h| (h.hostname.as_str(), h.state))
        .collect();
    let caps = resolved_caps(input.namespace);

    // Pass 1: resolve waiting hosts against their predecessors.
    let mut ready: Vec<&str> = Vec::new();
    for snapshot in input.hosts {
        match snapshot.state {
            HostState::Ready => ready.push(&snapshot.hostname),
            HostState::Waiting => {}
            _ => continue,
        }
        if snapshot.state != HostState::Waiting {
            continue;
        }
        let host_tags = input.namespace.tags_of(&snapshot.hostname);

        // A cap that resolves to zero slots can never admit this host.
        let unsatisfiable = caps
            .iter()
            .any(|(tag, cap)| *cap == 0 && host_tags.contains(tag));
        if unsatisfiable {
            plan.deadlock.push(snapshot.hostname.clone());
            continue;
        }

        match predecessor_standing(input.namespace, input.hosts, &states, &snapshot.hostname) {
            PredecessorStanding::Satisfied => {
                plan.promote.push(snapshot.hostname.clone());
                ready.push(&snapshot.hostname);
            }
            PredecessorStanding::Pending => {}
            PredecessorStanding::Failed => match input.namespace.policy() {
                PredecessorFailurePolicy::Skip => plan.skip.push(snapshot.hostname.clone()),
                PredecessorFailurePolicy::Deadlock => {
                    plan.deadlock.push(snapshot.hostname.clone())
                }
                PredecessorFailurePolicy::Proceed => {
                    plan.promote.push(snapshot.hostname.clone());
                    ready.push(&snapshot.hostname);
                }
            },
        }
    }

    // Pass 2: admit ready hosts, expansion order, within every cap.
    let running = input
        .hosts
        .iter()
        .filter(|h| h.state == HostState::Running)
        .count();
    let mut budget = input.concurrent.saturating_sub(running);
    let mut tag_used: HashMap<&str, usize> = HashMap::new();
    for (tag, _) in &caps {
        let held = input.lock_counts.get(tag).copied().unwrap_or(0);
        tag_used.insert(tag.as_str(), held);
    }

    // Keep ready hosts in expansion order, not promotion order.
    let ready_in_order: Vec<&str> = input
        .hosts
        .iter()
        .map(|h| h.hostname.as_str())
        .filter(|h| ready.contains(h))
        .collect();

    for hostname in ready_in_order {
        if budget == 0 {
            break;
        }
        let host_tags = input.namespace.tags_of(hostname);
        let needed: Vec<&(String, usize)> = caps
            .iter()
            .filter(|(tag, _)| host_tags.contains(tag))
            .collect();
        let blocked = needed
            .iter()
            .any(|(tag, cap)| tag_used.get(tag.as_str()).copied().unwrap_or(0) >= *cap);
        if blocked {
            continue;
        }
        for (tag, _) in &needed {
            *tag_used.entry(tag.as_str()).or_insert(0) += 1;
        }
        budget -= 1;
        plan.admit.push(Admission {
            hostname: hostname.to_string(),
            lock_tags: needed.iter().map(|(tag, _)| tag.clone()).collect(),
        });
    }

    plan
}
