//! Record graph and stable project identifier assignment.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chrono::NaiveDate;
use housing_storage::UuidMapRow;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordNode {
    pub record_id: String,
    /// `None` for stub nodes that are only known as a link endpoint, and for
    /// records whose date could not be parsed.
    pub reference_date: Option<NaiveDate>,
    pub parents: BTreeSet<String>,
    pub children: BTreeSet<String>,
    pub uuid: Option<Uuid>,
}

impl RecordNode {
    fn stub(record_id: &str) -> Self {
        Self {
            record_id: record_id.to_string(),
            reference_date: None,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            uuid: None,
        }
    }

    /// Total order used to pick between candidate parents: later date first,
    /// then greater record id.
    fn rank(&self) -> (Option<NaiveDate>, &str) {
        (self.reference_date, self.record_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssignmentReport {
    pub components: usize,
    pub minted: usize,
    pub adopted: usize,
}

/// Arena of nodes addressed by record id, iterated in insertion order.
#[derive(Debug, Clone, Default)]
pub struct RecordGraph {
    nodes: Vec<RecordNode>,
    index: HashMap<String, usize>,
}

struct Frame {
    node: usize,
    candidates: Vec<usize>,
    next: usize,
    best: Option<usize>,
    // Set when a cycle was cut somewhere below this frame; such results
    // depend on the starting node and are not memoized.
    cut: bool,
}

// One connected group, as found from the node that reached it first.
struct Group {
    visited: usize,
    root: usize,
    members: Vec<usize>,
    uuid: Option<Uuid>,
}

impl RecordGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, record_id: &str) -> usize {
        if let Some(&at) = self.index.get(record_id) {
            return at;
        }
        let at = self.nodes.len();
        self.nodes.push(RecordNode::stub(record_id));
        self.index.insert(record_id.to_string(), at);
        at
    }

    /// Register a full record. A later add of the same id replaces its
    /// reference date; links are kept.
    pub fn add(&mut self, record_id: &str, reference_date: Option<NaiveDate>) {
        let at = self.slot(record_id);
        self.nodes[at].reference_date = reference_date;
    }

    /// Symmetric parent/child edge; unknown endpoints become stubs. Self
    /// links carry no information and are ignored.
    pub fn link(&mut self, parent: &str, child: &str) {
        if parent == child {
            return;
        }
        let p = self.slot(parent);
        let c = self.slot(child);
        self.nodes[p].children.insert(child.to_string());
        self.nodes[c].parents.insert(parent.to_string());
    }

    pub fn get(&self, record_id: &str) -> Option<&RecordNode> {
        self.index.get(record_id).map(|&at| &self.nodes[at])
    }

    pub fn contains(&self, record_id: &str) -> bool {
        self.index.contains_key(record_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordNode> {
        self.nodes.iter()
    }

    /// Apply identifiers from a previous run. Returns how many were applied;
    /// ids the graph no longer knows are logged and ignored.
    pub fn seed_uuids(&mut self, rows: &[UuidMapRow]) -> usize {
        let mut seeded = 0;
        let mut unknown = 0;
        for row in rows {
            match self.index.get(&row.fk) {
                Some(&at) => {
                    self.nodes[at].uuid = Some(row.uuid);
                    seeded += 1;
                }
                None => {
                    warn!(fk = %row.fk, uuid = %row.uuid, "prior uuid map names an unknown record");
                    unknown += 1;
                }
            }
        }
        debug!(seeded, unknown, "seeded prior uuids");
        seeded
    }

    /// The ultimate parent of `record_id`, or `None` when the id is unknown.
    pub fn resolve_parent(&self, record_id: &str) -> Option<&RecordNode> {
        let &at = self.index.get(record_id)?;
        let resolved = self.resolve_index(at, &mut HashMap::new());
        Some(&self.nodes[resolved])
    }

    // Parents that can anchor a resolution: present and dated.
    fn candidates(&self, at: usize) -> Vec<usize> {
        self.nodes[at]
            .parents
            .iter()
            .filter_map(|parent| self.index.get(parent).copied())
            .filter(|&p| self.nodes[p].reference_date.is_some())
            .collect()
    }

    fn better(&self, current: Option<usize>, offered: usize) -> usize {
        match current {
            Some(current) if self.nodes[current].rank().cmp(&self.nodes[offered].rank()) != Ordering::Less => current,
            _ => offered,
        }
    }

    fn frame(&self, node: usize) -> Frame {
        Frame {
            node,
            candidates: self.candidates(node),
            next: 0,
            best: None,
            cut: false,
        }
    }

    /// Depth-first walk with an explicit stack. A parent that is already on
    /// the current chain is skipped, which bounds the walk on cyclic input.
    fn resolve_index(&self, start: usize, memo: &mut HashMap<usize, usize>) -> usize {
        if let Some(&resolved) = memo.get(&start) {
            return resolved;
        }
        let mut on_chain: HashSet<usize> = HashSet::from([start]);
        let mut stack = vec![self.frame(start)];
        let mut result = start;

        loop {
            let Some(top) = stack.last_mut() else {
                break;
            };
            if top.next < top.candidates.len() {
                let parent = top.candidates[top.next];
                top.next += 1;
                if on_chain.contains(&parent) {
                    top.cut = true;
                } else if let Some(&resolved) = memo.get(&parent) {
                    top.best = Some(self.better(top.best, resolved));
                } else {
                    on_chain.insert(parent);
                    stack.push(self.frame(parent));
                }
                continue;
            }

            let Some(done) = stack.pop() else {
                break;
            };
            on_chain.remove(&done.node);
            let resolved = done.best.unwrap_or(done.node);
            if !done.cut {
                memo.insert(done.node, resolved);
            }
            match stack.last_mut() {
                Some(below) => {
                    below.best = Some(self.better(below.best, resolved));
                    below.cut |= done.cut;
                }
                None => result = resolved,
            }
        }
        result
    }

    // Nodes reachable from `start` over edges whose parent is dated, in
    // arena order.
    fn component(&self, start: usize) -> Vec<usize> {
        let mut members = vec![start];
        let mut visited: HashSet<usize> = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(at) = queue.pop_front() {
            let node = &self.nodes[at];
            let dated = node.reference_date.is_some();
            let up = node
                .parents
                .iter()
                .filter_map(|id| self.index.get(id).copied())
                .filter(|&p| self.nodes[p].reference_date.is_some());
            let down = node
                .children
                .iter()
                .filter(|_| dated)
                .filter_map(|id| self.index.get(id).copied());
            for next in up.chain(down).collect::<Vec<_>>() {
                if visited.insert(next) {
                    members.push(next);
                    queue.push_back(next);
                }
            }
        }
        members.sort_unstable();
        members
    }

    /// Give every connected group of records one shared identifier.
    ///
    /// Groups are formed in insertion order and prior identifiers are handed
    /// out in three passes, each identifier to at most one group:
    ///
    /// 1. groups whose resolved root carries a prior uuid take it. When
    ///    several roots carry the same one, the group with the most members
    ///    carrying it wins, then the earliest group;
    /// 2. remaining groups take the first unclaimed prior uuid among the
    ///    visited node and then the other members in insertion order;
    /// 3. groups still without one get a fresh v4.
    pub fn assign_uuids(&mut self) -> AssignmentReport {
        let mut report = AssignmentReport::default();
        let mut seen = vec![false; self.nodes.len()];
        let mut memo = HashMap::new();
        let mut groups: Vec<Group> = Vec::new();

        for at in 0..self.nodes.len() {
            if seen[at] {
                continue;
            }
            let members = self.component(at);
            for &member in &members {
                seen[member] = true;
            }
            let root = self.resolve_index(at, &mut memo);
            groups.push(Group {
                visited: at,
                root,
                members,
                uuid: None,
            });
        }
        report.components = groups.len();

        let mut claimed: HashSet<Uuid> = HashSet::new();
        let mut by_root: Vec<(usize, usize, Uuid)> = groups
            .iter()
            .enumerate()
            .filter_map(|(index, group)| {
                let uuid = self.nodes[group.root].uuid?;
                let holders = group
                    .members
                    .iter()
                    .filter(|&&member| self.nodes[member].uuid == Some(uuid))
                    .count();
                Some((index, holders, uuid))
            })
            .collect();
        by_root.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        for (index, _, uuid) in by_root {
            if claimed.insert(uuid) {
                groups[index].uuid = Some(uuid);
            }
        }

        for group in groups.iter_mut().filter(|group| group.uuid.is_none()) {
            group.uuid = std::iter::once(group.visited)
                .chain(group.members.iter().copied())
                .filter_map(|member| self.nodes[member].uuid)
                .find(|uuid| !claimed.contains(uuid));
            if let Some(uuid) = group.uuid {
                claimed.insert(uuid);
            }
        }

        for group in groups {
            let uuid = match group.uuid {
                Some(uuid) => {
                    report.adopted += 1;
                    uuid
                }
                None => {
                    report.minted += 1;
                    Uuid::new_v4()
                }
            };
            for member in group.members {
                self.nodes[member].uuid = Some(uuid);
            }
        }
        debug!(?report, "assigned project uuids");
        report
    }

    /// `uuid,fk` rows in insertion order; nodes without an identifier yet are
    /// left out.
    pub fn uuid_rows(&self) -> Vec<UuidMapRow> {
        self.nodes
            .iter()
            .filter_map(|node| {
                node.uuid.map(|uuid| UuidMapRow {
                    uuid,
                    fk: node.record_id.clone(),
                })
            })
            .collect()
    }
}
