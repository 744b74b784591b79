//! Bounded merge-base walk used to compute ahead/behind counts.
//!
//! Both tips are painted with a reachability flag and the flags are pushed
//! down to parents, newest commit first. A commit carrying both flags is a
//! common ancestor and so is everything below it. A commit whose flag grows
//! after it was expanded is expanded again, so the common flag always reaches
//! every ancestor it covers.
//!
//! The walk settles once no single-tip commit is queued and every queued
//! commit is older than every single-tip commit: with commit times that never
//! decrease from parent to child, nothing left in the queue can reach a
//! single-tip commit any more. Commits sharing a timestamp are never cut off,
//! so histories written within one second are walked to the end.

use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use crate::model::{Divergence, ObjectId};

const LOCAL: u8 = 0b01;
const REMOTE: u8 = 0b10;
const BOTH: u8 = LOCAL | REMOTE;

/// What the walk needs to know about one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    /// Committer time, seconds since the epoch.
    pub time: i64,
    pub parents: Vec<ObjectId>,
}

/// Queue entry: newest commit first, ties in discovery order.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Queued {
    time: i64,
    order: std::cmp::Reverse<u64>,
    id: ObjectId,
}

/// Compute the divergence of `local` relative to `remote`.
///
/// `lineage` resolves the commit time and parent ids of a commit. At most
/// `max_walk` commits are expanded; when the bound is hit before the walk
/// settles, or when the two histories share no commit, the result is
/// [`Divergence::Unknown`].
pub fn divergence<E, F>(
    local: &ObjectId,
    remote: &ObjectId,
    max_walk: usize,
    mut lineage: F,
) -> Result<Divergence, E>
where
    F: FnMut(&ObjectId) -> Result<Lineage, E>,
{
    if local == remote {
        return Ok(Divergence::Known {
            ahead: 0,
            behind: 0,
        });
    }

    let mut nodes: HashMap<ObjectId, Lineage> = HashMap::new();
    let mut flags: HashMap<ObjectId, u8> = HashMap::new();
    // Commits reached from one tip only, oldest first.
    let mut single: BTreeSet<(i64, ObjectId)> = BTreeSet::new();
    let mut queue: BinaryHeap<Queued> = BinaryHeap::new();
    let mut queued: HashSet<ObjectId> = HashSet::new();
    // Queued commits not yet known to be common.
    let mut pending = 0usize;
    let mut order = 0u64;

    for (tip, flag) in [(local, LOCAL), (remote, REMOTE)] {
        let node = lineage(tip)?;
        let time = node.time;
        nodes.insert(tip.clone(), node);
        flags.insert(tip.clone(), flag);
        single.insert((time, tip.clone()));
        queued.insert(tip.clone());
        queue.push(Queued {
            time,
            order: std::cmp::Reverse(order),
            id: tip.clone(),
        });
        order += 1;
        pending += 1;
    }

    let mut walked = 0usize;

    loop {
        if pending == 0 {
            let settled = match (single.first(), queue.peek()) {
                (Some((oldest, _)), Some(next)) => next.time < *oldest,
                _ => true,
            };
            if settled {
                break;
            }
        }

        let Some(Queued { id, .. }) = queue.pop() else {
            break;
        };
        queued.remove(&id);

        let flag = flags.get(&id).copied().unwrap_or(0);
        if flag != BOTH {
            pending -= 1;
        }

        walked += 1;
        if walked > max_walk {
            return Ok(Divergence::Unknown);
        }

        let parents = nodes
            .get(&id)
            .map(|node| node.parents.clone())
            .unwrap_or_default();
        for parent in parents {
            let time = match nodes.get(&parent) {
                Some(node) => node.time,
                None => {
                    let node = lineage(&parent)?;
                    let time = node.time;
                    nodes.insert(parent.clone(), node);
                    time
                }
            };

            let current = flags.get(&parent).copied().unwrap_or(0);
            let merged = current | flag;
            if merged == current {
                continue;
            }
            flags.insert(parent.clone(), merged);

            if merged == BOTH {
                single.remove(&(time, parent.clone()));
            } else {
                single.insert((time, parent.clone()));
            }

            if queued.contains(&parent) {
                if merged == BOTH {
                    pending -= 1;
                }
            } else {
                // Unseen, or expanded with a narrower flag: (re)expand.
                queued.insert(parent.clone());
                if merged != BOTH {
                    pending += 1;
                }
                queue.push(Queued {
                    time,
                    order: std::cmp::Reverse(order),
                    id: parent,
                });
                order += 1;
            }
        }
    }

    if !flags.values().any(|flag| *flag == BOTH) {
        return Ok(Divergence::Unknown);
    }

    let ahead = flags.values().filter(|flag| **flag == LOCAL).count();
    let behind = flags.values().filter(|flag| **flag == REMOTE).count();

    Ok(Divergence::Known { ahead, behind })
}
