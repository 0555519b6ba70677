//! Sequence CRDT engine for plain text.
//!
//! Every character is an element with a unique [`OpId`]. Elements form a
//! linked list stored in an arena; deletion only sets a tombstone flag, so
//! ids stay resolvable forever and remote ops can always find their anchors.
//!
//! ```text
//!   head ─► [H 1@A] ─► [i 1@B] ─► [e 2@A]† ─► [! 3@A] ─► ∅
//!                                   † tombstone (invisible)
//! ```
//!
//! Concurrent inserts are ordered with the YATA integration rule: an
//! element is placed between its left and right origin, and conflicts with
//! other elements sharing that gap are resolved by origin structure, then
//! by site id (higher site first). The same rule runs on every replica, so
//! all replicas that applied the same set of ops hold the same sequence.
//!
//! Ops whose causal dependencies are missing are parked in a pending buffer
//! and retried after every successful apply.
//!
//! Reference: Nicolaescu et al., "Near Real-Time Peer-to-Peer Shared
//! Editing on Extensible Data Types" (GROUP 2016)

mod id;
mod operation;

pub use id::{OpId, SiteId, StateVector};
pub use operation::Operation;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised by local edits. Remote ops never error; they apply, are
/// ignored as duplicates, or wait in the pending buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("insert position {position} out of bounds (length {length})")]
    PositionOutOfBounds { position: usize, length: usize },
    #[error("delete range {position}..{end} out of bounds (length {length})")]
    RangeOutOfBounds {
        position: usize,
        end: usize,
        length: usize,
    },
}

/// Result of feeding one remote op into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The op applied, together with this many previously buffered ops
    /// (the count includes the op itself).
    Applied(usize),
    /// Already seen; nothing changed.
    Duplicate,
    /// Parked until its dependencies arrive.
    Buffered,
}

impl ApplyOutcome {
    /// Number of ops that changed the document.
    pub fn applied(&self) -> usize {
        match self {
            ApplyOutcome::Applied(n) => *n,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Element {
    id: OpId,
    value: char,
    left_origin: Option<OpId>,
    right_origin: Option<OpId>,
    deleted: bool,
    next: Option<usize>,
}

#[derive(Debug, Clone)]
struct PendingOp {
    op: Operation,
    buffered_at: Instant,
}

enum Step {
    Applied,
    Duplicate,
    Missing,
}

/// One replica of a text document.
#[derive(Debug, Clone)]
pub struct Document {
    site: SiteId,
    /// Arena of all elements ever integrated, tombstones included.
    elements: Vec<Element>,
    index: HashMap<OpId, usize>,
    head: Option<usize>,
    visible_len: usize,
    state_vector: StateVector,
    /// Applied ops in application order (a causal order).
    log: Vec<Operation>,
    pending: Vec<PendingOp>,
}

impl Document {
    /// Create an empty replica owned by `site`.
    pub fn new(site: SiteId) -> Self {
        Self {
            site,
            elements: Vec::new(),
            index: HashMap::new(),
            head: None,
            visible_len: 0,
            state_vector: StateVector::new(),
            log: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Rebuild a replica by replaying a previously exported op log.
    pub fn from_operations(site: SiteId, ops: impl IntoIterator<Item = Operation>) -> Self {
        let mut doc = Self::new(site);
        for op in ops {
            doc.apply_remote(op);
        }
        doc
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible_len
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len == 0
    }

    /// Number of integrated elements, tombstones included.
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Number of remote ops waiting for missing dependencies.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Visible text.
    pub fn content(&self) -> String {
        self.walk()
            .map(|i| &self.elements[i])
            .filter(|e| !e.deleted)
            .map(|e| e.value)
            .collect()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    /// Every applied op, in an order that can be replayed on a fresh replica.
    pub fn operations(&self) -> &[Operation] {
        &self.log
    }

    /// Ops the holder of `remote` has not seen yet, in causal order.
    pub fn ops_since(&self, remote: &StateVector) -> Vec<Operation> {
        self.log
            .iter()
            .filter(|op| !remote.contains(op.id()))
            .cloned()
            .collect()
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Insert `text` so that its first character lands at visible `position`.
    ///
    /// Returns one op per character, ready to broadcast.
    pub fn local_insert(&mut self, position: usize, text: &str) -> Result<Vec<Operation>, EngineError> {
        if position > self.visible_len {
            return Err(EngineError::PositionOutOfBounds {
                position,
                length: self.visible_len,
            });
        }

        let mut left = match position {
            0 => None,
            p => self.nth_visible(p - 1),
        };
        let right = match left {
            Some(l) => self.elements[l].next,
            None => self.head,
        };
        let right_origin = right.map(|r| self.elements[r].id);

        let mut ops = Vec::with_capacity(text.len());
        for value in text.chars() {
            let id = self.next_id();
            let left_origin = left.map(|l| self.elements[l].id);
            let idx = self.link_after(left, id, value, left_origin, right_origin);
            self.visible_len += 1;

            let op = Operation::Insert {
                id,
                value,
                left_origin,
                right_origin,
            };
            self.record(op.clone());
            ops.push(op);
            left = Some(idx);
        }

        Ok(ops)
    }

    /// Tombstone `length` visible characters starting at `position`.
    pub fn local_delete(&mut self, position: usize, length: usize) -> Result<Vec<Operation>, EngineError> {
        let end = position.saturating_add(length);
        if end > self.visible_len {
            return Err(EngineError::RangeOutOfBounds {
                position,
                end,
                length: self.visible_len,
            });
        }

        let targets: Vec<usize> = self
            .walk()
            .filter(|&i| !self.elements[i].deleted)
            .skip(position)
            .take(length)
            .collect();

        let mut ops = Vec::with_capacity(targets.len());
        for idx in targets {
            let id = self.next_id();
            let target = self.elements[idx].id;
            self.elements[idx].deleted = true;
            self.visible_len -= 1;

            let op = Operation::Delete { id, target };
            self.record(op.clone());
            ops.push(op);
        }

        Ok(ops)
    }

    // ─── Remote ops ───────────────────────────────────────────────────

    /// Integrate a remote op.
    ///
    /// Idempotent: an op that was already applied is reported as
    /// [`ApplyOutcome::Duplicate`] and leaves the document untouched.
    pub fn apply_remote(&mut self, op: Operation) -> ApplyOutcome {
        self.apply_remote_at(op, Instant::now())
    }

    /// [`apply_remote`](Self::apply_remote) with an explicit arrival time for
    /// the pending buffer, for callers that expire it on their own clock.
    pub fn apply_remote_at(&mut self, op: Operation, now: Instant) -> ApplyOutcome {
        match self.try_apply(&op) {
            Step::Applied => ApplyOutcome::Applied(1 + self.drain_pending()),
            Step::Duplicate => ApplyOutcome::Duplicate,
            Step::Missing => {
                let id = op.id();
                if !self.pending.iter().any(|p| p.op.id() == id) {
                    log::trace!("Buffering op {id}: dependencies missing");
                    self.pending.push(PendingOp { op, buffered_at: now });
                }
                ApplyOutcome::Buffered
            }
        }
    }

    /// Drop buffered ops that have waited at least `timeout`.
    ///
    /// The returned ops are gone from the buffer; the caller is expected to
    /// request a resync so their dependencies (and the ops themselves) are
    /// delivered again.
    pub fn expire_pending(&mut self, now: Instant, timeout: Duration) -> Vec<Operation> {
        let (expired, kept): (Vec<PendingOp>, Vec<PendingOp>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| now.saturating_duration_since(p.buffered_at) >= timeout);
        self.pending = kept;
        expired.into_iter().map(|p| p.op).collect()
    }

    fn try_apply(&mut self, op: &Operation) -> Step {
        let id = op.id();
        if self.state_vector.contains(id) {
            return Step::Duplicate;
        }
        if id.counter != self.state_vector.get(id.site) + 1 {
            return Step::Missing;
        }
        if op.dependencies().any(|dep| !self.index.contains_key(&dep)) {
            return Step::Missing;
        }

        match op {
            Operation::Insert {
                id,
                value,
                left_origin,
                right_origin,
            } => {
                self.integrate(*id, *value, *left_origin, *right_origin);
                self.visible_len += 1;
            }
            Operation::Delete { target, .. } => {
                if let Some(&idx) = self.index.get(target) {
                    let element = &mut self.elements[idx];
                    if !element.deleted {
                        element.deleted = true;
                        self.visible_len -= 1;
                    }
                }
            }
        }

        self.record(op.clone());
        Step::Applied
    }

    /// Retry buffered ops until no further progress is made.
    fn drain_pending(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let mut progressed = false;
            let waiting = std::mem::take(&mut self.pending);
            let mut still_waiting = Vec::with_capacity(waiting.len());

            for pending in waiting {
                match self.try_apply(&pending.op) {
                    Step::Applied => {
                        applied += 1;
                        progressed = true;
                    }
                    Step::Duplicate => progressed = true,
                    Step::Missing => still_waiting.push(pending),
                }
            }

            self.pending = still_waiting;
            if !progressed || self.pending.is_empty() {
                return applied;
            }
        }
    }

    /// YATA integration: find the slot for a new element between its
    /// origins, then link it in.
    fn integrate(
        &mut self,
        id: OpId,
        value: char,
        left_origin: Option<OpId>,
        right_origin: Option<OpId>,
    ) -> usize {
        let mut left = left_origin.and_then(|o| self.index.get(&o).copied());
        let right = right_origin.and_then(|o| self.index.get(&o).copied());
        let mut cursor = match left {
            Some(l) => self.elements[l].next,
            None => self.head,
        };

        let mut before_origin: HashSet<usize> = HashSet::new();
        let mut conflicting: HashSet<usize> = HashSet::new();

        while let Some(o) = cursor {
            if Some(o) == right {
                break;
            }
            before_origin.insert(o);
            conflicting.insert(o);

            let other = &self.elements[o];
            if other.left_origin == left_origin {
                if other.id.site > id.site {
                    left = Some(o);
                    conflicting.clear();
                } else if other.right_origin == right_origin {
                    break;
                }
            } else {
                let other_left = other.left_origin.and_then(|oo| self.index.get(&oo).copied());
                match other_left {
                    Some(ol) if before_origin.contains(&ol) => {
                        if !conflicting.contains(&ol) {
                            left = Some(o);
                            conflicting.clear();
                        }
                    }
                    _ => break,
                }
            }
            cursor = self.elements[o].next;
        }

        self.link_after(left, id, value, left_origin, right_origin)
    }

    fn link_after(
        &mut self,
        left: Option<usize>,
        id: OpId,
        value: char,
        left_origin: Option<OpId>,
        right_origin: Option<OpId>,
    ) -> usize {
        let idx = self.elements.len();
        let next = match left {
            Some(l) => self.elements[l].next.replace(idx),
            None => self.head.replace(idx),
        };
        self.elements.push(Element {
            id,
            value,
            left_origin,
            right_origin,
            deleted: false,
            next,
        });
        self.index.insert(id, idx);
        idx
    }

    fn record(&mut self, op: Operation) {
        self.state_vector.observe(op.id());
        self.log.push(op);
    }

    fn next_id(&self) -> OpId {
        OpId::new(self.site, self.state_vector.get(self.site) + 1)
    }

    /// Arena index of the `n`-th visible element (0-based).
    fn nth_visible(&self, n: usize) -> Option<usize> {
        self.walk().filter(|&i| !self.elements[i].deleted).nth(n)
    }

    /// Arena indices in document order.
    fn walk(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.head, move |&i| self.elements[i].next)
    }
}
