//! Per-node dependency counters for the octree up and down passes.
//!
//! Every node carries two countdowns. `up_pending` gates the multipole: eight
//! child folds for an internal node, the node's own P2M for a leaf.
//! `down_pending` gates the local expansion: the node's own M2L plus, below
//! the root, the parent's L2L. A counter reaches zero exactly once per pass.
//! Driving one below zero is a double completion and is reported, never absorbed.
//!
//! Aggregate adds are sequenced before the AcqRel decrement, so whoever
//! observes zero with Acquire also observes every contribution.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::task::{BoxId, MAX_LEVEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyError {
    /// A counter was asked to go below zero.
    DoubleCompletion { node: BoxId },
    /// Node deeper than the tree this accumulator covers.
    OutOfTree { node: BoxId },
    /// Upward fold from the root.
    NoParent { node: BoxId },
    /// Storage length differs from `node_count(depth)`.
    StorageMismatch,
    DepthTooLarge,
}

/// f64 stored as bits. Adds go through a CAS loop.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    /// 0.0 has the all-zero bit pattern.
    pub const fn zero() -> Self {
        Self {
            bits: AtomicU64::new(0),
        }
    }

    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    #[inline(always)]
    pub fn load(&self, order: Ordering) -> f64 {
        f64::from_bits(self.bits.load(order))
    }

    #[inline(always)]
    pub fn store(&self, value: f64, order: Ordering) {
        self.bits.store(value.to_bits(), order);
    }

    /// Returns the previous value.
    #[inline]
    pub fn fetch_add(&self, value: f64, order: Ordering) -> f64 {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, next, order, Ordering::Relaxed)
            {
                Ok(prev) => return f64::from_bits(prev),
                Err(c) => current = c,
            }
        }
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::zero()
    }
}

/// Counters and aggregates of one node. Lives in caller-provided storage.
#[derive(Debug, Default)]
pub struct NodeCell {
    up_pending: AtomicU32,
    down_pending: AtomicU32,
    multipole: AtomicF64,
    local: AtomicF64,
    potential: AtomicF64,
}

impl NodeCell {
    pub const fn new() -> Self {
        Self {
            up_pending: AtomicU32::new(0),
            down_pending: AtomicU32::new(0),
            multipole: AtomicF64::zero(),
            local: AtomicF64::zero(),
            potential: AtomicF64::zero(),
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            up_pending: self.up_pending.load(Ordering::Acquire),
            down_pending: self.down_pending.load(Ordering::Acquire),
            multipole: self.multipole.load(Ordering::Relaxed),
            local: self.local.load(Ordering::Relaxed),
            potential: self.potential.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of a [`NodeCell`] for readback.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NodeSnapshot {
    pub up_pending: u32,
    pub down_pending: u32,
    pub multipole: f64,
    pub local: f64,
    pub potential: f64,
}

/// Counters for a full octree of leaves at `depth`, stored level-major.
#[derive(Debug)]
pub struct DependencyAccumulator<S> {
    depth: u8,
    cells: S,
    /// Linear index + 1 of the first double completion, 0 while clean.
    sentinel: AtomicU32,
}

impl<S: AsRef<[NodeCell]>> DependencyAccumulator<S> {
    /// Cells needed for `depth`. Storage must be exactly this long.
    #[inline(always)]
    pub const fn node_count(depth: u8) -> usize {
        BoxId::node_count(depth)
    }

    /// Wraps storage and arms every counter.
    pub fn new(depth: u8, cells: S) -> Result<Self, DependencyError> {
        if depth > MAX_LEVEL {
            return Err(DependencyError::DepthTooLarge);
        }
        if cells.as_ref().len() != Self::node_count(depth) {
            return Err(DependencyError::StorageMismatch);
        }
        let mut acc = Self {
            depth,
            cells,
            sentinel: AtomicU32::new(0),
        };
        acc.reset();
        Ok(acc)
    }

    /// Arm counters, zero aggregates, clear the sentinel.
    pub fn reset(&mut self) {
        let depth = self.depth;
        for (linear, cell) in self.cells.as_ref().iter().enumerate() {
            let Some(node) = BoxId::from_linear(linear) else {
                continue;
            };
            let up = if node.is_leaf_at(depth) { 1 } else { 8 };
            let down = if node.is_root() { 1 } else { 2 };
            cell.up_pending.store(up, Ordering::Relaxed);
            cell.down_pending.store(down, Ordering::Relaxed);
            cell.multipole.store(0.0, Ordering::Relaxed);
            cell.local.store(0.0, Ordering::Relaxed);
            cell.potential.store(0.0, Ordering::Relaxed);
        }
        *self.sentinel.get_mut() = 0;
    }

    #[inline(always)]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    #[inline(always)]
    pub fn cells(&self) -> &[NodeCell] {
        self.cells.as_ref()
    }

    pub fn into_inner(self) -> S {
        self.cells
    }

    #[inline(always)]
    pub fn contains(&self, node: BoxId) -> bool {
        node.level() <= self.depth
    }

    #[inline(always)]
    pub fn is_leaf(&self, node: BoxId) -> bool {
        node.is_leaf_at(self.depth)
    }

    pub fn snapshot(&self, node: BoxId) -> Option<NodeSnapshot> {
        self.cell(node).ok().map(NodeCell::snapshot)
    }

    #[inline]
    pub fn is_up_ready(&self, node: BoxId) -> bool {
        self.cell(node)
            .map(|c| c.up_pending.load(Ordering::Acquire) == 0)
            .unwrap_or(false)
    }

    #[inline]
    pub fn is_down_ready(&self, node: BoxId) -> bool {
        self.cell(node)
            .map(|c| c.down_pending.load(Ordering::Acquire) == 0)
            .unwrap_or(false)
    }

    pub fn multipole(&self, node: BoxId) -> Result<f64, DependencyError> {
        Ok(self.cell(node)?.multipole.load(Ordering::Relaxed))
    }

    pub fn local(&self, node: BoxId) -> Result<f64, DependencyError> {
        Ok(self.cell(node)?.local.load(Ordering::Relaxed))
    }

    pub fn potential(&self, node: BoxId) -> Result<f64, DependencyError> {
        Ok(self.cell(node)?.potential.load(Ordering::Relaxed))
    }

    /// P2M: the leaf's own multipole. Returns true once the leaf is up-ready.
    pub fn settle_up(&self, leaf: BoxId, value: f64) -> Result<bool, DependencyError> {
        let cell = self.cell(leaf)?;
        Ok(self.fold(&cell.multipole, &cell.up_pending, leaf, value)? == 0)
    }

    /// M2M: fold `value` into the parent. `Some(parent)` when this was the last child.
    pub fn contribute_up(
        &self,
        child: BoxId,
        value: f64,
    ) -> Result<Option<BoxId>, DependencyError> {
        self.cell(child)?;
        let parent = child
            .parent()
            .ok_or(DependencyError::NoParent { node: child })?;
        let cell = self.cell(parent)?;
        if self.fold(&cell.multipole, &cell.up_pending, parent, value)? == 0 {
            Ok(Some(parent))
        } else {
            Ok(None)
        }
    }

    /// M2L: the node's own far-field term. Returns true once the node is down-ready.
    pub fn settle_down(&self, node: BoxId, value: f64) -> Result<bool, DependencyError> {
        self.fold_local(node, value)
    }

    /// L2L: the parent's share for one child. Returns true once the child is down-ready.
    pub fn contribute_down(&self, child: BoxId, value: f64) -> Result<bool, DependencyError> {
        self.fold_local(child, value)
    }

    /// P2P and L2P land here. No counter involved.
    pub fn add_potential(&self, leaf: BoxId, value: f64) -> Result<(), DependencyError> {
        self.cell(leaf)?
            .potential
            .fetch_add(value, Ordering::Relaxed);
        Ok(())
    }

    /// First node driven below zero, if any.
    pub fn violation(&self) -> Option<BoxId> {
        match self.sentinel.load(Ordering::Acquire) {
            0 => None,
            marked => BoxId::from_linear(marked as usize - 1),
        }
    }

    #[inline]
    fn fold_local(&self, node: BoxId, value: f64) -> Result<bool, DependencyError> {
        let cell = self.cell(node)?;
        Ok(self.fold(&cell.local, &cell.down_pending, node, value)? == 0)
    }

    /// Add into `total`, then count the arrival. The add happens first so the
    /// decrement publishes it. A refused arrival takes its value back out.
    #[inline]
    fn fold(
        &self,
        total: &AtomicF64,
        counter: &AtomicU32,
        node: BoxId,
        value: f64,
    ) -> Result<u32, DependencyError> {
        total.fetch_add(value, Ordering::Relaxed);
        self.decrement(counter, node).map_err(|e| {
            total.fetch_add(-value, Ordering::Relaxed);
            e
        })
    }

    #[inline(always)]
    fn cell(&self, node: BoxId) -> Result<&NodeCell, DependencyError> {
        if !self.contains(node) {
            return Err(DependencyError::OutOfTree { node });
        }
        self.cells
            .as_ref()
            .get(node.linear())
            .ok_or(DependencyError::OutOfTree { node })
    }

    /// CAS so a counter at zero is never wrapped. Returns the new count.
    #[inline]
    fn decrement(&self, counter: &AtomicU32, node: BoxId) -> Result<u32, DependencyError> {
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current == 0 {
                self.record_violation(node);
                return Err(DependencyError::DoubleCompletion { node });
            }
            match counter.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current - 1),
                Err(c) => current = c,
            }
        }
    }

    #[inline]
    fn record_violation(&self, node: BoxId) {
        let marked = node.linear() as u32 + 1;
        // First one wins.
        let _ = self
            .sentinel
            .compare_exchange(0, marked, Ordering::AcqRel, Ordering::Relaxed);
    }
}
