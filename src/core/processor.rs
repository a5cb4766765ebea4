//! Task dispatch. One closed `match` per operator, no vtables.

use super::accumulator::{DependencyAccumulator, DependencyError, NodeCell};
use super::task::{BoxId, OperatorKind, Routine, Successors, Task};

/// Numeric kernels behind each operator. Only scalar contributions cross this seam.
///
/// Translations default to the identity.
pub trait Operators: Sync {
    /// Near-field term for one leaf.
    fn p2p(&self, leaf: BoxId) -> f64;

    /// Multipole of the particles in one leaf.
    fn p2m(&self, leaf: BoxId) -> f64;

    fn m2m(&self, _child: BoxId, multipole: f64) -> f64 {
        multipole
    }

    fn m2l(&self, _node: BoxId, multipole: f64) -> f64 {
        multipole
    }

    fn l2l(&self, _child: BoxId, local: f64) -> f64 {
        local
    }

    fn l2p(&self, _leaf: BoxId, local: f64) -> f64 {
        local
    }
}

/// Unit mass per leaf, unit self-interaction, identity translations.
///
/// With leaves at depth `D` a node at level `L` ends with multipole `8^(D-L)`,
/// and its local is the sum of the multipoles on its root path.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitOperators;

impl Operators for UnitOperators {
    fn p2p(&self, _leaf: BoxId) -> f64 {
        1.0
    }

    fn p2m(&self, _leaf: BoxId) -> f64 {
        1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// Word that decodes to no operator or no node.
    MalformedTask,
    NotLeaf { node: BoxId },
    IsLeaf { node: BoxId },
    NoParent { node: BoxId },
    /// Input aggregate not complete yet.
    NotReady { node: BoxId },
    /// More follow-up work than one execution can carry.
    TooManySuccessors { node: BoxId },
    Dependency(DependencyError),
}

impl From<DependencyError> for DispatchError {
    fn from(e: DependencyError) -> Self {
        DispatchError::Dependency(e)
    }
}

/// Binds operators to the counters they feed.
pub struct Processor<'a, O: ?Sized, S> {
    ops: &'a O,
    acc: &'a DependencyAccumulator<S>,
}

impl<'a, O, S> Processor<'a, O, S>
where
    O: Operators + ?Sized,
    S: AsRef<[NodeCell]>,
{
    pub fn new(ops: &'a O, acc: &'a DependencyAccumulator<S>) -> Self {
        Self { ops, acc }
    }

    #[inline(always)]
    pub fn accumulator(&self) -> &'a DependencyAccumulator<S> {
        self.acc
    }

    /// Run one task to completion and return the work it unlocked.
    pub fn execute(&self, task: Task) -> Result<Successors, DispatchError> {
        let (op, node) = task.decode().ok_or(DispatchError::MalformedTask)?;
        if !self.acc.contains(node) {
            return Err(DependencyError::OutOfTree { node }.into());
        }
        if op.needs_leaf() && !self.acc.is_leaf(node) {
            return Err(DispatchError::NotLeaf { node });
        }

        let acc = self.acc;
        let mut next = Successors::new();
        match op.routine() {
            Routine::Pairwise => {
                acc.add_potential(node, self.ops.p2p(node))?;
            }
            Routine::AggregateUp => {
                let settled = if op == OperatorKind::ParticleToMultipole {
                    acc.settle_up(node, self.ops.p2m(node))?.then_some(node)
                } else {
                    if node.is_root() {
                        return Err(DispatchError::NoParent { node });
                    }
                    self.require_up(node)?;
                    let folded = self.ops.m2m(node, acc.multipole(node)?);
                    acc.contribute_up(node, folded)?
                };
                if let Some(ready) = settled {
                    if !ready.is_root() {
                        unlock(&mut next, OperatorKind::MultipoleToMultipole, ready)?;
                    }
                    unlock(&mut next, OperatorKind::MultipoleToLocal, ready)?;
                }
            }
            Routine::TranslateAcross => {
                self.require_up(node)?;
                let translated = self.ops.m2l(node, acc.multipole(node)?);
                if acc.settle_down(node, translated)? {
                    unlock(&mut next, self.descend(node), node)?;
                }
            }
            Routine::TranslateDown => {
                let children = match node.children() {
                    Some(children) if !acc.is_leaf(node) => children,
                    _ => return Err(DispatchError::IsLeaf { node }),
                };
                self.require_down(node)?;
                let local = acc.local(node)?;
                for child in children {
                    if acc.contribute_down(child, self.ops.l2l(child, local))? {
                        unlock(&mut next, self.descend(child), child)?;
                    }
                }
            }
            Routine::AggregateDown => {
                self.require_down(node)?;
                let local = acc.local(node)?;
                acc.add_potential(node, self.ops.l2p(node, local))?;
            }
        }
        Ok(next)
    }

    #[inline(always)]
    fn descend(&self, node: BoxId) -> OperatorKind {
        if self.acc.is_leaf(node) {
            OperatorKind::LocalToParticle
        } else {
            OperatorKind::LocalToLocal
        }
    }

    #[inline(always)]
    fn require_up(&self, node: BoxId) -> Result<(), DispatchError> {
        if self.acc.is_up_ready(node) {
            Ok(())
        } else {
            Err(DispatchError::NotReady { node })
        }
    }

    #[inline(always)]
    fn require_down(&self, node: BoxId) -> Result<(), DispatchError> {
        if self.acc.is_down_ready(node) {
            Ok(())
        } else {
            Err(DispatchError::NotReady { node })
        }
    }
}

#[inline(always)]
fn unlock(next: &mut Successors, op: OperatorKind, node: BoxId) -> Result<(), DispatchError> {
    next.try_push(Task::new(op, node))
        .map_err(|_| DispatchError::TooManySuccessors { node })
}
