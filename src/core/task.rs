//! Tasks: an operator kind aimed at one octree node. Plain values, one queue word each.

use arrayvec::ArrayVec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::ring::SlotValue;

/// Deepest supported octree level. 8^10 boxes still index in 32 bits.
pub const MAX_LEVEL: u8 = 10;

/// Most follow-up tasks one execution can unlock (an L2L readying all children).
pub const MAX_SUCCESSORS: usize = 8;

/// The closed set of FMM operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperatorKind {
    ParticleToParticle = 0,
    ParticleToMultipole = 1,
    MultipoleToMultipole = 2,
    MultipoleToLocal = 3,
    LocalToLocal = 4,
    LocalToParticle = 5,
}

/// Accumulation routine an operator lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Routine {
    Pairwise = 0,
    AggregateUp = 1,
    TranslateAcross = 2,
    TranslateDown = 3,
    AggregateDown = 4,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 6] = [
        OperatorKind::ParticleToParticle,
        OperatorKind::ParticleToMultipole,
        OperatorKind::MultipoleToMultipole,
        OperatorKind::MultipoleToLocal,
        OperatorKind::LocalToLocal,
        OperatorKind::LocalToParticle,
    ];

    #[inline(always)]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OperatorKind::ParticleToParticle),
            1 => Some(OperatorKind::ParticleToMultipole),
            2 => Some(OperatorKind::MultipoleToMultipole),
            3 => Some(OperatorKind::MultipoleToLocal),
            4 => Some(OperatorKind::LocalToLocal),
            5 => Some(OperatorKind::LocalToParticle),
            _ => None,
        }
    }

    pub const fn short_name(&self) -> &'static str {
        match self {
            OperatorKind::ParticleToParticle => "p2p",
            OperatorKind::ParticleToMultipole => "p2m",
            OperatorKind::MultipoleToMultipole => "m2m",
            OperatorKind::MultipoleToLocal => "m2l",
            OperatorKind::LocalToLocal => "l2l",
            OperatorKind::LocalToParticle => "l2p",
        }
    }

    #[inline(always)]
    pub const fn routine(&self) -> Routine {
        match self {
            OperatorKind::ParticleToParticle => Routine::Pairwise,
            OperatorKind::ParticleToMultipole | OperatorKind::MultipoleToMultipole => {
                Routine::AggregateUp
            }
            OperatorKind::MultipoleToLocal => Routine::TranslateAcross,
            OperatorKind::LocalToLocal => Routine::TranslateDown,
            OperatorKind::LocalToParticle => Routine::AggregateDown,
        }
    }

    /// Only leaves carry particles.
    #[inline(always)]
    pub const fn needs_leaf(&self) -> bool {
        matches!(
            self,
            OperatorKind::ParticleToParticle
                | OperatorKind::ParticleToMultipole
                | OperatorKind::LocalToParticle
        )
    }
}

/// Octree node: level plus Morton index within the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxId {
    level: u8,
    index: u32,
}

impl BoxId {
    pub const ROOT: BoxId = BoxId { level: 0, index: 0 };

    /// Boxes on one level: 8^level.
    #[inline(always)]
    pub const fn boxes_at(level: u8) -> u32 {
        1u32 << (3 * level as u32)
    }

    /// Dense storage offset of the first box on `level`.
    #[inline(always)]
    pub const fn level_offset(level: u8) -> usize {
        (((1u64 << (3 * level as u64)) - 1) / 7) as usize
    }

    /// Nodes in a full octree whose leaves sit at `depth`.
    #[inline(always)]
    pub const fn node_count(depth: u8) -> usize {
        Self::level_offset(depth + 1)
    }

    pub const fn new(level: u8, index: u32) -> Option<Self> {
        if level > MAX_LEVEL || index >= Self::boxes_at(level) {
            return None;
        }
        Some(Self { level, index })
    }

    /// Interleave coordinate bits, x most significant within each octant.
    pub const fn from_coords(level: u8, x: u32, y: u32, z: u32) -> Option<Self> {
        if level > MAX_LEVEL {
            return None;
        }
        let side = 1u32 << level;
        if x >= side || y >= side || z >= side {
            return None;
        }
        let mut index = 0u32;
        let mut bit = 0;
        while bit < level as u32 {
            index |= ((x >> bit) & 1) << (3 * bit + 2);
            index |= ((y >> bit) & 1) << (3 * bit + 1);
            index |= ((z >> bit) & 1) << (3 * bit);
            bit += 1;
        }
        Some(Self { level, index })
    }

    pub const fn coords(&self) -> (u32, u32, u32) {
        let (mut x, mut y, mut z) = (0u32, 0u32, 0u32);
        let mut bit = 0;
        while bit < self.level as u32 {
            x |= ((self.index >> (3 * bit + 2)) & 1) << bit;
            y |= ((self.index >> (3 * bit + 1)) & 1) << bit;
            z |= ((self.index >> (3 * bit)) & 1) << bit;
            bit += 1;
        }
        (x, y, z)
    }

    #[inline(always)]
    pub const fn level(&self) -> u8 {
        self.level
    }

    #[inline(always)]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[inline(always)]
    pub const fn is_root(&self) -> bool {
        self.level == 0
    }

    #[inline(always)]
    pub const fn is_leaf_at(&self, depth: u8) -> bool {
        self.level == depth
    }

    /// Position among the parent's eight children.
    #[inline(always)]
    pub const fn octant(&self) -> u8 {
        (self.index & 7) as u8
    }

    #[inline(always)]
    pub const fn parent(&self) -> Option<BoxId> {
        if self.level == 0 {
            return None;
        }
        Some(BoxId {
            level: self.level - 1,
            index: self.index >> 3,
        })
    }

    /// Child in octant (i, j, k), each 0 or 1.
    #[inline(always)]
    pub const fn child(&self, i: u8, j: u8, k: u8) -> Option<BoxId> {
        if self.level >= MAX_LEVEL || i > 1 || j > 1 || k > 1 {
            return None;
        }
        let octant = ((i as u32) << 2) | ((j as u32) << 1) | k as u32;
        Some(BoxId {
            level: self.level + 1,
            index: (self.index << 3) | octant,
        })
    }

    pub const fn children(&self) -> Option<[BoxId; 8]> {
        if self.level >= MAX_LEVEL {
            return None;
        }
        let mut out = [BoxId::ROOT; 8];
        let mut octant = 0;
        while octant < 8 {
            out[octant] = BoxId {
                level: self.level + 1,
                index: (self.index << 3) | octant as u32,
            };
            octant += 1;
        }
        Some(out)
    }

    #[inline(always)]
    pub const fn linear(&self) -> usize {
        Self::level_offset(self.level) + self.index as usize
    }

    pub const fn from_linear(linear: usize) -> Option<BoxId> {
        let mut level = 0u8;
        while level <= MAX_LEVEL {
            let start = Self::level_offset(level);
            let end = start + Self::boxes_at(level) as usize;
            if linear < end {
                return Some(BoxId {
                    level,
                    index: (linear - start) as u32,
                });
            }
            level += 1;
        }
        None
    }
}

/// One unit of work. 8 bytes of POD so it travels through the queue as a word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Task {
    op: u8,
    level: u8,
    _pad: [u8; 2],
    index: u32,
}

const _: () = {
    assert!(core::mem::size_of::<Task>() == 8);
};

impl Task {
    /// Marks an empty mailbox slot. Never decodes.
    pub const VACANT: Task = Task {
        op: u8::MAX,
        level: u8::MAX,
        _pad: [0u8; 2],
        index: u32::MAX,
    };

    #[inline(always)]
    pub const fn new(op: OperatorKind, node: BoxId) -> Self {
        Self {
            op: op as u8,
            level: node.level,
            _pad: [0u8; 2],
            index: node.index,
        }
    }

    #[inline(always)]
    pub const fn is_vacant(&self) -> bool {
        self.op == u8::MAX
    }

    #[inline(always)]
    pub const fn operator(&self) -> Option<OperatorKind> {
        OperatorKind::from_u8(self.op)
    }

    #[inline(always)]
    pub const fn node(&self) -> Option<BoxId> {
        BoxId::new(self.level, self.index)
    }

    /// Both halves validated, or `None` for a word that was never a task.
    #[inline]
    pub const fn decode(&self) -> Option<(OperatorKind, BoxId)> {
        match (self.operator(), self.node()) {
            (Some(op), Some(node)) => Some((op, node)),
            _ => None,
        }
    }
}

impl SlotValue for Task {
    #[inline(always)]
    fn into_word(self) -> u64 {
        zerocopy::transmute!(self)
    }

    #[inline(always)]
    fn from_word(word: u64) -> Self {
        zerocopy::transmute!(word)
    }
}

/// Lifecycle as seen by the scheduler. The task value itself keeps no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Queued = 0,
    Dispatched = 1,
    Complete = 2,
}

/// Follow-up tasks unlocked by one execution. Fixed capacity, no heap.
pub type Successors = ArrayVec<Task, MAX_SUCCESSORS>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_child_inverse() {
        let node = BoxId::new(3, 0o517).unwrap();
        for (octant, child) in node.children().unwrap().iter().enumerate() {
            assert_eq!(child.parent(), Some(node));
            assert_eq!(child.octant() as usize, octant);
        }
        assert_eq!(node.child(1, 0, 1).unwrap().octant(), 0b101);
        assert_eq!(BoxId::ROOT.parent(), None);
    }

    #[test]
    fn test_coords_roundtrip() {
        let node = BoxId::from_coords(4, 9, 3, 14).unwrap();
        assert_eq!(node.coords(), (9, 3, 14));
        assert_eq!(BoxId::from_coords(2, 4, 0, 0), None);
    }

    #[test]
    fn test_linear_layout() {
        assert_eq!(BoxId::node_count(0), 1);
        assert_eq!(BoxId::node_count(2), 1 + 8 + 64);
        assert_eq!(BoxId::ROOT.linear(), 0);
        assert_eq!(BoxId::new(1, 0).unwrap().linear(), 1);
        assert_eq!(BoxId::new(2, 0).unwrap().linear(), 9);

        for linear in 0..BoxId::node_count(3) {
            let node = BoxId::from_linear(linear).unwrap();
            assert_eq!(node.linear(), linear);
        }
    }

    #[test]
    fn test_task_word_roundtrip() {
        let node = BoxId::new(5, 12345).unwrap();
        let task = Task::new(OperatorKind::MultipoleToLocal, node);
        let back = Task::from_word(task.into_word());

        assert_eq!(back, task);
        assert_eq!(back.decode(), Some((OperatorKind::MultipoleToLocal, node)));
    }

    #[test]
    fn test_vacant_never_decodes() {
        let vacant = Task::from_word(Task::VACANT.into_word());
        assert!(vacant.is_vacant());
        assert_eq!(vacant.decode(), None);
    }

    #[test]
    fn test_routine_mapping_is_total() {
        for op in OperatorKind::ALL {
            assert_eq!(OperatorKind::from_u8(op as u8), Some(op));
            let _ = op.routine();
        }
        assert_eq!(
            OperatorKind::ParticleToMultipole.routine(),
            OperatorKind::MultipoleToMultipole.routine()
        );
        assert_eq!(OperatorKind::from_u8(6), None);
    }

    #[test]
    fn test_successors_refuse_overflow() {
        let mut successors = Successors::new();
        let task = Task::new(OperatorKind::LocalToLocal, BoxId::ROOT);
        for _ in 0..MAX_SUCCESSORS {
            successors.try_push(task).unwrap();
        }
        assert!(successors.try_push(task).is_err());
        assert_eq!(successors.len(), MAX_SUCCESSORS);
    }
}
