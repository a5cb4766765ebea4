//! Dependency counters: arrival order must not matter, and zero is reached once.

#![cfg(feature = "std")]

use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;

use lanesched::core::{BoxId, DependencyAccumulator, DependencyError, NodeCell};
use lanesched::device::{Device, KernelError, NdRange};

fn storage(depth: u8) -> Vec<NodeCell> {
    (0..BoxId::node_count(depth)).map(|_| NodeCell::new()).collect()
}

fn arrival_order() -> impl Strategy<Value = Vec<usize>> {
    Just((0..8).collect::<Vec<usize>>()).prop_shuffle()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn up_pass_commutative(
        order in arrival_order(),
        values in prop::array::uniform8(0u32..10_000),
    ) {
        let acc = DependencyAccumulator::new(1, storage(1)).unwrap();
        let children = BoxId::ROOT.children().unwrap();
        for child in children {
            acc.settle_up(child, 0.0).unwrap();
        }

        let mut released = Vec::new();
        for (step, &octant) in order.iter().enumerate() {
            let ready = acc.contribute_up(children[octant], values[octant] as f64).unwrap();
            if let Some(parent) = ready {
                released.push((step, parent));
            }
        }

        let total: f64 = values.iter().map(|&v| v as f64).sum();
        prop_assert_eq!(released, vec![(7, BoxId::ROOT)]);
        prop_assert_eq!(acc.multipole(BoxId::ROOT).unwrap(), total);
        prop_assert!(acc.is_up_ready(BoxId::ROOT));
        prop_assert_eq!(acc.violation(), None);
    }

    #[test]
    fn down_pass_ready_after_both_inputs(
        m2l_first in any::<bool>(),
        local in 0u32..1000,
        translated in 0u32..1000,
        octant in 0usize..8,
    ) {
        let acc = DependencyAccumulator::new(1, storage(1)).unwrap();
        let child = BoxId::ROOT.children().unwrap()[octant];

        let (first, second) = if m2l_first {
            (acc.settle_down(child, translated as f64), acc.contribute_down(child, local as f64))
        } else {
            (acc.contribute_down(child, local as f64), acc.settle_down(child, translated as f64))
        };

        prop_assert_eq!(first, Ok(false));
        prop_assert_eq!(second, Ok(true));
        prop_assert_eq!(acc.local(child).unwrap(), (local + translated) as f64);
    }

    #[test]
    fn extra_contribution_always_detected(extra in 0usize..8) {
        let acc = DependencyAccumulator::new(1, storage(1)).unwrap();
        let children = BoxId::ROOT.children().unwrap();
        for child in children {
            acc.settle_up(child, 1.0).unwrap();
            acc.contribute_up(child, 1.0).unwrap();
        }

        prop_assert_eq!(
            acc.contribute_up(children[extra], 100.0),
            Err(DependencyError::DoubleCompletion { node: BoxId::ROOT })
        );
        prop_assert_eq!(acc.violation(), Some(BoxId::ROOT));
        prop_assert!(acc.is_up_ready(BoxId::ROOT));
        // A refused fold leaves the total as it was.
        prop_assert_eq!(acc.multipole(BoxId::ROOT).unwrap(), 8.0);
    }
}

#[test]
fn test_concurrent_up_pass_releases_each_parent_once() {
    let depth = 2;
    let acc = DependencyAccumulator::new(depth, storage(depth)).unwrap();
    let mid_released = AtomicUsize::new(0);
    let root_released = AtomicUsize::new(0);

    Device::default()
        .launch(NdRange::groups_of(4, 16), |item| {
            let leaf = BoxId::new(depth, item.global_linear_id() as u32)
                .ok_or(KernelError::Dependency(DependencyError::StorageMismatch))?;
            acc.settle_up(leaf, 1.0)?;
            let Some(mid) = acc.contribute_up(leaf, acc.multipole(leaf)?)? else {
                return Ok(());
            };
            mid_released.fetch_add(1, Ordering::Relaxed);
            if acc.contribute_up(mid, acc.multipole(mid)?)?.is_some() {
                root_released.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(mid_released.into_inner(), 8);
    assert_eq!(root_released.into_inner(), 1);
    assert_eq!(acc.multipole(BoxId::ROOT).unwrap(), 64.0);
}

#[test]
fn test_concurrent_double_completion_has_one_winner() {
    let acc = DependencyAccumulator::new(1, storage(1)).unwrap();
    let leaf = BoxId::new(1, 4).unwrap();
    let wins = AtomicUsize::new(0);
    let losses = AtomicUsize::new(0);

    // Lanes never fail here, so the launch runs every racer to the end.
    Device::default()
        .launch(NdRange::linear(8, 8), |_item| {
            match acc.settle_up(leaf, 1.0) {
                Ok(true) => wins.fetch_add(1, Ordering::Relaxed),
                Ok(false) => 0,
                Err(DependencyError::DoubleCompletion { node }) => {
                    assert_eq!(node, leaf);
                    losses.fetch_add(1, Ordering::Relaxed)
                }
                Err(other) => return Err(other.into()),
            };
            Ok(())
        })
        .unwrap();

    assert_eq!(wins.into_inner(), 1);
    assert_eq!(losses.into_inner(), 7);
    assert_eq!(acc.violation(), Some(leaf));
}
