//! Property-based tests for the ring queue's FIFO contract.

use proptest::prelude::*;

use lanesched::core::ring::{QueueError, RingQueue};

const CAP: usize = 16;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn fifo_order_holds(values in prop::collection::vec(any::<u32>(), 0..=CAP)) {
        let mut queue: RingQueue<u32, CAP> = RingQueue::new();
        for v in &values {
            queue.push(*v).unwrap();
        }

        prop_assert_eq!(queue.len(), values.len());
        for (i, v) in values.iter().enumerate() {
            prop_assert_eq!(queue.front(i), Some(*v));
        }
        prop_assert_eq!(queue.front(values.len()), None);
        prop_assert_eq!(queue.back(), values.last().copied());
    }

    #[test]
    fn overflow_never_overwrites(
        values in prop::collection::vec(any::<u64>(), CAP..CAP * 3),
    ) {
        let mut queue: RingQueue<u64, CAP> = RingQueue::new();
        let mut rejected = 0;
        for v in &values {
            if queue.push(*v) == Err(QueueError::Full) {
                rejected += 1;
            }
        }

        prop_assert_eq!(rejected, values.len() - CAP);
        prop_assert!(queue.is_full());
        for i in 0..CAP {
            prop_assert_eq!(queue.front(i), Some(values[i]));
        }
    }

    #[test]
    fn pop_shifts_front(
        values in prop::collection::vec(any::<i64>(), 1..=CAP),
        n in 0usize..=CAP,
    ) {
        let mut queue: RingQueue<i64, CAP> = RingQueue::new();
        for v in &values {
            queue.push(*v).unwrap();
        }

        let before = queue.front(n);
        let popped = queue.pop_n(n);
        if n > values.len() {
            prop_assert_eq!(popped, Err(QueueError::Underflow));
            prop_assert_eq!(queue.len(), values.len());
        } else {
            prop_assert!(popped.is_ok());
            prop_assert_eq!(queue.front(0), before);
            prop_assert_eq!(queue.len(), values.len() - n);
        }
    }

    /// Interleaved pushes and pops agree with a VecDeque model across wraparound.
    #[test]
    fn matches_model(ops in prop::collection::vec((any::<bool>(), any::<u16>()), 0..200)) {
        let mut queue: RingQueue<u16, CAP> = RingQueue::new();
        let mut model = std::collections::VecDeque::new();

        for (is_push, v) in ops {
            if is_push {
                let accepted = queue.push(v).is_ok();
                prop_assert_eq!(accepted, model.len() < CAP);
                if accepted {
                    model.push_back(v);
                }
            } else {
                let popped = queue.pop().is_ok();
                prop_assert_eq!(popped, model.pop_front().is_some());
            }
            prop_assert_eq!(queue.len(), model.len());
            prop_assert_eq!(queue.front(0), model.front().copied());
            prop_assert_eq!(queue.back(), model.back().copied());
        }
    }
}

#[test]
fn test_producer_and_consumers_share_one_queue() {
    let queue: RingQueue<u32, 8> = RingQueue::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer();

    for v in 0..5 {
        producer.push(v).unwrap();
    }
    assert_eq!(consumer.len(), 5);
    assert_eq!(consumer.front(4), Some(4));
    assert_eq!(queue.producer().err(), Some(QueueError::ProducerTaken));

    assert_eq!(producer.drain(), 5);
    assert!(consumer.is_empty());

    drop(producer);
    assert!(queue.producer().is_ok());
}
