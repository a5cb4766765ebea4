//! One queue per work-group: lane 0 enqueues the group's indices, every lane
//! consumes `front(local_id)`, lane 0 drains.
//!
//! Run with `cargo run --example vector_add -- [vector size] [group size]`.

use std::sync::atomic::{AtomicI32, Ordering};

use tracing::Level;

use lanesched::core::{QueueError, RingQueue};
use lanesched::device::{Device, DeviceConfig, DeviceHeap, NdRange};

const MAX_GROUP: usize = 64;

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let mut args = std::env::args().skip(1);
    let len: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(1024);
    let group_size: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(MAX_GROUP);

    let device = Device::new(DeviceConfig::default().with_max_group_size(MAX_GROUP));
    println!("{}", device.config());

    if group_size == 0 || group_size > MAX_GROUP || len % group_size != 0 {
        eprintln!("group size must be 1..={MAX_GROUP} and divide the vector size");
        std::process::exit(1);
    }
    let groups = len / group_size;

    let mut heap = DeviceHeap::default();
    let setup = (|| {
        let queues = heap.alloc_array(groups, |_| RingQueue::<u32, MAX_GROUP>::new())?;
        let a = heap.alloc_array(len, |_| 1i32)?;
        let b = heap.alloc_array(len, |i| i as i32 + 1)?;
        let r = heap.alloc_array(len, |_| AtomicI32::new(0))?;
        Ok::<_, lanesched::device::RegionError>((queues, a, b, r))
    })();
    let (queues, a, b, r) = match setup {
        Ok(regions) => regions,
        Err(e) => {
            eprintln!("allocation failed: {e:?}");
            std::process::exit(1);
        }
    };

    let launched = {
        let heap = &heap;
        device.launch(NdRange::linear(len, group_size), |item| {
            let queues = heap.get(queues)?;
            let (a, b, r) = (heap.get(a)?, heap.get(b)?, heap.get(r)?);
            let group = item.group_linear_id();
            let queue = &queues[group];

            let producer = if item.local_linear_id() == 0 {
                Some(queue.producer()?)
            } else {
                None
            };
            if let Some(producer) = &producer {
                for i in 0..group_size {
                    producer.push((group * group_size + i) as u32)?;
                }
            }
            item.barrier()?;

            let i = queue
                .front(item.local_linear_id())
                .ok_or(QueueError::Underflow)? as usize;
            r[i].store(a[i] + b[i], Ordering::Relaxed);
            item.barrier()?;

            if let Some(producer) = &producer {
                producer.drain();
            }
            Ok(())
        })
    };

    let report = match launched {
        Ok(report) => report,
        Err(e) => {
            eprintln!("launch failed: {e:?}");
            std::process::exit(1);
        }
    };

    let result = heap.free(r).unwrap_or_default();
    let correct = result
        .iter()
        .enumerate()
        .all(|(i, v)| v.load(Ordering::Relaxed) == i as i32 + 2);
    let _ = (heap.free(queues), heap.free(a), heap.free(b));

    println!(
        "vector size {len}, {groups} groups of {group_size}: {:?}, correct: {correct}",
        report.elapsed
    );
}
