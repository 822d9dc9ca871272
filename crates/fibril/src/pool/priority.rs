//! Priority pool

use super::PoolOps;
use crate::error::{Error, Result};
use crate::unit::Unit;
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

struct Entry {
    priority: i32,
    seq: Reverse<u64>,
    unit: Unit,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

#[derive(Default)]
struct Heap {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Heap of ready units ordered by unit priority
///
/// Higher priorities pop first; units of equal priority pop in push order.
#[derive(Default)]
pub struct PriorityPool {
    heap: Mutex<Heap>,
}

impl PriorityPool {
    /// Create an empty priority pool
    pub fn new() -> Self {
        Self::default()
    }
}

impl PoolOps for PriorityPool {
    fn push(&self, unit: Unit) {
        let mut heap = self.heap.lock();
        let seq = Reverse(heap.next_seq);
        heap.next_seq += 1;
        heap.entries.push(Entry {
            priority: unit.priority(),
            seq,
            unit,
        });
    }

    fn pop(&self) -> Option<Unit> {
        self.heap.lock().entries.pop().map(|e| e.unit)
    }

    fn remove(&self, unit: &Unit) -> Result<()> {
        let mut heap = self.heap.lock();
        let before = heap.entries.len();
        heap.entries.retain(|e| &e.unit != unit);
        if heap.entries.len() == before {
            return Err(Error::Pool("unit is not in the pool"));
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.heap.lock().entries.len()
    }

    fn for_each(&self, f: &mut dyn FnMut(&Unit)) -> Result<()> {
        self.heap.lock().entries.iter().for_each(|e| f(&e.unit));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Access, Pool, PoolKind};
    use crate::unit::Builder;

    #[test]
    fn test_priority_order_then_fifo() {
        crate::init().unwrap();
        let staging = Pool::new(PoolKind::Fifo, Access::Mpmc).unwrap();
        let make = |priority| {
            let unit = Builder::new().priority(priority).spawn(&staging, || {}).unwrap();
            staging.remove(&unit).unwrap();
            unit
        };
        let low = make(1);
        let high_a = make(5);
        let high_b = make(5);
        let mid = make(3);

        let pool = PriorityPool::new();
        for unit in [&low, &high_a, &high_b, &mid] {
            pool.push(unit.clone());
        }

        let order: Vec<Unit> = std::iter::from_fn(|| pool.pop()).collect();
        assert_eq!(order, vec![high_a, high_b, mid, low]);
        crate::finalize().unwrap();
    }
}
