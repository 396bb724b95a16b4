use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Queue count of one broker, as tracked while a placement batch runs.
///
/// Ordered by queue count first and broker id second, so brokers with the
/// same load are picked in lexical id order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(super) struct BrokerLoad<'a> {
    pub(super) queue_count: usize,
    pub(super) broker_id: &'a str,
}

/// Min-priority structure handing out the least loaded broker first.
#[derive(Debug, Default)]
pub(super) struct LeastLoaded<'a> {
    heap: BinaryHeap<Reverse<BrokerLoad<'a>>>,
}

impl<'a> LeastLoaded<'a> {
    pub(super) fn push(&mut self, broker_id: &'a str, queue_count: usize) {
        self.heap.push(Reverse(BrokerLoad {
            queue_count,
            broker_id,
        }));
    }

    /// Takes the least loaded broker out; put it back with [`LeastLoaded::push`]
    /// once its new count is known.
    pub(super) fn pop(&mut self) -> Option<BrokerLoad<'a>> {
        self.heap.pop().map(|Reverse(load)| load)
    }
}
