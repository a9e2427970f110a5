use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;

use crate::events::DeferredEvent;

/// Consumer of the time-ordered event stream the reorderer produces.
pub trait DeferredEventVisitor {
    fn visit(&mut self, event: DeferredEvent);
}

/// Merges deferred events from many ring buffers into one time-ordered
/// stream.
///
/// Events from the same origin fd arrive already in timestamp order (the
/// kernel guarantees this per ring buffer), so one queue per origin
/// suffices. An event may be released once no other origin can still
/// deliver an earlier one, i.e. once its timestamp is at or below the
/// minimum of the latest-seen timestamps across all origins. The price is
/// latency bounded by the slowest origin's progress.
#[derive(Default)]
pub struct EventReorderer {
    queues: HashMap<RawFd, VecDeque<DeferredEvent>>,
    latest_seen: HashMap<RawFd, u64>,
}

impl EventReorderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&mut self, event: DeferredEvent) {
        let ts = event.ts();
        let latest = self.latest_seen.entry(event.origin_fd).or_insert(0);
        *latest = ts.max(*latest);
        self.queues.entry(event.origin_fd).or_default().push_back(event);
    }

    /// Release every event whose release is safe, oldest first.
    pub fn process_old_events<V: DeferredEventVisitor>(&mut self, visitor: &mut V) {
        let Some(safe_ts) = self.latest_seen.values().copied().min() else {
            return;
        };
        self.release_up_to(safe_ts, visitor);
    }

    /// Relax the safety check and flush everything in timestamp order.
    /// Called once all origins have stopped producing.
    pub fn process_all_events<V: DeferredEventVisitor>(&mut self, visitor: &mut V) {
        self.release_up_to(u64::MAX, visitor);
    }

    fn release_up_to<V: DeferredEventVisitor>(&mut self, safe_ts: u64, visitor: &mut V) {
        loop {
            let oldest = self
                .queues
                .iter()
                .filter_map(|(fd, queue)| queue.front().map(|event| (*fd, event.ts())))
                .min_by_key(|(_, ts)| *ts);
            let Some((fd, ts)) = oldest else {
                break;
            };
            if ts > safe_ts {
                break;
            }
            let event = self.queues.get_mut(&fd).unwrap().pop_front().unwrap();
            visitor.visit(event);
        }
    }
}
