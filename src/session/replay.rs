//! Inbound QoS 1 replay window.
//!
//! Remembers packet ids of recently completed inbound QoS 1 publishes so a
//! DUP retransmission of an already-acknowledged message is not dispatched twice.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::AHashMap;

/// Bounded, time-limited set of completed packet ids
#[derive(Debug)]
pub struct ReplayWindow {
    horizon: Duration,
    capacity: usize,
    /// Completion order, oldest first
    order: VecDeque<(u16, Instant)>,
    /// Latest completion per packet id
    latest: AHashMap<u16, Instant>,
}

impl ReplayWindow {
    pub fn new(horizon: Duration, capacity: usize) -> Self {
        Self {
            horizon,
            capacity,
            order: VecDeque::new(),
            latest: AHashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.horizon.is_zero() && self.capacity > 0
    }

    /// Record `packet_id` as completed at `now`
    pub fn record(&mut self, packet_id: u16, now: Instant) {
        if !self.is_enabled() {
            return;
        }
        self.expire(now);
        while self.order.len() >= self.capacity {
            self.evict_oldest();
        }
        self.order.push_back((packet_id, now));
        self.latest.insert(packet_id, now);
    }

    /// Whether `packet_id` completed within the window
    pub fn contains(&self, packet_id: u16, now: Instant) -> bool {
        self.latest
            .get(&packet_id)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.horizon)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(_, at)) = self.order.front() {
            if now.saturating_duration_since(at) < self.horizon {
                break;
            }
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((id, at)) = self.order.pop_front() {
            // a later completion of the same id keeps the entry alive
            if self.latest.get(&id) == Some(&at) {
                self.latest.remove(&id);
            }
        }
    }
}
