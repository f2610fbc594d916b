//! Single-slot last-value cache, owned exclusively by the proxy task.
//!
//! Dedup is by `message_id` equality only — content is never coalesced,
//! since two identically-valued messages with different ids are still
//! distinct heartbeats.

use cooler_core::model::ControlMessage;

pub struct LastValueCache {
    last: Option<ControlMessage>,
}

impl LastValueCache {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Offer a freshly received upstream message. Returns `Some(message)`
    /// if it should be forwarded downstream (it is new by id), or `None` if
    /// it's a duplicate of the cached message.
    pub fn offer(&mut self, msg: ControlMessage) -> Option<ControlMessage> {
        let is_duplicate = self
            .last
            .as_ref()
            .is_some_and(|cached| cached.message_id == msg.message_id);
        if is_duplicate {
            return None;
        }
        self.last = Some(msg.clone());
        Some(msg)
    }

    /// The message a newly (re)connected downstream subscriber should
    /// immediately receive, if any has ever been cached.
    pub fn replay(&self) -> Option<ControlMessage> {
        self.last.clone()
    }
}

impl Default for LastValueCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cooler_core::model::{ControlState, Duty};
    use time::OffsetDateTime;

    fn msg(id: u64) -> ControlMessage {
        ControlMessage {
            message_id: id,
            ts: OffsetDateTime::now_utc(),
            mode_index: 1,
            state: ControlState::Running,
            duty: Duty {
                enable: true,
                on_sec: 60,
                off_sec: 120,
            },
        }
    }

    #[test]
    fn first_message_is_forwarded_and_cached() {
        let mut cache = LastValueCache::new();
        assert!(cache.offer(msg(1)).is_some());
        assert_eq!(cache.replay().unwrap().message_id, 1);
    }

    #[test]
    fn duplicate_id_is_dropped() {
        let mut cache = LastValueCache::new();
        cache.offer(msg(1));
        assert!(cache.offer(msg(1)).is_none());
    }

    #[test]
    fn new_id_is_forwarded_even_if_content_identical() {
        // Dedup is strictly by id; two distinct ids with the same content
        // must both forward.
        let mut cache = LastValueCache::new();
        cache.offer(msg(1));
        assert!(cache.offer(msg(2)).is_some());
    }

    #[test]
    fn replay_is_empty_with_no_subscribers_yet() {
        let cache = LastValueCache::new();
        assert!(cache.replay().is_none());
    }

    #[test]
    fn replay_reflects_most_recently_forwarded() {
        let mut cache = LastValueCache::new();
        cache.offer(msg(1));
        cache.offer(msg(2));
        assert_eq!(cache.replay().unwrap().message_id, 2);
    }
}
