//! Priority-ordered subscription manager (§4.2): who should receive a
//! PUBLISH on a topic, and who the top-priority candidates are for a
//! REQUEST's target selection.
//!
//! Built directly on `mb-core`'s generic [`Trie`]: subscriptions are leaves
//! carrying a `serviceId` and a `priority`, kept at each node in
//! priority-descending order by [`PrioritySortedSet`].

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use mb_core::trie::{PriorityLeaf, PrioritySortedSet, Trie};

#[derive(Debug, Clone, PartialEq)]
struct Subscriber {
    service_id: String,
    priority: i64,
}

impl PriorityLeaf for Subscriber {
    type Id = String;

    fn id(&self) -> String {
        self.service_id.clone()
    }

    fn priority(&self) -> i64 {
        self.priority
    }
}

/// Tracks every service's subscriptions in a single trie, plus a reverse
/// index (`serviceId` -> patterns) so a closing connection's subscriptions
/// can be torn down without scanning the whole trie.
pub struct SubscriptionManager {
    trie: Mutex<Trie<PrioritySortedSet<Subscriber>>>,
    by_service: Mutex<HashMap<String, HashSet<String>>>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            trie: Mutex::new(Trie::new()),
            by_service: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe `service_id` to `pattern` at `priority`. Returns `false` if
    /// the pattern is malformed or the service was already subscribed to
    /// this exact pattern (priority updates on an existing subscription
    /// still count as "already subscribed").
    pub fn subscribe(&self, service_id: &str, pattern: &str, priority: i64) -> bool {
        let leaf = Subscriber {
            service_id: service_id.to_string(),
            priority,
        };
        let is_new = match self.trie.lock().unwrap().set(pattern, leaf) {
            Ok(is_new) => is_new,
            Err(_) => return false,
        };
        self.by_service
            .lock()
            .unwrap()
            .entry(service_id.to_string())
            .or_default()
            .insert(pattern.to_string());
        is_new
    }

    /// Unsubscribe `service_id` from `pattern`, or from every pattern it
    /// holds when `pattern` is `None`. Returns whether anything was removed.
    pub fn unsubscribe(&self, service_id: &str, pattern: Option<&str>) -> bool {
        match pattern {
            Some(pattern) => self.unsubscribe_one(service_id, pattern),
            None => {
                let patterns = self
                    .by_service
                    .lock()
                    .unwrap()
                    .remove(service_id)
                    .unwrap_or_default();
                let mut removed_any = false;
                let mut trie = self.trie.lock().unwrap();
                for pattern in patterns {
                    if trie
                        .delete(&pattern, |l| l.service_id == service_id)
                        .unwrap_or(false)
                    {
                        removed_any = true;
                    }
                }
                removed_any
            }
        }
    }

    fn unsubscribe_one(&self, service_id: &str, pattern: &str) -> bool {
        let removed = self
            .trie
            .lock()
            .unwrap()
            .delete(pattern, |l| l.service_id == service_id)
            .unwrap_or(false);
        if removed {
            if let Some(patterns) = self.by_service.lock().unwrap().get_mut(service_id) {
                patterns.remove(pattern);
            }
        }
        removed
    }

    fn matches(&self, topic: &str) -> Vec<Subscriber> {
        let segments: Vec<&str> = topic.split('.').collect();
        self.trie.lock().unwrap().get(&segments)
    }

    fn dedup_first_seen(subs: Vec<Subscriber>) -> Vec<Subscriber> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(subs.len());
        for s in subs {
            if seen.insert(s.service_id.clone()) {
                out.push(s);
            }
        }
        out
    }

    /// Every distinct service subscribed to `topic`, in match-type order
    /// (exact, then `#` deepest-first, then `+` shallowest-first), deduped
    /// to the first match a service appears under.
    pub fn get_subscribers(&self, topic: &str) -> Vec<String> {
        Self::dedup_first_seen(self.matches(topic))
            .into_iter()
            .map(|s| s.service_id)
            .collect()
    }

    /// The subset of `get_subscribers(topic)` sharing the maximum priority
    /// among them, in the same relative order. Used by the router to pick a
    /// REQUEST target among tied top candidates.
    pub fn get_top_subscribers(&self, topic: &str) -> Vec<String> {
        let deduped = Self::dedup_first_seen(self.matches(topic));
        let Some(max_priority) = deduped.iter().map(|s| s.priority).max() else {
            return Vec::new();
        };
        deduped
            .into_iter()
            .filter(|s| s.priority == max_priority)
            .map(|s| s.service_id)
            .collect()
    }

    /// Every pattern `service_id` currently holds, alphabetical.
    pub fn get_subscribed_topics(&self, service_id: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .by_service
            .lock()
            .unwrap()
            .get(service_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Every pattern registered by any service, alphabetical, deduplicated.
    pub fn get_all_subscribed_topics(&self) -> Vec<String> {
        self.trie.lock().unwrap().keys()
    }
}
