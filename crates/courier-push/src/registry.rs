//! Topic → listener registry. Outlives every transport session.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::Envelope;

pub type Listener = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Returned by subscribe; identifies exactly one registered listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: ListenerId,
    topic: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Resolved destination the listener is attached to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Debug)]
pub struct Registration {
    pub handle: SubscriptionHandle,
    pub first_for_topic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    NotFound,
    Remaining,
    LastForTopic,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    topics: HashMap<String, Vec<(ListenerId, Listener)>>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Registry")
            .field("topics", &inner.topics.len())
            .field("next_id", &inner.next_id)
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, topic: &str, listener: Listener) -> Registration {
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        let listeners = inner.topics.entry(topic.to_string()).or_default();
        let first_for_topic = listeners.is_empty();
        listeners.push((id, listener));
        Registration {
            handle: SubscriptionHandle {
                id,
                topic: topic.to_string(),
            },
            first_for_topic,
        }
    }

    pub fn remove(&self, handle: &SubscriptionHandle) -> Removal {
        self.remove_where(&handle.topic, |(id, _)| *id == handle.id)
    }

    /// Removes the first registration of `listener` (by `Arc` identity).
    pub fn remove_listener(&self, topic: &str, listener: &Listener) -> Removal {
        self.remove_where(topic, |(_, candidate)| Arc::ptr_eq(candidate, listener))
    }

    fn remove_where(
        &self,
        topic: &str,
        matches: impl Fn(&(ListenerId, Listener)) -> bool,
    ) -> Removal {
        let mut inner = self.inner.lock();
        let Some(listeners) = inner.topics.get_mut(topic) else {
            return Removal::NotFound;
        };
        let Some(index) = listeners.iter().position(matches) else {
            return Removal::NotFound;
        };
        listeners.remove(index);
        if listeners.is_empty() {
            inner.topics.remove(topic);
            Removal::LastForTopic
        } else {
            Removal::Remaining
        }
    }

    /// Drops every listener and returns the topics that were registered.
    pub fn clear(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut topics: Vec<String> = inner.topics.drain().map(|(topic, _)| topic).collect();
        topics.sort();
        topics
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.inner.lock().topics.contains_key(topic)
    }

    /// Sorted snapshot of the registered topics.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Copy of the listeners for `topic`, safe to invoke without the lock.
    pub fn listeners(&self, topic: &str) -> Vec<Listener> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    /// Total number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.lock().topics.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Listener {
        Arc::new(|_: &Envelope| {})
    }

    #[test]
    fn first_and_last_listener_are_reported() {
        let registry = Registry::new();
        let a = registry.insert("/topic/messages", noop());
        let b = registry.insert("/topic/messages", noop());
        assert!(a.first_for_topic);
        assert!(!b.first_for_topic);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.remove(&a.handle), Removal::Remaining);
        assert_eq!(registry.remove(&a.handle), Removal::NotFound);
        assert_eq!(registry.remove(&b.handle), Removal::LastForTopic);
        assert!(!registry.contains("/topic/messages"));
        assert!(registry.is_empty());
    }

    #[test]
    fn handles_are_unique_per_registration() {
        let registry = Registry::new();
        let listener = noop();
        let a = registry.insert("/topic/messages", Arc::clone(&listener));
        let b = registry.insert("/topic/messages", Arc::clone(&listener));
        assert_ne!(a.handle, b.handle);
        assert_eq!(a.handle.topic(), "/topic/messages");
    }

    #[test]
    fn remove_listener_uses_arc_identity() {
        let registry = Registry::new();
        let kept = noop();
        let dropped = noop();
        registry.insert("/topic/email-updates", Arc::clone(&kept));
        registry.insert("/topic/email-updates", Arc::clone(&dropped));

        assert_eq!(
            registry.remove_listener("/topic/email-updates", &noop()),
            Removal::NotFound
        );
        assert_eq!(
            registry.remove_listener("/topic/email-updates", &dropped),
            Removal::Remaining
        );
        let left = registry.listeners("/topic/email-updates");
        assert_eq!(left.len(), 1);
        assert!(Arc::ptr_eq(&left[0], &kept));
    }

    #[test]
    fn churn_does_not_leave_empty_topics() {
        let registry = Registry::new();
        for _ in 0..1_000 {
            let registration = registry.insert("/topic/analytics_live", noop());
            registry.remove(&registration.handle);
        }
        assert!(registry.topics().is_empty());
    }

    #[test]
    fn clear_returns_sorted_topics() {
        let registry = Registry::new();
        registry.insert("/topic/b", noop());
        registry.insert("/topic/a", noop());
        registry.insert("/topic/a", noop());
        assert_eq!(registry.clear(), vec!["/topic/a", "/topic/b"]);
        assert!(registry.is_empty());
    }
}
