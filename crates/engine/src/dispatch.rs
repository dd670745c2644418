use keel_core::{Object, ResourceKey, WatchEvent};
use rustc_hash::FxHashSet;

/// Keys a watch has seen and not yet seen deleted.
///
/// A relist after lag only carries what still exists, so keys that vanished
/// in the gap are recovered from this set and enqueued alongside the list.
#[derive(Debug, Default)]
pub(crate) struct KnownKeys {
    keys: FxHashSet<ResourceKey>,
}

impl KnownKeys {
    pub(crate) fn seed(existing: &[Object]) -> Self {
        Self { keys: existing.iter().map(Object::key).collect() }
    }

    /// Keys to enqueue for `ev`.
    pub(crate) fn observe(&mut self, ev: &WatchEvent) -> Vec<ResourceKey> {
        match ev {
            WatchEvent::Added(o) | WatchEvent::Modified(o) => {
                let key = o.key();
                self.keys.insert(key.clone());
                vec![key]
            }
            WatchEvent::Deleted(o) => {
                let key = o.key();
                self.keys.remove(&key);
                vec![key]
            }
            WatchEvent::Restarted(list) => {
                let fresh: FxHashSet<ResourceKey> = list.iter().map(Object::key).collect();
                let previous = std::mem::replace(&mut self.keys, fresh);
                let mut out: Vec<ResourceKey> = previous.into_iter().filter(|k| !self.keys.contains(k)).collect();
                out.extend(self.keys.iter().cloned());
                out
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize { self.keys.len() }
}
