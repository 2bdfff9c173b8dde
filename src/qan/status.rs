use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Component name → last status line, shared by one agent's analyzers and
/// read by the status endpoint.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    inner: Arc<ArcSwap<BTreeMap<String, String>>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(BTreeMap::new())),
        }
    }

    pub fn update(&self, component: &str, status: impl Into<String>) {
        let status = status.into();
        self.inner.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.insert(component.to_string(), status.clone());
            next
        });
    }

    pub fn merge(&self, entries: &BTreeMap<String, String>) {
        if entries.is_empty() {
            return;
        }
        self.inner.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
            next
        });
    }

    /// Drop `component` and every `component-*` entry.
    pub fn remove(&self, component: &str) {
        let prefix = format!("{component}-");
        self.inner.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.retain(|k, _| k != component && !k.starts_with(&prefix));
            next
        });
    }

    #[must_use]
    pub fn get(&self, component: &str) -> Option<String> {
        self.inner.load().get(component).cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        BTreeMap::clone(&self.inner.load())
    }
}
