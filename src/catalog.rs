use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::profile::Subscription;
use crate::store::Store;

/// `subscription.yaml`
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDocument {
    #[serde(default)]
    pub subscription: Vec<Subscription>,
}

/// The set of named subscriptions, persisted after every mutation.
///
/// When a write fails the in-memory catalog keeps the mutation; call
/// [`SubscriptionCatalog::reload`] to resynchronise with disk.
#[derive(Debug)]
pub struct SubscriptionCatalog {
    store: Store<SubscriptionDocument>,
}

impl SubscriptionCatalog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Store::<SubscriptionDocument>::open(path)?;
        if store.get().subscription.is_empty() {
            store.save()?;
        }
        Ok(Self { store })
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.store
            .get()
            .subscription
            .iter()
            .position(|s| s.name == name)
    }

    /// Inserts `sub`, or replaces the entry with the same name.
    pub fn add(&mut self, sub: Subscription) -> Result<()> {
        if self.exists(&sub.name) {
            warn!("subscription '{}' already exists, updating it", sub.name);
            let name = sub.name.clone();
            return self.update(&name, sub);
        }
        info!("adding subscription '{}' ({} files)", sub.name, sub.files.len());
        self.store.get_mut().subscription.push(sub);
        self.store.save()
    }

    pub fn update(&mut self, name: &str, sub: Subscription) -> Result<()> {
        let pos = self
            .position(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        self.store.get_mut().subscription[pos] = sub;
        self.store.save()
    }

    pub fn get(&self, name: &str) -> Option<&Subscription> {
        self.store.get().subscription.iter().find(|s| s.name == name)
    }

    /// Every subscription, re-read from disk first.
    pub fn get_all(&mut self) -> Result<Vec<Subscription>> {
        self.reload()?;
        Ok(self.store.get().subscription.clone())
    }

    /// Drops the entry and hands it back. Its proxy files are left on disk.
    pub fn remove(&mut self, name: &str) -> Result<Option<Subscription>> {
        let Some(pos) = self.position(name) else {
            return Ok(None);
        };
        let removed = self.store.get_mut().subscription.remove(pos);
        self.store.save()?;
        Ok(Some(removed))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.store
            .get()
            .subscription
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn reload(&mut self) -> Result<()> {
        self.store.reload()
    }
}
