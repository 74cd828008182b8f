//! Local object store of a watch session
//!
//! Turns list results and watch signals into add/update/delete changes by
//! comparing them with the last known state of each object.

use std::collections::HashMap;

use crate::cluster::WatchSignal;
use crate::models::{ClusterObject, ResourceChangeEvent};

/// Last known snapshot of every object, keyed by `namespace/name`
#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: HashMap<String, ClusterObject>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// Apply one watch signal
    pub fn apply(&mut self, signal: WatchSignal) -> Vec<ResourceChangeEvent> {
        match signal {
            WatchSignal::Applied(obj) => self.upsert(obj).into_iter().collect(),
            WatchSignal::Deleted(obj) => match self.objects.remove(&obj.key()) {
                Some(_) => vec![ResourceChangeEvent::Deleted(obj)],
                None => Vec::new(),
            },
            WatchSignal::Relisted(objects) => self.replace(objects),
        }
    }

    /// Replace the whole content with a fresh list. Objects missing from the
    /// list are reported deleted, new ones added, changed ones updated.
    pub fn replace(&mut self, objects: Vec<ClusterObject>) -> Vec<ResourceChangeEvent> {
        let mut previous = std::mem::take(&mut self.objects);
        let mut changes = Vec::new();

        for obj in objects {
            let key = obj.key();
            match previous.remove(&key) {
                None => changes.push(ResourceChangeEvent::Added(obj.clone())),
                Some(old) if old.resource_version() != obj.resource_version() => {
                    changes.push(ResourceChangeEvent::Updated {
                        old,
                        new: obj.clone(),
                    })
                }
                Some(_) => {}
            }
            self.objects.insert(key, obj);
        }

        let mut gone: Vec<_> = previous.into_iter().collect();
        gone.sort_by(|a, b| a.0.cmp(&b.0));
        changes.extend(
            gone.into_iter()
                .map(|(_, obj)| ResourceChangeEvent::Deleted(obj)),
        );

        changes
    }

    fn upsert(&mut self, obj: ClusterObject) -> Option<ResourceChangeEvent> {
        let key = obj.key();
        match self.objects.insert(key, obj.clone()) {
            None => Some(ResourceChangeEvent::Added(obj)),
            Some(old) if old.resource_version() != obj.resource_version() => {
                Some(ResourceChangeEvent::Updated { old, new: obj })
            }
            Some(_) => None,
        }
    }
}
