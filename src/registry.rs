//! The multi-namespace, multi-instance registry: a read-mostly concurrent
//! table with atomic replace and deferred teardown.
//!
//! Readers (`find`/`find_current`/`foreach`) never block and never take
//! the write lock: `dashmap::DashMap` gives them a lock-free (sharded)
//! read path, and handing out an `Arc<Instance>` clone is the "counted
//! snapshot" the data model calls for. Writers (`add`/`remove`/`replace`/
//! `flush`) serialize under a `parking_lot::Mutex` the way the original's
//! single list-mutex does. There is no explicit "grace period" to wait
//! for: unlinking an entry from the map only drops the registry's own
//! strong reference, and the `Instance` is only actually destroyed once
//! every reader's cloned `Arc` has gone out of scope, which is exactly the
//! property RCU's synchronize-then-destroy step provides in the original.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::RegistryError;
use crate::instance::{Framework, Instance, InstanceName, NamespaceId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    ns: NamespaceId,
    framework: Framework,
    name: InstanceName,
}

/// The instance registry.
pub struct Registry {
    table: DashMap<Key, Arc<Instance>>,
    /// Serializes `add`/`remove`/`replace`/`flush`; readers never take
    /// this.
    write_lock: Mutex<()>,
    /// Insertion order, for `foreach`'s resumable cursor. Mutated only
    /// under `write_lock`.
    order: Mutex<Vec<Key>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// A resumable cursor into `foreach`'s insertion-ordered enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    namespace: NamespaceId,
    framework: Framework,
    name: InstanceName,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
            write_lock: Mutex::new(()),
            order: Mutex::new(Vec::new()),
        }
    }

    /// Publishes `instance`. Rejects a name collision within the namespace
    /// and, for a `Netfilter`-framework instance, rejects a second
    /// Netfilter instance in the same namespace.
    pub fn add(&self, instance: Instance) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock();

        let name_collision = self
            .table
            .iter()
            .any(|e| e.key().ns == instance.namespace && e.key().name == instance.name);
        if name_collision {
            return Err(RegistryError::NameCollision(
                instance.name.as_str().to_owned(),
            ));
        }

        if instance.framework == Framework::Netfilter {
            let netfilter_collision = self.table.iter().any(|e| {
                e.key().ns == instance.namespace && e.key().framework == Framework::Netfilter
            });
            if netfilter_collision {
                return Err(RegistryError::NetfilterCollision);
            }
        }

        let key = Key {
            ns: instance.namespace,
            framework: instance.framework,
            name: instance.name.clone(),
        };

        let framework = key.framework;
        tracing::debug!(ns = key.ns.0, name = key.name.as_str(), ?framework, "Publishing instance");

        self.table.insert(key.clone(), Arc::new(instance));
        self.order.lock().push(key);

        Ok(())
    }

    /// Detaches the instance immediately. Destruction happens when the
    /// last clone of the returned/held `Arc` is dropped.
    pub fn remove(
        &self,
        ns: NamespaceId,
        framework: Framework,
        name: &InstanceName,
    ) -> Result<Arc<Instance>, RegistryError> {
        let _guard = self.write_lock.lock();

        let key = Key {
            ns,
            framework,
            name: name.clone(),
        };

        let (_, instance) = self.table.remove(&key).ok_or(RegistryError::NotFound)?;
        self.order.lock().retain(|k| k != &key);

        tracing::debug!(ns = ns.0, name = name.as_str(), "Detached instance");

        Ok(instance)
    }

    /// Atomically swaps the node for `(ns, framework, name)` with
    /// `new_instance`. A concurrent `find` is guaranteed to observe either
    /// the old or the new instance, in full, never a partially published
    /// one -- `DashMap::insert` replaces the map entry in one shard-locked
    /// operation.
    pub fn replace(&self, new_instance: Instance) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock();

        let key = Key {
            ns: new_instance.namespace,
            framework: new_instance.framework,
            name: new_instance.name.clone(),
        };

        if !self.table.contains_key(&key) {
            return Err(RegistryError::NotFound);
        }

        tracing::debug!(ns = key.ns.0, name = key.name.as_str(), "Hot-swapping instance");
        self.table.insert(key, Arc::new(new_instance));

        Ok(())
    }

    /// Returns a counted snapshot of the published instance, if any.
    pub fn find(
        &self,
        ns: NamespaceId,
        framework: Framework,
        name: &InstanceName,
    ) -> Option<Arc<Instance>> {
        let key = Key {
            ns,
            framework,
            name: name.clone(),
        };

        self.table.get(&key).map(|e| Arc::clone(e.value()))
    }

    /// Finds the current (only, by construction) instance for a namespace
    /// and framework, ignoring name -- the convenience lookup a
    /// kernel-hook call site uses when it knows the framework but not the
    /// configured name.
    pub fn find_current(&self, ns: NamespaceId, framework: Framework) -> Option<Arc<Instance>> {
        self.table
            .iter()
            .find(|e| e.key().ns == ns && e.key().framework == framework)
            .map(|e| Arc::clone(e.value()))
    }

    /// Enumerates instances in insertion order, starting just after
    /// `cursor` if given. Returns the batch plus a cursor to resume from.
    pub fn foreach(&self, cursor: Option<&Cursor>) -> (Vec<Arc<Instance>>, Option<Cursor>) {
        let order = self.order.lock().clone();

        let start = match cursor {
            None => 0,
            Some(c) => order
                .iter()
                .position(|k| {
                    k.ns == c.namespace && k.framework == c.framework && k.name == c.name
                })
                .map(|i| i + 1)
                .unwrap_or(order.len()),
        };

        let batch: Vec<Arc<Instance>> = order[start..]
            .iter()
            .filter_map(|k| self.table.get(k).map(|e| Arc::clone(e.value())))
            .collect();

        let next_cursor = order.last().map(|k| Cursor {
            namespace: k.ns,
            framework: k.framework,
            name: k.name.clone(),
        });

        (batch, next_cursor)
    }

    /// Removes every instance in `ns`. Called when the host notifies the
    /// registry that a namespace is being destroyed.
    pub fn flush(&self, ns: NamespaceId) {
        let _guard = self.write_lock.lock();

        tracing::debug!(ns = ns.0, "Flushing all instances in namespace");

        let to_remove: Vec<Key> = self
            .order
            .lock()
            .iter()
            .filter(|k| k.ns == ns)
            .cloned()
            .collect();

        for key in &to_remove {
            self.table.remove(key);
        }

        self.order.lock().retain(|k| k.ns != ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{GlobalConfig, ModeState, SiitState};

    fn instance(ns: u64, framework: Framework, name: &str) -> Instance {
        Instance {
            name: InstanceName::new(name).unwrap(),
            framework,
            namespace: NamespaceId(ns),
            global: GlobalConfig::default(),
            state: ModeState::Siit(SiitState::default()),
        }
    }

    #[test]
    fn add_rejects_name_collision() {
        let registry = Registry::new();
        registry
            .add(instance(0, Framework::IpTables, "a"))
            .unwrap();

        let err = registry
            .add(instance(0, Framework::IpTables, "a"))
            .unwrap_err();

        assert!(matches!(err, RegistryError::NameCollision(_)));
    }

    #[test]
    fn add_rejects_second_netfilter_instance_per_namespace() {
        let registry = Registry::new();
        registry
            .add(instance(0, Framework::Netfilter, "a"))
            .unwrap();

        let err = registry
            .add(instance(0, Framework::Netfilter, "b"))
            .unwrap_err();

        assert_eq!(err, RegistryError::NetfilterCollision);
    }

    #[test]
    fn registry_uniqueness_restored_after_remove() {
        let registry = Registry::new();
        let name = InstanceName::new("a").unwrap();
        registry
            .add(instance(0, Framework::Netfilter, "a"))
            .unwrap();
        registry
            .remove(NamespaceId(0), Framework::Netfilter, &name)
            .unwrap();

        registry
            .add(instance(0, Framework::Netfilter, "b"))
            .unwrap();
    }

    #[test]
    fn replace_preserves_readers_view_of_a_whole_instance() {
        let registry = Registry::new();
        registry
            .add(instance(0, Framework::IpTables, "a"))
            .unwrap();

        let name = InstanceName::new("a").unwrap();
        let snapshot_before = registry
            .find(NamespaceId(0), Framework::IpTables, &name)
            .unwrap();

        let mut replacement = instance(0, Framework::IpTables, "a");
        replacement.global.new_tos = 7;
        registry.replace(replacement).unwrap();

        let snapshot_after = registry
            .find(NamespaceId(0), Framework::IpTables, &name)
            .unwrap();

        assert_eq!(snapshot_before.global.new_tos, 0);
        assert_eq!(snapshot_after.global.new_tos, 7);
    }

    #[test]
    fn foreach_resumes_from_cursor() {
        let registry = Registry::new();
        registry
            .add(instance(0, Framework::IpTables, "a"))
            .unwrap();
        registry
            .add(instance(0, Framework::Netfilter, "b"))
            .unwrap();

        let (first_batch, cursor) = registry.foreach(None);
        assert_eq!(first_batch.len(), 2);

        let (second_batch, _) = registry.foreach(cursor.as_ref());
        assert!(second_batch.is_empty());
    }

    #[test]
    fn flush_removes_only_the_target_namespace() {
        let registry = Registry::new();
        registry
            .add(instance(0, Framework::IpTables, "a"))
            .unwrap();
        registry
            .add(instance(1, Framework::IpTables, "a"))
            .unwrap();

        registry.flush(NamespaceId(0));

        assert!(registry
            .find(NamespaceId(0), Framework::IpTables, &InstanceName::new("a").unwrap())
            .is_none());
        assert!(registry
            .find(NamespaceId(1), Framework::IpTables, &InstanceName::new("a").unwrap())
            .is_some());
    }
}
