//! Name → active instance routing.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use plughost_core::PluginName;
use tokio::sync::watch;
use tracing::debug;

use crate::instance::PluginInstance;

/// The routing table consulted for every job admission.
///
/// Each plugin name owns a slot holding at most one routed instance.
/// Readers load the slot without locking; writers replace the pointer in
/// one atomic store, so a reader sees either the old or the new instance,
/// never neither during a swap.
#[derive(Debug)]
pub struct DispatchTable {
    slots: DashMap<PluginName, Arc<ArcSwapOption<PluginInstance>>>,
    version: watch::Sender<u64>,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            slots: DashMap::new(),
            version,
        }
    }

    /// Instance currently routed for `name`.
    #[must_use]
    pub fn current(&self, name: &PluginName) -> Option<Arc<PluginInstance>> {
        self.slots.get(name).and_then(|slot| slot.load_full())
    }

    /// Route `name` to `instance`, returning whatever it replaced.
    pub fn swap(&self, instance: Arc<PluginInstance>) -> Option<Arc<PluginInstance>> {
        let name = instance.manifest().name.clone();
        let slot = Arc::clone(self.slots.entry(name.clone()).or_default().value());
        let previous = slot.swap(Some(instance));
        debug!(plugin = %name, replaced = previous.is_some(), "dispatch table updated");
        self.bump();
        previous
    }

    /// Route `name` to `instance` when nothing was routed before.
    pub fn activate(&self, instance: Arc<PluginInstance>) -> Option<Arc<PluginInstance>> {
        self.swap(instance)
    }

    /// Stop routing `name`, returning the instance that was routed.
    pub fn remove(&self, name: &PluginName) -> Option<Arc<PluginInstance>> {
        let previous = self.slots.get(name).and_then(|slot| slot.swap(None));
        if previous.is_some() {
            self.bump();
        }
        previous
    }

    /// Stop routing `instance` if it is still the routed one. Returns
    /// whether it was.
    pub fn remove_instance(&self, instance: &Arc<PluginInstance>) -> bool {
        let Some(slot) = self
            .slots
            .get(&instance.manifest().name)
            .map(|s| Arc::clone(s.value()))
        else {
            return false;
        };
        let prev = slot.compare_and_swap(&Some(Arc::clone(instance)), None);
        let removed = match &*prev {
            Some(current) => Arc::ptr_eq(current, instance),
            None => false,
        };
        if removed {
            self.bump();
        }
        removed
    }

    /// Every routed instance, sorted by name.
    #[must_use]
    pub fn routed(&self) -> Vec<Arc<PluginInstance>> {
        let mut all: Vec<_> = self.slots.iter().filter_map(|s| s.load_full()).collect();
        all.sort_by(|a, b| a.manifest().name.cmp(&b.manifest().name));
        all
    }

    /// Names with a routed instance, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<PluginName> {
        self.routed()
            .iter()
            .map(|i| i.manifest().name.clone())
            .collect()
    }

    /// Ticks on every routing change.
    #[must_use]
    pub fn changed(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}
