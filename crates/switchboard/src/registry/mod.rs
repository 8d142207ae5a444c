//! Live plugin registry.
//!
//! The [`PluginRegistry`] owns one [`PluginHandle`] per started plugin. The
//! host adds handles after a successful start and the dispatcher prunes them
//! when a plugin dies. Readers take a snapshot of `Arc` handles, so a
//! trigger fan-out never observes a handle mid-teardown: removal only drops
//! the registry's reference, and killing a handle resolves in-flight calls
//! with a transport failure.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::capability::Dispenser;
use crate::error::PluginError;
use crate::events::EventClient;
use crate::process::PluginProcess;
use crate::transport::{CallError, Channel};

const REGISTRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::registry");

/// Dispatch health of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    /// Receives triggers.
    Live,
    /// Timed out recently; skipped until a health check succeeds.
    Suspect,
    /// Killed or crashed.
    Dead,
}

/// One started plugin: its process, channel, and dispensed event client.
#[derive(Debug)]
pub struct PluginHandle {
    name: String,
    events: EventClient,
    process: Option<PluginProcess>,
    status: Mutex<PluginStatus>,
    subscriptions: Mutex<BTreeSet<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PluginHandle {
    /// Wraps a started process and dispenses its `eventplugin` capability.
    ///
    /// The process is killed when dispensing fails.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CapabilityNotExported`] or
    /// [`PluginError::Call`] from the dispenser.
    pub fn from_process(process: PluginProcess, timeout: Duration) -> Result<Self, PluginError> {
        let events = EventClient::dispense(&process.dispenser(timeout))?;
        Ok(Self::from_parts(process.name().to_owned(), events, Some(process)))
    }

    /// Wraps a channel that is not backed by a child process.
    ///
    /// # Errors
    ///
    /// Returns the dispenser's error when the peer does not export
    /// `eventplugin`.
    pub fn attach(
        name: impl Into<String>,
        channel: Channel,
        timeout: Duration,
    ) -> Result<Self, PluginError> {
        let plugin = name.into();
        let events = EventClient::dispense(&Dispenser::new(plugin.clone(), channel, timeout))?;
        Ok(Self::from_parts(plugin, events, None))
    }

    fn from_parts(name: String, events: EventClient, process: Option<PluginProcess>) -> Self {
        Self {
            name,
            events,
            process,
            status: Mutex::new(PluginStatus::Live),
            subscriptions: Mutex::new(BTreeSet::new()),
        }
    }

    /// Returns the plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the event client.
    #[must_use]
    pub const fn events(&self) -> &EventClient {
        &self.events
    }

    /// Returns the channel to the plugin.
    #[must_use]
    pub const fn channel(&self) -> &Channel {
        self.events.stub().channel()
    }

    /// Returns the child process, when the plugin runs as one.
    #[must_use]
    pub const fn process(&self) -> Option<&PluginProcess> {
        self.process.as_ref()
    }

    /// Returns the dispatch status.
    #[must_use]
    pub fn status(&self) -> PluginStatus {
        *lock(&self.status)
    }

    /// Excludes the plugin from triggers until [`Self::mark_live`].
    ///
    /// Has no effect on a dead plugin.
    pub fn mark_suspect(&self) {
        let mut status = lock(&self.status);
        if *status == PluginStatus::Live {
            *status = PluginStatus::Suspect;
        }
    }

    /// Returns a suspect plugin to service.
    ///
    /// Has no effect on a dead plugin.
    pub fn mark_live(&self) {
        let mut status = lock(&self.status);
        if *status == PluginStatus::Suspect {
            *status = PluginStatus::Live;
        }
    }

    /// Returns `true` while the plugin is not dead and its channel is open.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.status() != PluginStatus::Dead
            && self
                .process
                .as_ref()
                .map_or_else(|| !self.channel().is_closed(), PluginProcess::is_alive)
    }

    /// Probes the plugin.
    ///
    /// # Errors
    ///
    /// Propagates the ping failure.
    pub fn ping(&self, timeout: Duration) -> Result<(), CallError> {
        self.channel().ping(timeout)
    }

    /// Marks the plugin dead, closes its channel and stops its process.
    ///
    /// Calling `kill` again does nothing.
    pub fn kill(&self) {
        {
            let mut status = lock(&self.status);
            if *status == PluginStatus::Dead {
                return;
            }
            *status = PluginStatus::Dead;
        }
        debug!(target: REGISTRY_TARGET, plugin = %self.name, "killing plugin");
        self.channel().close();
        if let Some(process) = &self.process {
            process.kill();
        }
        lock(&self.subscriptions).clear();
    }

    /// Replaces the recorded subscriptions.
    pub fn set_subscriptions(&self, triggers: &[String]) {
        let mut subscriptions = lock(&self.subscriptions);
        subscriptions.clear();
        subscriptions.extend(triggers.iter().cloned());
    }

    /// Returns the recorded subscriptions in name order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).iter().cloned().collect()
    }

    /// Returns `true` when the plugin registered for `event`.
    #[must_use]
    pub fn is_subscribed(&self, event: &str) -> bool {
        lock(&self.subscriptions).contains(event)
    }
}

/// Registry of started plugins in start order.
///
/// # Example
///
/// ```
/// use switchboard::registry::PluginRegistry;
///
/// let registry = PluginRegistry::new();
/// assert!(registry.is_empty());
/// assert!(registry.snapshot().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RwLock<Vec<Arc<PluginHandle>>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handle.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyRegistered`] when a plugin with the same
    /// name is present; the rejected handle is killed.
    pub fn insert(&self, handle: PluginHandle) -> Result<Arc<PluginHandle>, PluginError> {
        let mut plugins = self.write();
        if plugins.iter().any(|existing| existing.name() == handle.name()) {
            handle.kill();
            return Err(PluginError::AlreadyRegistered {
                name: handle.name().to_owned(),
            });
        }
        let shared = Arc::new(handle);
        plugins.push(Arc::clone(&shared));
        debug!(target: REGISTRY_TARGET, plugin = %shared.name(), total = plugins.len(), "plugin registered");
        Ok(shared)
    }

    /// Looks up a plugin by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<PluginHandle>> {
        self.read().iter().find(|handle| handle.name() == name).cloned()
    }

    /// Removes a plugin and returns its handle.
    #[must_use = "the removed handle keeps the plugin running until it is killed or dropped"]
    pub fn remove(&self, name: &str) -> Option<Arc<PluginHandle>> {
        let mut plugins = self.write();
        let index = plugins.iter().position(|handle| handle.name() == name)?;
        let removed = plugins.remove(index);
        debug!(target: REGISTRY_TARGET, plugin = name, total = plugins.len(), "plugin removed");
        Some(removed)
    }

    /// Removes `handle` if it is still the entry registered under its name.
    ///
    /// A replacement started under the same name is left in place.
    #[must_use = "the removed handle keeps the plugin running until it is killed or dropped"]
    pub fn remove_if_current(&self, handle: &PluginHandle) -> Option<Arc<PluginHandle>> {
        let mut plugins = self.write();
        let index = plugins
            .iter()
            .position(|entry| std::ptr::eq(Arc::as_ptr(entry), handle))?;
        let removed = plugins.remove(index);
        debug!(target: REGISTRY_TARGET, plugin = %removed.name(), total = plugins.len(), "plugin removed");
        Some(removed)
    }

    /// Returns every registered handle.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<PluginHandle>> {
        self.read().clone()
    }

    /// Returns the handles currently eligible for triggers.
    #[must_use]
    pub fn live(&self) -> Vec<Arc<PluginHandle>> {
        self.with_status(PluginStatus::Live)
    }

    /// Returns the handles awaiting a health check.
    #[must_use]
    pub fn suspects(&self) -> Vec<Arc<PluginHandle>> {
        self.with_status(PluginStatus::Suspect)
    }

    /// Returns the registered names in start order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.read()
            .iter()
            .map(|handle| handle.name().to_owned())
            .collect()
    }

    /// Returns the number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` when no plugin is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Removes and returns every handle.
    #[must_use = "drained handles keep their plugins running until killed or dropped"]
    pub fn drain(&self) -> Vec<Arc<PluginHandle>> {
        std::mem::take(&mut *self.write())
    }

    fn with_status(&self, status: PluginStatus) -> Vec<Arc<PluginHandle>> {
        self.read()
            .iter()
            .filter(|handle| handle.status() == status)
            .cloned()
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<PluginHandle>>> {
        self.plugins.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<PluginHandle>>> {
        self.plugins.write().unwrap_or_else(PoisonError::into_inner)
    }
}
