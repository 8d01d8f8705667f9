//! The network manager: peer lifecycle across all configured networks.
//!
//! Each network moves its peers through `staged -> approved -> active`.
//! Every lifecycle operation runs as one read-modify-write of the network's
//! state under that network's lock, including any cascaded approval or
//! activation, so concurrent requests and the expiration sweep never lose
//! each other's updates. Interface syncs are handed to the
//! [`SyncDispatcher`] after the state is persisted.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::config::{Config, ExpiryConfig};
use crate::driver::{SyncDispatcher, SyncReport, SyncStatus};
use crate::error::{NmError, Result};
use crate::hooks::HookRef;
use crate::ipam::Addresser;
use crate::network::Network;
use crate::registry::Registries;
use crate::state::StateStore;
use crate::types::{NetConfig, Peer};

/// A configured network and the lock guarding its state.
#[derive(Debug)]
pub(crate) struct ManagedNetwork {
    pub(crate) config: Arc<NetConfig>,
    pub(crate) lock: Mutex<()>,
}

/// Owns the configured networks and runs their peer lifecycle.
pub struct NetworkManager {
    pub(crate) networks: BTreeMap<String, ManagedNetwork>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) addressers: HashMap<String, Arc<dyn Addresser>>,
    pub(crate) hooks: HashMap<String, HookRef>,
    pub(crate) sync: Option<SyncDispatcher>,
    pub(crate) expiry: ExpiryConfig,
}

impl NetworkManager {
    /// Builds a manager from configuration, drawing implementations from
    /// `registries`.
    ///
    /// An unknown state store is fatal. Unknown allocators, hooks and
    /// drivers are logged and left out of service.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::Config`] if the configuration does not validate,
    /// [`NmError::UnknownStore`] if the store is not registered, or any
    /// error from constructing the store or reading persisted state.
    pub async fn new(config: &Config, registries: &Registries) -> Result<Self> {
        config.validate()?;
        let store_factory = registries.stores.resolve(&config.state.implementation)?;
        let store = store_factory(&config.state)?;

        let networks: BTreeMap<String, ManagedNetwork> = config
            .networks
            .iter()
            .map(|net| {
                (
                    net.id.clone(),
                    ManagedNetwork {
                        config: Arc::new(net.clone()),
                        lock: Mutex::new(()),
                    },
                )
            })
            .collect();

        let manager = Self {
            networks,
            store,
            addressers: build_addressers(config, registries),
            hooks: resolve_hooks(config, registries),
            sync: start_sync(config, registries),
            expiry: config.expiry.clone(),
        };

        manager.reserve_existing_addresses().await?;

        info!(
            networks = manager.networks.len(),
            store = %config.state.implementation,
            driver = %config.driver.implementation,
            addressers = manager.addressers.len(),
            "Network manager ready"
        );
        Ok(manager)
    }

    /// Configured networks in ID order.
    pub fn networks(&self) -> impl Iterator<Item = &NetConfig> {
        self.networks.values().map(|m| m.config.as_ref())
    }

    /// Whether any network needs the expiration sweep.
    #[must_use]
    pub fn uses_expiry(&self) -> bool {
        self.networks.values().any(|m| m.config.uses_expiry())
    }

    /// Expiration sweep settings.
    #[must_use]
    pub fn expiry_config(&self) -> &ExpiryConfig {
        &self.expiry
    }

    /// Whether an interface-sync driver is in service.
    #[must_use]
    pub fn has_driver(&self) -> bool {
        self.sync.is_some()
    }

    /// Whether the named allocator is in service.
    #[must_use]
    pub fn has_addresser(&self, name: &str) -> bool {
        self.addressers.contains_key(name)
    }

    /// Returns the network with freshly loaded state.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::UnknownNetwork`] if no network has this ID.
    pub async fn get_net(&self, network_id: &str) -> Result<Network> {
        let managed = self.managed(network_id)?;
        self.load(managed).await
    }

    /// Registers a peer: runs the network's hooks, stages the peer, and
    /// approves it straight away if the network auto-approves.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::InvalidPeer`] for a malformed key or metadata,
    /// the first hook failure, [`NmError::UnknownHook`] for a hook that is
    /// not installed, or any error from a cascaded approval.
    pub async fn register(&self, network_id: &str, peer: Peer) -> Result<()> {
        let managed = self.managed(network_id)?;
        peer.validate()?;
        let _guard = managed.lock.lock().await;

        for name in &managed.config.pre_approve_hooks {
            let hook = self
                .hooks
                .get(name)
                .ok_or_else(|| NmError::UnknownHook(name.clone()))?;
            if let Err(e) = hook.check(network_id, &peer) {
                info!(
                    network = %managed.config.name,
                    peer = %peer.pub_key,
                    hook = %name,
                    error = %e,
                    "Registration rejected"
                );
                return Err(e);
            }
        }

        let mut net = self.load(managed).await?;
        let key = peer.pub_key.clone();
        net.stage(peer);
        self.store_net(&net).await?;
        info!(network = %net.name(), peer = %key, "Staged peer");

        if net.config().approve_mode.is_auto() {
            info!(network = %net.name(), peer = %key, "Automatically approving peer");
            self.approve_locked(&mut net, &key).await?;
        }
        Ok(())
    }

    /// Approves a staged peer, assigning its addresses. Activates it too if
    /// the network auto-activates.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::UnknownPeer`] if the key is not staged, or an
    /// address assignment error.
    pub async fn approve(&self, network_id: &str, pub_key: &str) -> Result<()> {
        let managed = self.managed(network_id)?;
        let _guard = managed.lock.lock().await;
        let mut net = self.load(managed).await?;
        self.approve_locked(&mut net, pub_key).await
    }

    /// Disapproves a peer: removes it from the approved set, releases its
    /// addresses and deactivates it.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::UnknownPeer`] if the key is not approved.
    pub async fn disapprove(&self, network_id: &str, pub_key: &str) -> Result<()> {
        let managed = self.managed(network_id)?;
        let _guard = managed.lock.lock().await;
        let mut net = self.load(managed).await?;
        self.disapprove_locked(&mut net, pub_key).await
    }

    /// Activates an approved peer and syncs the interface.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::UnknownPeer`] if the key is not approved.
    pub async fn activate(&self, network_id: &str, pub_key: &str) -> Result<()> {
        let managed = self.managed(network_id)?;
        let _guard = managed.lock.lock().await;
        let mut net = self.load(managed).await?;
        self.activate_locked(&mut net, pub_key).await
    }

    /// Removes a peer from the active set. Deactivating an inactive key
    /// succeeds and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::UnknownNetwork`] or a store error.
    pub async fn deactivate(&self, network_id: &str, pub_key: &str) -> Result<()> {
        let managed = self.managed(network_id)?;
        let _guard = managed.lock.lock().await;
        let mut net = self.load(managed).await?;
        self.deactivate_locked(&mut net, pub_key).await
    }

    /// Totals of interface syncs for a network.
    #[must_use]
    pub fn sync_status(&self, network_id: &str) -> Option<SyncStatus> {
        self.sync.as_ref().and_then(|s| s.status(network_id))
    }

    /// Subscribes to interface-sync reports, if a driver is in service.
    #[must_use]
    pub fn subscribe_sync(&self) -> Option<broadcast::Receiver<SyncReport>> {
        self.sync.as_ref().map(SyncDispatcher::subscribe)
    }

    /// Drains outstanding interface syncs and stops the workers.
    pub async fn shutdown(&self) {
        if let Some(sync) = &self.sync {
            sync.shutdown().await;
        }
    }

    async fn approve_locked(&self, net: &mut Network, pub_key: &str) -> Result<()> {
        let mut peer = net.staged(pub_key)?.clone();
        let fresh = self.configure_peer(net, &mut peer)?;

        let stored = match net.approve(peer, Utc::now()) {
            Ok(()) => self.store_net(net).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            self.release_addresses(&fresh);
            return Err(e);
        }
        info!(network = %net.name(), peer = %pub_key, "Approved peer");

        if net.config().activate_mode.is_auto() {
            info!(network = %net.name(), peer = %pub_key, "Automatically activating peer");
            return self.activate_locked(net, pub_key).await;
        }
        Ok(())
    }

    async fn disapprove_locked(&self, net: &mut Network, pub_key: &str) -> Result<()> {
        let peer = net.disapprove(pub_key)?;
        let deactivated = net.deactivate(pub_key);
        // Addresses go back only once the removal is persisted.
        self.store_net(net).await?;
        self.deconfigure_peer(&peer);
        info!(network = %net.name(), peer = %pub_key, "Disapproved peer");
        if deactivated {
            info!(network = %net.name(), peer = %pub_key, "Deactivated peer");
            self.dispatch_sync(net).await;
        }
        Ok(())
    }

    async fn activate_locked(&self, net: &mut Network, pub_key: &str) -> Result<()> {
        net.activate(pub_key, Utc::now())?;
        self.store_net(net).await?;
        info!(network = %net.name(), peer = %pub_key, "Activated peer");
        self.dispatch_sync(net).await;
        Ok(())
    }

    async fn deactivate_locked(&self, net: &mut Network, pub_key: &str) -> Result<()> {
        let changed = net.deactivate(pub_key);
        self.store_net(net).await?;
        if changed {
            info!(network = %net.name(), peer = %pub_key, "Deactivated peer");
            self.dispatch_sync(net).await;
        } else {
            debug!(network = %net.name(), peer = %pub_key, "Peer was not active");
        }
        Ok(())
    }

    /// Assigns one address per required allocator, keeping any address the
    /// peer already holds from that allocator. Returns the newly assigned
    /// addresses.
    fn configure_peer(&self, net: &Network, peer: &mut Peer) -> Result<Vec<IpAddr>> {
        let previous = net
            .approved_peers
            .get(&peer.pub_key)
            .map(|p| p.addresses.clone())
            .unwrap_or_default();

        let mut addresses = Vec::with_capacity(net.config().addressers.len());
        let mut fresh = Vec::new();
        for name in &net.config().addressers {
            let Some(addresser) = self.addressers.get(name) else {
                warn!(network = %net.name(), addresser = %name, "Addresser is not in service");
                self.release_addresses(&fresh);
                return Err(NmError::UnknownAddresser(name.clone()));
            };
            if let Some(kept) = previous.iter().find(|a| addresser.contains(a.addr())) {
                addresses.push(*kept);
                continue;
            }
            match addresser.assign(net.id(), &peer.pub_key) {
                Ok(address) => {
                    fresh.push(address.addr());
                    addresses.push(address);
                }
                Err(e) => {
                    self.release_addresses(&fresh);
                    return Err(e);
                }
            }
        }

        peer.addresses = addresses;
        Ok(fresh)
    }

    pub(crate) fn deconfigure_peer(&self, peer: &Peer) {
        let addresses: Vec<IpAddr> = peer.addresses.iter().map(|a| a.addr()).collect();
        self.release_addresses(&addresses);
    }

    fn release_addresses(&self, addresses: &[IpAddr]) {
        for ip in addresses {
            match self.addressers.values().find(|a| a.contains(*ip)) {
                Some(addresser) => {
                    addresser.release(*ip);
                }
                None => debug!(ip = %ip, "No addresser in service owns address"),
            }
        }
    }

    async fn reserve_existing_addresses(&self) -> Result<()> {
        if self.addressers.is_empty() {
            return Ok(());
        }
        for managed in self.networks.values() {
            let state = self.store.get(&managed.config.id).await?;
            for peer in state.approved_peers.values() {
                for address in &peer.addresses {
                    let ip = address.addr();
                    match self.addressers.values().find(|a| a.contains(ip)) {
                        Some(addresser) => {
                            if let Err(e) = addresser.reserve(ip) {
                                debug!(ip = %ip, error = %e, "Address already reserved");
                            }
                        }
                        None => warn!(
                            network = %managed.config.id,
                            peer = %peer.pub_key,
                            ip = %ip,
                            "Persisted address belongs to no addresser in service"
                        ),
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn managed(&self, network_id: &str) -> Result<&ManagedNetwork> {
        self.networks
            .get(network_id)
            .ok_or_else(|| NmError::UnknownNetwork(network_id.to_string()))
    }

    pub(crate) async fn load(&self, managed: &ManagedNetwork) -> Result<Network> {
        let state = self.store.get(&managed.config.id).await?;
        Ok(Network::new(Arc::clone(&managed.config), state))
    }

    pub(crate) async fn store_net(&self, net: &Network) -> Result<()> {
        self.store.put(net.id(), &net.state).await
    }

    pub(crate) async fn dispatch_sync(&self, net: &Network) {
        match &self.sync {
            Some(sync) => sync.dispatch(net.id(), net.state.clone()).await,
            None => debug!(network = %net.id(), "No interface driver in service, skipping sync"),
        }
    }
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("networks", &self.networks.keys().collect::<Vec<_>>())
            .field("addressers", &self.addressers.keys().collect::<Vec<_>>())
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

/// Builds every allocator some network requires, once per name.
fn build_addressers(config: &Config, registries: &Registries) -> HashMap<String, Arc<dyn Addresser>> {
    let mut required: BTreeMap<&str, usize> = BTreeMap::new();
    for net in &config.networks {
        for name in &net.addressers {
            *required.entry(name.as_str()).or_default() += 1;
        }
    }

    let mut addressers = HashMap::new();
    for (name, users) in required {
        let built = config
            .addressers
            .get(name)
            .ok_or_else(|| NmError::UnknownAddresser(name.to_string()))
            .and_then(|entry| {
                let factory = registries.addressers.resolve(&entry.kind)?;
                factory(name, entry)
            });
        match built {
            Ok(addresser) => {
                debug!(addresser = name, networks = users, "Addresser in service");
                addressers.insert(name.to_string(), addresser);
            }
            Err(e) => warn!(addresser = name, error = %e, "Addresser is unavailable"),
        }
    }
    addressers
}

/// Collects the hooks networks refer to; unknown names are left out and
/// fail registration later.
fn resolve_hooks(config: &Config, registries: &Registries) -> HashMap<String, HookRef> {
    let mut hooks = HashMap::new();
    for net in &config.networks {
        for name in &net.pre_approve_hooks {
            if hooks.contains_key(name) {
                continue;
            }
            match registries.hooks.resolve(name) {
                Ok(hook) => {
                    hooks.insert(name.clone(), Arc::clone(hook));
                }
                Err(e) => warn!(network = %net.id, hook = %name, error = %e, "Hook is unavailable"),
            }
        }
    }
    hooks
}

fn start_sync(config: &Config, registries: &Registries) -> Option<SyncDispatcher> {
    let driver = registries
        .drivers
        .resolve(&config.driver.implementation)
        .and_then(|factory| factory(&config.driver));
    match driver {
        Ok(driver) => Some(SyncDispatcher::new(driver, &config.driver)),
        Err(e) => {
            warn!(
                driver = %config.driver.implementation,
                error = %e,
                "Interface driver is unavailable, syncs will be skipped"
            );
            None
        }
    }
}
