//! Name-keyed registries for pluggable collaborators.
//!
//! Registries are plain values built by the assembly code with explicit
//! `register` calls and handed to the manager by reference.

use std::collections::BTreeMap;

use crate::driver::{self, DriverFactory};
use crate::error::{NmError, Result};
use crate::hooks::{self, HookRef};
use crate::ipam::{self, AddresserFactory};
use crate::state::{self, StoreFactory};

/// What a registry holds; selects the unknown-name error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    /// State store factories.
    Store,
    /// Address allocator factories.
    Addresser,
    /// Interface-sync driver factories.
    Driver,
    /// Pre-approval hooks.
    Hook,
}

impl RegistryKind {
    fn label(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Addresser => "addresser",
            Self::Driver => "driver",
            Self::Hook => "hook",
        }
    }

    fn unknown(self, name: &str) -> NmError {
        let name = name.to_string();
        match self {
            Self::Store => NmError::UnknownStore(name),
            Self::Addresser => NmError::UnknownAddresser(name),
            Self::Driver => NmError::UnknownDriver(name),
            Self::Hook => NmError::UnknownHook(name),
        }
    }
}

/// A map from unique names to entries of one kind.
pub struct Registry<T> {
    kind: RegistryKind,
    entries: BTreeMap<String, T>,
}

impl<T> Registry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(kind: RegistryKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Registers an entry under a unique name.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::DuplicateName`] if the name is taken.
    pub fn register(&mut self, name: impl Into<String>, entry: T) -> Result<()> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(NmError::DuplicateName {
                kind: self.kind.label(),
                name,
            });
        }
        self.entries.insert(name, entry);
        Ok(())
    }

    /// Looks up an entry by name.
    ///
    /// # Errors
    ///
    /// Returns the unknown-name error for this registry's kind.
    pub fn resolve(&self, name: &str) -> Result<&T> {
        self.entries.get(name).ok_or_else(|| self.kind.unknown(name))
    }

    /// Returns true if the name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// The kind of entries held.
    #[must_use]
    pub fn kind(&self) -> RegistryKind {
        self.kind
    }
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("names", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Every registry the manager draws from.
#[derive(Debug)]
pub struct Registries {
    /// State store factories by implementation name.
    pub stores: Registry<StoreFactory>,
    /// Address allocator factories by allocator kind.
    pub addressers: Registry<AddresserFactory>,
    /// Interface-sync driver factories by implementation name.
    pub drivers: Registry<DriverFactory>,
    /// Pre-approval hooks by name.
    pub hooks: Registry<HookRef>,
}

impl Registries {
    /// Creates empty registries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stores: Registry::new(RegistryKind::Store),
            addressers: Registry::new(RegistryKind::Addresser),
            drivers: Registry::new(RegistryKind::Driver),
            hooks: Registry::new(RegistryKind::Hook),
        }
    }

    /// Creates registries holding every built-in implementation.
    ///
    /// # Errors
    ///
    /// Returns an error only if two built-ins share a name.
    pub fn builtin() -> Result<Self> {
        let mut registries = Self::new();
        state::register_builtin(&mut registries.stores)?;
        ipam::register_builtin(&mut registries.addressers)?;
        driver::register_builtin(&mut registries.drivers)?;
        hooks::register_builtin(&mut registries.hooks)?;
        Ok(registries)
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = Registry::new(RegistryKind::Driver);
        registry.register("log", 1u8).expect("register");
        assert_eq!(*registry.resolve("log").expect("resolve"), 1);
        assert!(registry.contains("log"));
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = Registry::new(RegistryKind::Store);
        registry.register("json", ()).expect("first register");
        let err = registry.register("json", ()).expect_err("duplicate");
        assert!(matches!(err, NmError::DuplicateName { kind: "store", .. }));
    }

    #[test]
    fn test_resolve_unknown_is_kind_specific() {
        let stores: Registry<()> = Registry::new(RegistryKind::Store);
        let addressers: Registry<()> = Registry::new(RegistryKind::Addresser);
        let drivers: Registry<()> = Registry::new(RegistryKind::Driver);
        let hooks: Registry<()> = Registry::new(RegistryKind::Hook);

        assert!(matches!(stores.resolve("x"), Err(NmError::UnknownStore(_))));
        assert!(matches!(
            addressers.resolve("x"),
            Err(NmError::UnknownAddresser(_))
        ));
        assert!(matches!(drivers.resolve("x"), Err(NmError::UnknownDriver(_))));
        assert!(matches!(hooks.resolve("x"), Err(NmError::UnknownHook(_))));
    }

    #[test]
    fn test_builtin_registries() {
        let registries = Registries::builtin().expect("builtin");
        assert!(registries.stores.contains("memory"));
        assert!(registries.stores.contains("json"));
        assert!(registries.addressers.contains("cidr-pool"));
        assert!(registries.drivers.contains("log"));
        assert!(registries.drivers.contains("wg-file"));
        assert!(registries.hooks.contains("wireguard-key"));
        assert!(registries.hooks.contains("require-owner"));
    }
}
