//! Shared helpers for keygate integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keygate::config::{AddresserConfig, DriverConfig};
use keygate::driver::{Driver, FakeDriver, SyncReport};
use keygate::{Config, NetConfig, NetworkManager, Registries};
use tokio::sync::broadcast;

/// A manager wired to a recording driver.
pub struct Harness {
    pub manager: Arc<NetworkManager>,
    pub driver: FakeDriver,
}

/// Registries with the built-ins plus a `fake` driver backed by `driver`.
pub fn registries_with(driver: &FakeDriver) -> Registries {
    let mut registries = Registries::builtin().expect("builtin registries");
    let fake = driver.clone();
    registries
        .drivers
        .register(
            "fake",
            Box::new(move |_: &DriverConfig| Ok(Arc::new(fake.clone()) as Arc<dyn Driver>)),
        )
        .expect("register fake driver");
    registries
}

/// Config using the fake driver with fast retries.
pub fn config_with(networks: Vec<NetConfig>) -> Config {
    let mut config = Config {
        networks,
        ..Config::default()
    };
    config.driver.implementation = "fake".to_string();
    config.driver.retry_backoff_ms = 1;
    config
}

/// Adds a `cidr-pool` allocator to a config.
pub fn with_pool(mut config: Config, name: &str, cidr: &str) -> Config {
    config.addressers.insert(
        name.to_string(),
        AddresserConfig {
            kind: "cidr-pool".to_string(),
            cidr: cidr.to_string(),
        },
    );
    config
}

pub async fn harness(config: Config) -> Harness {
    harness_with_driver(config, FakeDriver::new()).await
}

pub async fn harness_with_driver(config: Config, driver: FakeDriver) -> Harness {
    let registries = registries_with(&driver);
    let manager = NetworkManager::new(&config, &registries)
        .await
        .expect("manager should build");
    Harness {
        manager: Arc::new(manager),
        driver,
    }
}

/// Waits for the next sync report.
pub async fn next_report(rx: &mut broadcast::Receiver<SyncReport>) -> SyncReport {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("sync report in time")
        .expect("report channel open")
}
