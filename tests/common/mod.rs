//! Shared test fixtures: an in-memory secret store and a recording service
//! manager, so processor and reconciler behavior can be exercised without a
//! real secret store or systemd.

use async_trait::async_trait;
use opsync::config::{SecretSpec, ServiceAction, VaultRef};
use opsync::store::{FetchError, RetryPolicy, SecretStore, Session};
use opsync::systemd::{ServiceControlError, ServiceManager};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory secret store shared between the test and the session under test
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    values: Mutex<HashMap<String, Vec<u8>>>,
    // remaining transient failures per reference
    outages: Mutex<HashMap<String, u32>>,
    fetch_count: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: &VaultRef, value: &[u8]) {
        self.inner
            .values
            .lock()
            .unwrap()
            .insert(reference.to_string(), value.to_vec());
    }

    /// Make the next `times` fetches of `reference` fail as unavailable
    pub fn fail_next(&self, reference: &VaultRef, times: u32) {
        self.inner
            .outages
            .lock()
            .unwrap()
            .insert(reference.to_string(), times);
    }

    pub fn fetch_count(&self) -> u32 {
        self.inner.fetch_count.load(Ordering::SeqCst)
    }

    /// Session over this store with zero-delay retries for fast tests
    pub fn session(&self) -> Session {
        Session::new(
            Box::new(self.clone()),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
        )
    }
}

#[async_trait]
impl SecretStore for InMemoryStore {
    async fn fetch(&self, reference: &VaultRef) -> Result<Vec<u8>, FetchError> {
        self.inner.fetch_count.fetch_add(1, Ordering::SeqCst);
        let key = reference.to_string();

        let mut outages = self.inner.outages.lock().unwrap();
        if let Some(remaining) = outages.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::Unavailable {
                    reference: key,
                    source: anyhow::anyhow!("simulated outage"),
                });
            }
        }
        drop(outages);

        self.inner
            .values
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(FetchError::NotFound { reference: key })
    }
}

/// Service manager that records every action and fails on demand
#[derive(Clone, Default)]
pub struct RecordingManager {
    inner: Arc<ManagerInner>,
}

#[derive(Default)]
struct ManagerInner {
    calls: Mutex<Vec<(String, ServiceAction)>>,
    failing_units: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_unit(&self, unit: &str) {
        self.inner
            .failing_units
            .lock()
            .unwrap()
            .insert(unit.to_string());
    }

    /// Delay every action, for exercising the per-call timeout
    pub fn delay_actions(&self, delay: Duration) {
        *self.inner.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<(String, ServiceAction)> {
        self.inner.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceManager for RecordingManager {
    async fn perform(&self, unit: &str, action: ServiceAction) -> Result<(), ServiceControlError> {
        self.inner
            .calls
            .lock()
            .unwrap()
            .push((unit.to_string(), action));

        let delay = *self.inner.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.inner.failing_units.lock().unwrap().contains(unit) {
            use std::os::unix::process::ExitStatusExt;
            return Err(ServiceControlError::CommandFailed {
                unit: unit.to_string(),
                verb: action.verb(),
                status: std::process::ExitStatus::from_raw(1 << 8),
                stderr: format!("Failed to {} {}: unit not loaded", action.verb(), unit),
            });
        }
        Ok(())
    }
}

/// Spec addressing `Infra/<key>/password`, materialized at `<output_file>`
pub fn spec(key: &str, output_file: &str) -> SecretSpec {
    SecretSpec {
        key: key.to_string(),
        vault_ref: vault_ref(key),
        output_file: output_file.to_string(),
        owner: None,
        group: None,
        mode: None,
    }
}

pub fn vault_ref(item: &str) -> VaultRef {
    VaultRef {
        vault: "Infra".to_string(),
        item: item.to_string(),
        field: "password".to_string(),
    }
}
