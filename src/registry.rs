//! Sandbox registry: one durable sandbox per `(user, time slot)`.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::{RuntimeError, SandboxError};
use crate::identity::{self, SandboxIdentity};
use crate::runtime::{ContainerRuntime, SandboxSpec};
use crate::store::SessionStore;

/// A running sandbox as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHandle {
    pub name: String,
    pub volume_name: String,
    pub port: u16,
    pub session_id: String,
}

/// Host ports sandboxes may publish their shell service on.
#[derive(Debug, Clone, Copy)]
pub struct PortPool {
    start: u16,
    len: u16,
}

impl PortPool {
    pub fn new(start: u16, len: u16) -> Self {
        Self { start, len }
    }

    fn candidates(&self) -> impl Iterator<Item = u16> {
        let end = (u32::from(self.start) + u32::from(self.len)).min(u32::from(u16::MAX) + 1);
        (u32::from(self.start)..end).map(|port| port as u16)
    }

    /// First candidate not in `taken` that can currently be bound on the host.
    pub fn reserve(&self, taken: &HashSet<u16>) -> Result<u16, SandboxError> {
        self.candidates()
            .filter(|port| !taken.contains(port))
            .find(|port| TcpListener::bind((Ipv4Addr::UNSPECIFIED, *port)).is_ok())
            .ok_or(SandboxError::PortsExhausted {
                start: self.start,
                end: u32::from(self.start) + u32::from(self.len),
            })
    }
}

/// Creates, reuses and repairs sandboxes, and mirrors them into the session directory.
pub struct SandboxRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    store: SessionStore,
    config: SandboxConfig,
    ports: PortPool,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Ports picked for sandboxes still being created, not yet visible to the runtime.
    claimed: Arc<Mutex<HashSet<u16>>>,
}

/// A port held back from other creations until the runtime has bound it.
struct PortClaim {
    claimed: Arc<Mutex<HashSet<u16>>>,
    port: u16,
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.port);
    }
}

impl SandboxRegistry {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: SessionStore, config: SandboxConfig) -> Self {
        let ports = PortPool::new(config.port_range_start, config.port_range_len);
        Self {
            runtime,
            store,
            config,
            ports,
            locks: Mutex::new(HashMap::new()),
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn identity(&self, user_id: &str, session_id: &str) -> SandboxIdentity {
        SandboxIdentity::new(
            &self.config.name_prefix,
            &self.config.volume_prefix,
            user_id,
            session_id,
        )
    }

    /// Ensure the user's sandbox for the current time slot exists and runs.
    pub async fn ensure_sandbox(&self, user_id: &str) -> Result<SandboxHandle, SandboxError> {
        self.ensure_sandbox_in_slot(user_id, &identity::current_session_id())
            .await
    }

    /// Same as [`Self::ensure_sandbox`] for an explicit time slot.
    pub async fn ensure_sandbox_in_slot(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<SandboxHandle, SandboxError> {
        let identity = self.identity(user_id, session_id);

        let lock = self.lock_for(&identity.name);
        let result = {
            let _guard = lock.lock().await;
            self.ensure_locked(&identity).await
        };
        drop(lock);
        self.release_lock(&identity.name);

        let handle = result?;
        self.store
            .upsert(user_id, session_id, &handle.name, handle.port)
            .await?;
        Ok(handle)
    }

    async fn ensure_locked(&self, identity: &SandboxIdentity) -> Result<SandboxHandle, SandboxError> {
        let mut recreated = 0;
        loop {
            let port = match self.runtime.inspect(&identity.name).await? {
                Some(status) if status.running => {
                    debug!(sandbox = %identity.name, "Reusing running sandbox");
                    status
                        .port
                        .ok_or_else(|| SandboxError::MissingPort(identity.name.clone()))?
                }
                Some(status) => match self.runtime.start(&identity.name).await {
                    Ok(()) => {
                        info!(sandbox = %identity.name, "Restarted sandbox");
                        match status.port {
                            Some(port) => port,
                            None => self.running_port(&identity.name).await?,
                        }
                    }
                    Err(error) => {
                        if recreated >= self.config.max_recreate_attempts {
                            return Err(SandboxError::RecreateExhausted {
                                name: identity.name.clone(),
                                attempts: recreated,
                            });
                        }
                        recreated += 1;
                        warn!(sandbox = %identity.name, %error, attempt = recreated,
                              "Restart failed, removing and recreating");
                        self.runtime.remove(&identity.name).await?;
                        continue;
                    }
                },
                None => match self.create(identity).await {
                    Ok(port) => port,
                    Err(SandboxError::Runtime(RuntimeError::NameConflict(message))) => {
                        // Someone else (another server instance) won the race; adopt theirs.
                        warn!(sandbox = %identity.name, %message, "Creation race, re-inspecting");
                        if recreated >= self.config.max_recreate_attempts {
                            return Err(RuntimeError::NameConflict(message).into());
                        }
                        recreated += 1;
                        continue;
                    }
                    Err(error) => return Err(error),
                },
            };

            return Ok(SandboxHandle {
                name: identity.name.clone(),
                volume_name: identity.volume_name.clone(),
                port,
                session_id: identity.session_id.clone(),
            });
        }
    }

    async fn create(&self, identity: &SandboxIdentity) -> Result<u16, SandboxError> {
        self.runtime.ensure_volume(&identity.volume_name).await?;

        let listed: HashSet<u16> = self
            .runtime
            .list(&self.config.name_prefix)
            .await?
            .into_iter()
            .filter_map(|status| status.port)
            .collect();
        let claim = self.claim_port(&listed)?;
        let port = claim.port;

        let spec = SandboxSpec {
            name: identity.name.clone(),
            image: self.config.image.clone(),
            volume_name: identity.volume_name.clone(),
            volume_mount: self.config.volume_mount.clone(),
            shell_port: self.config.shell_port,
            host_port: port,
        };
        self.runtime.create(&spec).await?;
        self.runtime.start(&identity.name).await?;
        info!(sandbox = %identity.name, port, "Started new sandbox");
        // The container now owns the binding and shows up in `list`.
        drop(claim);
        Ok(port)
    }

    fn claim_port(&self, listed: &HashSet<u16>) -> Result<PortClaim, SandboxError> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        let taken: HashSet<u16> = listed.union(&claimed).copied().collect();
        let port = self.ports.reserve(&taken)?;
        claimed.insert(port);
        Ok(PortClaim {
            claimed: self.claimed.clone(),
            port,
        })
    }

    async fn running_port(&self, name: &str) -> Result<u16, SandboxError> {
        self.runtime
            .inspect(name)
            .await?
            .and_then(|status| status.port)
            .ok_or_else(|| SandboxError::MissingPort(name.to_string()))
    }

    /// Refresh the session directory from the sandboxes the runtime reports as running.
    ///
    /// Returns the number of sessions refreshed.
    pub async fn rediscover(&self) -> Result<usize, SandboxError> {
        let mut refreshed = 0;
        for status in self.runtime.list(&self.config.name_prefix).await? {
            if !status.running {
                continue;
            }
            let Some((user_id, session_id)) =
                SandboxIdentity::parse_name(&self.config.name_prefix, &status.name)
            else {
                debug!(sandbox = %status.name, "Skipping sandbox with unrecognized name");
                continue;
            };
            let Some(port) = status.port else {
                warn!(sandbox = %status.name, "Running sandbox has no published port");
                continue;
            };
            self.store
                .upsert(&user_id, &session_id, &status.name, port)
                .await?;
            refreshed += 1;
        }
        info!(refreshed, "Rediscovered running sandboxes");
        Ok(refreshed)
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    fn release_lock(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_skips_taken_ports() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let start = listener.local_addr().unwrap().port();
        let pool = PortPool::new(start, 1);
        // The only candidate is bound by the listener above.
        assert!(matches!(
            pool.reserve(&HashSet::new()),
            Err(SandboxError::PortsExhausted { .. })
        ));
        drop(listener);

        let pool = PortPool::new(start, 1);
        assert!(matches!(
            pool.reserve(&HashSet::from([start])),
            Err(SandboxError::PortsExhausted { .. })
        ));
    }

    #[test]
    fn candidates_stop_at_the_last_port() {
        let pool = PortPool::new(u16::MAX - 1, 10);
        assert_eq!(pool.candidates().collect::<Vec<_>>(), vec![u16::MAX - 1, u16::MAX]);
    }
}
