//! Ports claimed by the instances on this host.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use lodestone_core::{Error, InstanceUuid, Result};

#[derive(Debug, Default)]
pub(crate) struct PortTable {
    owners: Mutex<HashMap<u32, InstanceUuid>>,
}

impl PortTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, InstanceUuid>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `port` for `uuid`. The claim is released on drop unless kept.
    ///
    /// Claiming a port the instance already holds succeeds and releases
    /// nothing on drop.
    pub fn claim(&self, port: u32, uuid: InstanceUuid) -> Result<PortClaim<'_>> {
        let mut owners = self.lock();
        let fresh = match owners.get(&port) {
            Some(owner) if *owner == uuid => false,
            Some(owner) => {
                return Err(Error::conflict(format!(
                    "port {port} is already used by instance {owner}"
                )));
            }
            None => {
                owners.insert(port, uuid);
                true
            }
        };
        Ok(PortClaim {
            table: self,
            port,
            uuid,
            fresh,
        })
    }

    pub fn owned_by(&self, uuid: InstanceUuid) -> Vec<u32> {
        let mut ports: Vec<u32> = self
            .lock()
            .iter()
            .filter(|(_, owner)| **owner == uuid)
            .map(|(port, _)| *port)
            .collect();
        ports.sort_unstable();
        ports
    }

    /// Release `port` if `uuid` holds it.
    pub fn release(&self, port: u32, uuid: InstanceUuid) {
        let mut owners = self.lock();
        if owners.get(&port) == Some(&uuid) {
            owners.remove(&port);
        }
    }

    pub fn release_all(&self, uuid: InstanceUuid) {
        self.lock().retain(|_, owner| *owner != uuid);
    }
}

/// A port held for an instance while the operation that needs it runs.
pub(crate) struct PortClaim<'a> {
    table: &'a PortTable,
    port: u32,
    uuid: InstanceUuid,
    fresh: bool,
}

impl PortClaim<'_> {
    pub fn keep(mut self) {
        self.fresh = false;
    }
}

impl Drop for PortClaim<'_> {
    fn drop(&mut self) {
        if self.fresh {
            self.table.release(self.port, self.uuid);
        }
    }
}
