//! Local port reservation for forked processes.
//!
//! A port is "reserved" by binding a listener on it and dropping the
//! listener again. Between that moment and the child's own bind the port
//! could be taken by someone else; that window is accepted. What the
//! allocator does guarantee is that two live sessions are never handed the
//! same port: confirmed ports stay claimed until they are released.

use rand::Rng;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Mutex;
use tokio::net::TcpListener;

use crate::config::PortsConfig;
use crate::logging;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("no free port for slot {slot} after {attempts} attempts (last error: {last_error})")]
    Exhausted {
        slot: usize,
        attempts: u32,
        last_error: String,
    },
    #[error("port range {start}-{end} is empty")]
    EmptyRange { start: u16, end: u16 },
}

pub struct PortAllocator {
    range: RangeInclusive<u16>,
    retries: u32,
    claimed: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>, retries: u32) -> Self {
        Self {
            range,
            retries: retries.max(1),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(config: &PortsConfig) -> Self {
        Self::new(config.range_start..=config.range_end, config.retries)
    }

    /// Reserve `count` distinct ports, in slot order.
    ///
    /// On failure nothing stays claimed.
    pub async fn reserve(&self, count: usize) -> Result<Vec<u16>, PortError> {
        if self.range.is_empty() || *self.range.start() == 0 {
            return Err(PortError::EmptyRange {
                start: *self.range.start(),
                end: *self.range.end(),
            });
        }

        let mut ports = Vec::with_capacity(count);
        for slot in 0..count {
            match self.reserve_one(slot).await {
                Ok(port) => ports.push(port),
                Err(e) => {
                    self.release(&ports);
                    logging::warn(&format!("Port reservation failed: {}", e));
                    return Err(e);
                }
            }
        }

        logging::debug(&format!("Reserved ports {:?}", ports));
        Ok(ports)
    }

    async fn reserve_one(&self, slot: usize) -> Result<u16, PortError> {
        let mut last_error = String::from("none");

        for _ in 0..self.retries {
            let port = rand::rng().random_range(self.range.clone());

            if !self.claim(port) {
                last_error = format!("port {} already claimed", port);
                continue;
            }

            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    drop(listener);
                    return Ok(port);
                }
                Err(e) => {
                    self.unclaim(port);
                    last_error = format!("bind {}: {}", port, e);
                }
            }
        }

        Err(PortError::Exhausted {
            slot,
            attempts: self.retries,
            last_error,
        })
    }

    fn claim(&self, port: u16) -> bool {
        match self.claimed.lock() {
            Ok(mut claimed) => claimed.insert(port),
            Err(_) => false,
        }
    }

    fn unclaim(&self, port: u16) {
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.remove(&port);
        }
    }

    /// Return ports to the pool
    pub fn release(&self, ports: &[u16]) {
        if let Ok(mut claimed) = self.claimed.lock() {
            for port in ports {
                claimed.remove(port);
            }
        }
    }

    /// Number of ports currently claimed by live sessions
    pub fn claimed_count(&self) -> usize {
        self.claimed.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.claimed
            .lock()
            .map(|c| c.contains(&port))
            .unwrap_or(false)
    }
}
