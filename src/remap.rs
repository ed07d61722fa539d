//! Port remapping inside the forked process.
//!
//! The parent passes `original -> reassigned` pairs through the
//! environment. The forked application calls [`install`] before it binds
//! anything and then binds through [`bind_tcp`] (or asks [`remap`] for the
//! port to use). Ports that are not in the table bind unchanged, so the
//! same code path works in the live process where no table exists.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::{TcpListener, ToSocketAddrs};

/// JSON object of original port -> reassigned port
pub const ENV_PORT_REMAP: &str = "LIVEDEBUG_PORT_REMAP";
/// Script-debugging port the forked runtime listens on
pub const ENV_DEBUG_PORT: &str = "LIVEDEBUG_DEBUG_PORT";
/// Parent coordination port (ready signal, session pushes)
pub const ENV_CALLBACK_PORT: &str = "LIVEDEBUG_CALLBACK_PORT";
/// Session the forked process was started for
pub const ENV_SESSION_ID: &str = "LIVEDEBUG_SESSION_ID";

static HOOK: OnceLock<RemapTable> = OnceLock::new();

/// Original port -> reassigned port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapTable {
    map: BTreeMap<u16, u16>,
}

impl RemapTable {
    pub fn new(map: BTreeMap<u16, u16>) -> Self {
        Self { map }
    }

    /// Read the table from `LIVEDEBUG_PORT_REMAP`. Missing variable means an
    /// empty table (not forked).
    pub fn from_env() -> Result<Self> {
        match std::env::var(ENV_PORT_REMAP) {
            Ok(raw) => Self::decode(&raw),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Parse the env representation: `{"8080": 41234}`
    pub fn decode(raw: &str) -> Result<Self> {
        let parsed: BTreeMap<String, u16> =
            serde_json::from_str(raw).context("Invalid port remap table")?;
        let mut map = BTreeMap::new();
        for (original, reassigned) in parsed {
            let original: u16 = original
                .trim()
                .parse()
                .with_context(|| format!("Invalid original port in remap table: {}", original))?;
            map.insert(original, reassigned);
        }
        Ok(Self { map })
    }

    /// Env representation of this table
    pub fn encode(&self) -> String {
        let as_strings: BTreeMap<String, u16> = self
            .map
            .iter()
            .map(|(original, reassigned)| (original.to_string(), *reassigned))
            .collect();
        serde_json::to_string(&as_strings).unwrap_or_else(|_| "{}".to_string())
    }

    /// Port to bind instead of `port`
    pub fn remap(&self, port: u16) -> u16 {
        self.map.get(&port).copied().unwrap_or(port)
    }

    pub fn get(&self, port: u16) -> Option<u16> {
        self.map.get(&port).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.map.iter().map(|(k, v)| (*k, *v))
    }

    pub fn as_map(&self) -> &BTreeMap<u16, u16> {
        &self.map
    }
}

/// Install the process-wide hook from the environment.
///
/// Call once at startup, before any listener is bound. Later calls return
/// the already installed table.
pub fn install() -> Result<&'static RemapTable> {
    if let Some(table) = HOOK.get() {
        return Ok(table);
    }
    let table = RemapTable::from_env()?;
    Ok(HOOK.get_or_init(|| table))
}

/// Install an explicit table (tests, embedding without env)
pub fn install_table(table: RemapTable) -> &'static RemapTable {
    HOOK.get_or_init(|| table)
}

/// Remap a port through the installed hook. Without a hook the port is
/// returned unchanged.
pub fn remap(port: u16) -> u16 {
    HOOK.get().map(|table| table.remap(port)).unwrap_or(port)
}

/// Remap the port of a socket address through the installed hook
pub fn remap_addr(addr: SocketAddr) -> SocketAddr {
    let mut addr = addr;
    addr.set_port(remap(addr.port()));
    addr
}

/// Bind a TCP listener, substituting the reassigned port when the
/// requested one is remapped. Errors are those of the underlying bind.
pub async fn bind_tcp<A: ToSocketAddrs>(addr: A) -> std::io::Result<TcpListener> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(addr).await?.map(remap_addr).collect();
    TcpListener::bind(addrs.as_slice()).await
}

/// Whether this process was started as a forked debugging copy
pub fn is_forked() -> bool {
    std::env::var(ENV_SESSION_ID).is_ok()
}
