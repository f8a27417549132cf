//! Configuration of a [`Nexus`](crate::Nexus).

use std::env;
use std::time::Duration;

use crate::type_alias::*;

/// Network protocol used when no listen address is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// RDMA verbs fabric.
    Verbs,

    /// TCP fabric.
    #[default]
    Tcp,
}

impl TransportKind {
    /// Info string handed to the network class.
    pub fn info_string(self) -> &'static str {
        match self {
            Self::Verbs => "ofi+verbs://",
            Self::Tcp => "ofi+tcp://",
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct NexusConfig {
    /// Protocol selection for self-assigned addresses.
    /// Default: TCP
    pub transport: TransportKind,
    /// Give every non-primary context its own network class.
    /// Default: false
    pub multi_na: bool,
    /// Listen for inbound requests.
    /// Default: true
    pub is_server: bool,
    /// Rank of this process, stamped into every outgoing request header.
    /// Default: 0
    pub self_rank: Rank,
    /// Address lookup timeout.
    /// Default: 10s
    pub connect_timeout: Duration,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            multi_na: false,
            is_server: true,
            self_rank: 0,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl NexusConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from the environment.
    ///
    /// - `FABRIC_RPC_VERBS`: non-zero selects [`TransportKind::Verbs`].
    /// - `FABRIC_RPC_MULTI_NA`: non-zero enables multi-NA mode.
    /// - `FABRIC_RPC_RANK`: rank of this process.
    /// - `FABRIC_RPC_CONNECT_TIMEOUT_MS`: address lookup timeout.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse::<u32>("FABRIC_RPC_VERBS") {
            config.transport = if v != 0 {
                TransportKind::Verbs
            } else {
                TransportKind::Tcp
            };
        }
        if let Some(v) = env_parse::<u32>("FABRIC_RPC_MULTI_NA") {
            config.multi_na = v != 0;
        }
        if let Some(rank) = env_parse::<Rank>("FABRIC_RPC_RANK") {
            config.self_rank = rank;
        }
        if let Some(ms) = env_parse::<u64>("FABRIC_RPC_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        config
    }

    /// Set the transport protocol.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Enable or disable multi-NA mode.
    pub fn with_multi_na(mut self, multi_na: bool) -> Self {
        self.multi_na = multi_na;
        self
    }

    /// Set whether this process listens for requests.
    pub fn with_server(mut self, is_server: bool) -> Self {
        self.is_server = is_server;
        self
    }

    /// Set the rank of this process.
    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.self_rank = rank;
        self
    }

    /// Set the address lookup timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}
