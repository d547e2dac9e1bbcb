//! Driver configuration surface. Loadable from TOML/JSON through serde;
//! the auth token and resolver are runtime-only and set in code.

use serde_derive::Deserialize;
use std::time::Duration;

use crate::address::Resolver;
use crate::auth::AuthToken;
use crate::security::Trust;

// Connection pool management
pub const DEFAULT_MAX_CONNECTION_LIFETIME: f64 = 3600.0; // 1h
pub const DEFAULT_MAX_CONNECTION_POOL_SIZE: usize = 100;
pub const DEFAULT_CONNECTION_TIMEOUT: f64 = 5.0; // 5s

pub const DEFAULT_KEEP_ALIVE: bool = true;

// Connection settings
pub const DEFAULT_CONNECTION_ACQUISITION_TIMEOUT: f64 = 60.0; // 1m

pub const DEFAULT_USER_AGENT: &str = concat!("bolt/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `None` resolves to the encrypted default.
    pub encrypted: Option<bool>,
    pub trust: Trust,
    pub user_agent: String,
    /// Seconds a connection may live before being retired on release.
    pub max_connection_lifetime: f64,
    /// Upper bound of connections per address slot.
    pub max_connection_pool_size: usize,
    /// Seconds allowed for the TCP connect and handshake.
    pub connection_timeout: f64,
    /// Seconds `acquire` may wait on an exhausted pool.
    pub connection_acquisition_timeout: f64,
    pub keep_alive: bool,
    #[serde(skip)]
    pub auth: AuthToken,
    #[serde(skip)]
    pub resolver: Option<Resolver>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            encrypted: None,
            trust: Trust::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_connection_lifetime: DEFAULT_MAX_CONNECTION_LIFETIME,
            max_connection_pool_size: DEFAULT_MAX_CONNECTION_POOL_SIZE,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            connection_acquisition_timeout: DEFAULT_CONNECTION_ACQUISITION_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            auth: AuthToken::default(),
            resolver: None,
        }
    }
}

impl Config {
    /// Convenience for the common case: defaults plus credentials.
    pub fn with_auth(auth: AuthToken) -> Config {
        Config {
            auth,
            ..Config::default()
        }
    }

    #[inline]
    pub fn max_connection_lifetime(&self) -> Duration {
        Duration::from_secs_f64(self.max_connection_lifetime)
    }

    #[inline]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout)
    }

    #[inline]
    pub fn connection_acquisition_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_acquisition_timeout)
    }
}
