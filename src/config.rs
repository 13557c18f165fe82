//! Service configuration, read from the environment at startup.

use std::env;

use crate::error::{Error, Result};

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_URL: &str = "sqlite:cad.db?mode=rwc";

/// Role-play servers are grouped in tiers 1-3, each with servers 1-10.
const MAX_TIER: u8 = 3;
const MAX_SERVER: u8 = 10;

/// Which role-play server this process hosts.
///
/// Every collection in the store is scoped by the server id, so one database
/// can hold several independent shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSelection {
    pub tier: u8,
    pub server: u8,
}

impl ServerSelection {
    pub fn new(tier: u8, server: u8) -> Result<Self> {
        if !(1..=MAX_TIER).contains(&tier) {
            return Err(Error::Config(format!("tier must be 1-{MAX_TIER}, got {tier}")));
        }
        if !(1..=MAX_SERVER).contains(&server) {
            return Err(Error::Config(format!(
                "server must be 1-{MAX_SERVER}, got {server}"
            )));
        }
        Ok(Self { tier, server })
    }

    /// Namespace used for collection paths, e.g. `T1S4`.
    pub fn server_id(&self) -> String {
        format!("T{}S{}", self.tier, self.server)
    }
}

impl Default for ServerSelection {
    fn default() -> Self {
        Self { tier: 1, server: 1 }
    }
}

/// Console configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,

    /// SQLite connection string.
    pub database_url: String,

    pub server: ServerSelection,

    /// Credential a supervisor must present at login. Supervisor sessions are
    /// refused when unset.
    pub supervisor_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_URL.to_string(),
            server: ServerSelection::default(),
            supervisor_key: None,
        }
    }
}

impl Config {
    /// Load configuration from `CAD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let port = match env::var("CAD_PORT") {
            Ok(value) => value
                .parse()
                .map_err(|_| Error::Config(format!("CAD_PORT is not a port: {value}")))?,
            Err(_) => DEFAULT_PORT,
        };

        let database_url =
            env::var("CAD_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_URL.to_string());

        let tier = parse_u8("CAD_SERVER_TIER", 1)?;
        let server = parse_u8("CAD_SERVER_NUMBER", 1)?;

        let supervisor_key = env::var("CAD_SUPERVISOR_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());

        Ok(Self {
            port,
            database_url,
            server: ServerSelection::new(tier, server)?,
            supervisor_key,
        })
    }
}

fn parse_u8(name: &str, default: u8) -> Result<u8> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} is not a number: {value}"))),
        Err(_) => Ok(default),
    }
}
