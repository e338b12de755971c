//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The store URL may carry credentials, so it stays a `SecretString`.

pub mod worker;

pub use worker::{WorkerFile, WorkerOptions};

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::PathBuf;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub store_url: SecretString,
    /// Defaults to [`reachable_ip`] when unset.
    pub worker_id: Option<String>,
    pub worker_file: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            store_url: SecretString::from(required_var("TASKQ_STORE_URL")?),
            worker_id: std::env::var("TASKQ_WORKER_ID").ok(),
            worker_file: std::env::var("TASKQ_WORKER_CONFIG").ok().map(PathBuf::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(|| reachable_ip().to_string())
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Address other hosts would reach this one on. Connecting a UDP socket
/// sends nothing; it only asks the OS which interface it would route through.
pub fn reachable_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
