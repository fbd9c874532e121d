// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Logging sink parameters consumed by `cfg::logger::init_logger`.
    pub log: LogConfig,
    /// Listen port and I/O thread count. Absent for client-only processes.
    #[serde(default)]
    pub server: Option<ServerConfig>,
    /// Services this process provides and registers in the directory.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    /// Statically configured client stubs (service name -> endpoint).
    #[serde(default)]
    pub stubs: HashMap<String, RpcStubConfig>,
    /// etcd endpoint and credentials for the service directory.
    #[serde(default)]
    pub etcd: Option<EtcdConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogConfig {
    /// Log level filter (`trace` .. `error`), EnvFilter syntax allowed.
    pub level: String,

    #[serde(default)]
    /// Base name of the log file. Empty means log to stdout.
    pub file_name: String,

    #[serde(default)]
    /// Directory the log files live in.
    pub file_path: String,

    #[serde(default = "default_max_file_size")]
    /// Upper bound on a single log file, in bytes.
    pub max_file_size: u64,

    #[serde(default = "default_sync_interval")]
    /// Interval at which buffered log lines are pushed to the sink.
    pub sync_interval_ms: u64,
}

fn default_max_file_size() -> u64 {
    1 << 30
}

fn default_sync_interval() -> u64 {
    500
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    /// TCP port the acceptor listens on.
    pub port: u16,

    /// Number of I/O threads in the pool, each owning one event loop.
    pub io_threads: usize,
}

/// One service provided by this process, registered under
/// `/rocket/service/{name}/{host:port}`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ServiceConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Statically configured peer for a named service (single endpoint).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcStubConfig {
    /// Endpoint in `host:port` form.
    pub addr: String,
    #[serde(default = "default_stub_timeout")]
    pub timeout_ms: u64,
}

fn default_stub_timeout() -> u64 {
    1000
}

impl RpcStubConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.addr
            .parse()
            .with_context(|| format!("bad stub addr {:?}", self.addr))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EtcdConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl EtcdConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value. Fatal errors abort startup at the caller.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path).with_context(|| {
            format!("failed to read config file {:?}", path.as_ref())
        })?;
        let cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.log.level.is_empty(), "log.level must not be empty");
        ensure!(
            self.log.max_file_size > 0,
            "log.max_file_size must be positive"
        );

        if let Some(server) = &self.server {
            ensure!(server.io_threads >= 1, "server.io_threads must be >= 1");
        }

        for service in &self.services {
            ensure!(
                !service.name.is_empty() && !service.host.is_empty(),
                "service entries need a name and a host"
            );
        }

        for (name, stub) in &self.stubs {
            stub.socket_addr()
                .with_context(|| format!("stub {name:?}"))?;
            ensure!(stub.timeout_ms > 0, "stub {name:?} timeout must be > 0");
        }

        Ok(())
    }

    /// Timeout configured for a named stub, if any.
    pub fn stub_timeout(&self, name: &str) -> Option<Duration> {
        self.stubs.get(name).map(RpcStubConfig::timeout)
    }
}

/// Canonicalizes a config path relative to the current working directory.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}
