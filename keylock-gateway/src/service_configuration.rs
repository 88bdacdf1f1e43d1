use std::fs::read_to_string;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use keylock_raft::NodeConfig;
use serde::{Deserialize, Serialize};

use crate::object_store::DEFAULT_HASH_HEADER;

pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:5000";
pub const DEFAULT_UPSTREAM: &str = "http://127.0.0.1:8080";
/// `--upstream` value selecting the in-process object store.
pub const MEMORY_UPSTREAM: &str = "memory";

/// Command line flags. Every flag overrides the config file.
#[derive(Parser, Debug, Default)]
#[command(name = "keylock", about = "Lock-guarded conditional writes over a Raft lock table")]
pub struct Args {
    /// YAML config file, loaded before the flags are applied
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Address to bind on for raft
    #[arg(long)]
    pub bind: Option<String>,

    /// Comma separated raft addresses of the initial members (implies --bootstrap)
    #[arg(long, value_delimiter = ',')]
    pub seed: Vec<String>,

    /// Address the HTTP gateway listens on
    #[arg(long)]
    pub addr: Option<String>,

    /// Raft address advertised to peers, when different from --bind
    #[arg(long)]
    pub advertised_addr: Option<String>,

    /// Initialize the cluster
    #[arg(long)]
    pub bootstrap: bool,

    /// Directory to store raft data in
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Object store base URL, or "memory"
    #[arg(long)]
    pub upstream: Option<String>,

    /// Response header carrying the object hash
    #[arg(long)]
    pub hash_header: Option<String>,

    #[arg(long)]
    pub propose_timeout_ms: Option<u64>,

    /// Lease on every granted lock, after which another request may take it over (0 disables)
    #[arg(long)]
    pub lock_lease_ms: Option<u64>,

    /// Reject requests on followers instead of forwarding proposals to the leader
    #[arg(long)]
    pub no_forward: bool,
}

/// Config file contents. Every field is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfiguration {
    pub raft: RaftConfig,
    pub http_addr: Option<String>,
    pub upstream: Option<String>,
    pub hash_header: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub bind: Option<String>,
    pub advertised_addr: Option<String>,
    pub seeds: Vec<String>,
    pub bootstrap: bool,
    pub data_dir: Option<PathBuf>,
    pub propose_timeout_ms: Option<u64>,
    pub retry_interval_ms: Option<u64>,
    pub lock_lease_ms: Option<u64>,
    pub expiry_interval_ms: Option<u64>,
    pub forward_to_leader: Option<bool>,
    pub snapshot_logs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Memory,
    Http(String),
}

/// Resolved settings for one keylock process.
#[derive(Debug, Clone)]
pub struct ServiceConfiguration {
    pub node: NodeConfig,
    pub http_addr: SocketAddr,
    pub upstream: Upstream,
    pub hash_header: String,
}

impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        let mut node = NodeConfig::default();
        let raft = config.raft;
        if let Some(bind) = raft.bind {
            node.bind_addr = parse_addr(&bind)?;
        }
        node.advertised_addr = raft.advertised_addr;
        node.seed_peers = raft.seeds;
        node.bootstrap = raft.bootstrap;
        if let Some(dir) = raft.data_dir {
            node.data_dir = dir;
        }
        if let Some(ms) = raft.propose_timeout_ms {
            node.propose_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raft.retry_interval_ms {
            node.retry_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = raft.lock_lease_ms {
            node.lock_lease = lease(ms);
        }
        if let Some(ms) = raft.expiry_interval_ms {
            node.expiry_interval = Duration::from_millis(ms);
        }
        if let Some(forward) = raft.forward_to_leader {
            node.forward_to_leader = forward;
        }
        if let Some(logs) = raft.snapshot_logs {
            node.snapshot_logs = logs;
        }

        let http_addr = parse_addr(config.http_addr.as_deref().unwrap_or(DEFAULT_HTTP_ADDR))?;
        let upstream = parse_upstream(config.upstream.as_deref().unwrap_or(DEFAULT_UPSTREAM));

        Ok(ServiceConfiguration {
            node,
            http_addr,
            upstream,
            hash_header: config
                .hash_header
                .unwrap_or_else(|| DEFAULT_HASH_HEADER.to_string()),
        })
    }
}

impl ServiceConfiguration {
    /// Load the config file named by `args` (if any), then apply the flags.
    pub fn load(args: Args) -> Result<Self> {
        let load_config = match &args.config_file {
            Some(path) => read_config_file(path)?,
            None => LoadConfiguration::default(),
        };
        let mut service_config: ServiceConfiguration = load_config.try_into()?;
        service_config.apply_args(args)?;
        service_config.validate_seeds()?;
        Ok(service_config)
    }

    fn apply_args(&mut self, args: Args) -> Result<()> {
        if let Some(bind) = args.bind {
            self.node.bind_addr = parse_addr(&bind)?;
        }
        if let Some(advertised_addr) = args.advertised_addr {
            self.node.advertised_addr = Some(advertised_addr);
        }
        let seeds: Vec<String> = args.seed.into_iter().filter(|s| !s.is_empty()).collect();
        if !seeds.is_empty() {
            self.node.seed_peers = seeds;
        }
        if args.bootstrap {
            self.node.bootstrap = true;
        }
        if let Some(dir) = args.dir {
            self.node.data_dir = dir;
        }
        if let Some(ms) = args.propose_timeout_ms {
            self.node.propose_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = args.lock_lease_ms {
            self.node.lock_lease = lease(ms);
        }
        if args.no_forward {
            self.node.forward_to_leader = false;
        }
        if let Some(addr) = args.addr {
            self.http_addr = parse_addr(&addr)?;
        }
        if let Some(upstream) = args.upstream {
            self.upstream = parse_upstream(&upstream);
        }
        if let Some(hash_header) = args.hash_header {
            self.hash_header = hash_header;
        }
        Ok(())
    }

    /// Every seed must resolve. A non-empty seed list implies bootstrap.
    fn validate_seeds(&mut self) -> Result<()> {
        for seed in &self.node.seed_peers {
            seed.to_socket_addrs()
                .with_context(|| format!("probably have a bad seed in the list: {seed}"))?;
        }
        if !self.node.seed_peers.is_empty() {
            self.node.bootstrap = true;
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<LoadConfiguration> {
    let config_content = read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&config_content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("Failed to parse into Socket address: {addr}"))
}

fn lease(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn parse_upstream(upstream: &str) -> Upstream {
    if upstream.eq_ignore_ascii_case(MEMORY_UPSTREAM) {
        Upstream::Memory
    } else {
        Upstream::Http(upstream.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn args(flags: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("keylock").chain(flags.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_without_config_file() {
        let config = ServiceConfiguration::load(args(&[])).unwrap();
        assert_eq!(config.node.bind_addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.http_addr, DEFAULT_HTTP_ADDR.parse().unwrap());
        assert_eq!(config.upstream, Upstream::Http(DEFAULT_UPSTREAM.to_string()));
        assert_eq!(config.hash_header, DEFAULT_HASH_HEADER);
        assert!(!config.node.bootstrap);
        assert!(config.node.forward_to_leader);
        assert_eq!(config.node.lock_lease, Some(keylock_raft::node::DEFAULT_LOCK_LEASE));
    }

    #[test]
    fn seeds_imply_bootstrap() {
        let config =
            ServiceConfiguration::load(args(&["--seed", "127.0.0.1:4001,127.0.0.1:4002"])).unwrap();
        assert_eq!(config.node.seed_peers, ["127.0.0.1:4001", "127.0.0.1:4002"]);
        assert!(config.node.bootstrap);
    }

    #[test]
    fn bad_seed_is_a_startup_error() {
        let err = ServiceConfiguration::load(args(&["--seed", "not-an-address"])).unwrap_err();
        assert!(err.to_string().contains("bad seed"));
    }

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "raft:\n  bind: 127.0.0.1:4100\n  data_dir: /var/lib/keylock\n  \
             propose_timeout_ms: 2500\n  lock_lease_ms: 5000\n\
             http_addr: 127.0.0.1:5100\nupstream: memory\n"
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let config = ServiceConfiguration::load(args(&["--config-file", path])).unwrap();
        assert_eq!(config.node.bind_addr, "127.0.0.1:4100".parse().unwrap());
        assert_eq!(config.node.data_dir, PathBuf::from("/var/lib/keylock"));
        assert_eq!(config.node.propose_timeout, Duration::from_millis(2500));
        assert_eq!(config.node.lock_lease, Some(Duration::from_millis(5000)));
        assert_eq!(config.upstream, Upstream::Memory);

        let config = ServiceConfiguration::load(args(&[
            "--config-file",
            path,
            "--bind",
            "127.0.0.1:4200",
            "--addr",
            "127.0.0.1:5200",
            "--no-forward",
            "--lock-lease-ms",
            "0",
        ]))
        .unwrap();
        assert_eq!(config.node.bind_addr, "127.0.0.1:4200".parse().unwrap());
        assert_eq!(config.http_addr, "127.0.0.1:5200".parse().unwrap());
        assert!(!config.node.forward_to_leader);
        assert_eq!(config.node.lock_lease, None);
        assert_eq!(config.node.data_dir, PathBuf::from("/var/lib/keylock"));
    }
}
