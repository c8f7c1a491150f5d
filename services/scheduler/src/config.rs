//! Scheduler configuration.
//!
//! Flags are parsed once at startup (with `SEEDKEEPER_*` environment
//! fallbacks) and turned into an immutable [`SchedulerConfig`] that is
//! handed to every component.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use thiserror::Error;

use seedkeeper_id::FrameworkId;

use crate::driver::FrameworkInfo;
use crate::offers::MemberRequirements;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "no value provided for --persist-uri; running without a persisted session orphans \
         every member when this process exits (override with --test-mode)"
    )]
    MissingPersistence,

    #[error(
        "--single-instance-per-host=false may place several members on one host, amplifying \
         the cost of losing that host (override with --test-mode)"
    )]
    UnsafePlacement,

    #[error("--cluster-size must be at least 1")]
    InvalidClusterSize,

    #[error("invalid persistence URI '{0}': expected sqlite://<path> or memory://")]
    InvalidPersistUri(String),

    #[error("memory:// persistence is only allowed with --test-mode")]
    VolatilePersistence,
}

/// Command-line surface.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "seedkeeper-scheduler",
    version,
    about = "Runs and repairs a key-value store cluster on an offer-based cluster manager"
)]
pub struct Cli {
    /// Unique name of the managed cluster.
    #[arg(long, env = "SEEDKEEPER_CLUSTER_NAME", default_value = "default")]
    pub cluster_name: String,

    /// Cluster manager address <ip:port>.
    #[arg(long, env = "SEEDKEEPER_MASTER", default_value = "127.0.0.1:5050")]
    pub master: String,

    /// Coordination store for the session identity (sqlite://<path> or memory://).
    #[arg(long, env = "SEEDKEEPER_PERSIST_URI", default_value = "")]
    pub persist_uri: String,

    /// Root path under which the cluster's records are stored.
    #[arg(long, env = "SEEDKEEPER_PERSIST_CHROOT", default_value = "/seedkeeper")]
    pub persist_chroot: String,

    /// Number of members to run.
    #[arg(long, env = "SEEDKEEPER_CLUSTER_SIZE", default_value_t = 5)]
    pub cluster_size: usize,

    /// Binding port for the admin interface.
    #[arg(long, env = "SEEDKEEPER_ADMIN_PORT", default_value_t = 23400)]
    pub admin_port: u16,

    /// Seconds without quorum before the cluster counts as livelocked.
    #[arg(long, env = "SEEDKEEPER_RESEED_TIMEOUT", default_value_t = 240)]
    pub reseed_timeout: u64,

    /// Reseed automatically once the cluster is livelocked.
    #[arg(long, env = "SEEDKEEPER_AUTO_RESEED", default_value_t = true, action = ArgAction::Set)]
    pub auto_reseed: bool,

    /// Binding port for the artifact server.
    #[arg(long, env = "SEEDKEEPER_ARTIFACT_PORT", default_value_t = 12300)]
    pub artifact_port: u16,

    /// Path to the executor binary served to hosts.
    #[arg(long, env = "SEEDKEEPER_EXECUTOR_BIN", default_value = "./bin/seedkeeper-executor")]
    pub executor_bin: PathBuf,

    /// Path to the key-value store binary served to hosts.
    #[arg(long, env = "SEEDKEEPER_STORE_BIN", default_value = "./bin/etcd")]
    pub store_bin: PathBuf,

    /// Binding address for the admin and artifact servers (defaults to the hostname).
    #[arg(long, env = "SEEDKEEPER_ADDRESS")]
    pub address: Option<String>,

    /// Only allow one member per host.
    #[arg(long, env = "SEEDKEEPER_SINGLE_INSTANCE_PER_HOST", default_value_t = true, action = ArgAction::Set)]
    pub single_instance_per_host: bool,

    /// Disable the safety checks on --persist-uri and --single-instance-per-host.
    #[arg(long, env = "SEEDKEEPER_TEST_MODE", default_value_t = false)]
    pub test_mode: bool,

    /// Framework failover timeout in seconds.
    #[arg(long, env = "SEEDKEEPER_FAILOVER_TIMEOUT", default_value_t = 60 * 60 * 24 * 7)]
    pub failover_timeout: u64,

    /// Seconds to pause after each launch so the cluster can converge.
    #[arg(long, env = "SEEDKEEPER_CONVERGENCE_DELAY", default_value_t = 10)]
    pub convergence_delay: u64,

    /// A member counts as healthy if it reported healthy within this many seconds.
    #[arg(long, env = "SEEDKEEPER_HEALTH_WINDOW", default_value_t = 60)]
    pub health_window: u64,

    /// Seconds between member health probes and livelock evaluations.
    #[arg(long, env = "SEEDKEEPER_HEALTH_CHECK_INTERVAL", default_value_t = 10)]
    pub health_check_interval: u64,

    /// Seconds between launch gap checks.
    #[arg(long, env = "SEEDKEEPER_LAUNCH_REQUEST_INTERVAL", default_value_t = 10)]
    pub launch_request_interval: u64,

    /// Seconds an unhealthy member is kept before it is removed.
    #[arg(long, env = "SEEDKEEPER_UNHEALTHY_GRACE", default_value_t = 30)]
    pub unhealthy_grace: u64,

    /// Seconds a launched member may go without any status update.
    #[arg(long, env = "SEEDKEEPER_LAUNCH_TIMEOUT", default_value_t = 300)]
    pub launch_timeout: u64,

    /// CPUs required per member.
    #[arg(long, env = "SEEDKEEPER_MEMBER_CPUS", default_value_t = 1.0)]
    pub member_cpus: f64,

    /// Memory (MB) required per member.
    #[arg(long, env = "SEEDKEEPER_MEMBER_MEM_MB", default_value_t = 256.0)]
    pub member_mem_mb: f64,

    /// Disk (MB) required per member.
    #[arg(long, env = "SEEDKEEPER_MEMBER_DISK_MB", default_value_t = 1024.0)]
    pub member_disk_mb: f64,

    /// How member health is checked.
    #[arg(long, env = "SEEDKEEPER_HEALTH_PROBE", value_enum, default_value_t = ProbeKind::Manager)]
    pub health_probe: ProbeKind,

    /// Seconds an HTTP health probe may take before the member counts as unhealthy.
    #[arg(long, env = "SEEDKEEPER_HEALTH_PROBE_TIMEOUT", default_value_t = 5)]
    pub health_probe_timeout: u64,

    /// Run against a simulated cluster manager with this many hosts.
    #[arg(long, env = "SEEDKEEPER_SIMULATE_HOSTS", default_value_t = 0)]
    pub simulate_hosts: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "SEEDKEEPER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Health probe implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProbeKind {
    /// Ask the cluster manager connection whether the task is alive.
    Manager,
    /// `GET /health` on each member's client port.
    Http,
}

/// Where the session identity and membership checkpoint live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistUri {
    Sqlite(PathBuf),
    Memory,
}

impl PersistUri {
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        if uri == "memory://" {
            return Ok(Self::Memory);
        }
        match uri.strip_prefix("sqlite://") {
            Some(path) if !path.is_empty() => Ok(Self::Sqlite(PathBuf::from(path))),
            _ => Err(ConfigError::InvalidPersistUri(uri.to_string())),
        }
    }
}

/// Artifact server settings.
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    pub address: String,
    pub port: u16,
    pub executor_bin: PathBuf,
    pub store_bin: PathBuf,
}

/// Immutable scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cluster_name: String,
    pub master: String,
    pub persist: PersistUri,
    pub persist_chroot: String,
    pub desired_members: usize,
    pub single_instance_per_host: bool,
    pub auto_reseed: bool,
    pub reseed_timeout: Duration,
    pub failover_timeout: Duration,
    pub convergence_delay: Duration,
    pub health_window: Duration,
    pub health_check_interval: Duration,
    pub launch_request_interval: Duration,
    pub unhealthy_grace: Duration,
    pub launch_timeout: Duration,
    pub member_requirements: MemberRequirements,
    pub health_probe: ProbeKind,
    pub health_probe_timeout: Duration,
    pub admin_port: u16,
    pub artifacts: ArtifactConfig,
    pub simulate_hosts: usize,
    pub log_level: String,
    pub test_mode: bool,
}

impl SchedulerConfig {
    /// Validate the parsed flags and build the configuration.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.cluster_size == 0 {
            return Err(ConfigError::InvalidClusterSize);
        }

        let persist = match (cli.persist_uri.as_str(), cli.test_mode) {
            ("", false) => return Err(ConfigError::MissingPersistence),
            ("", true) => PersistUri::Memory,
            (uri, test_mode) => {
                let parsed = PersistUri::parse(uri)?;
                if parsed == PersistUri::Memory && !test_mode {
                    return Err(ConfigError::VolatilePersistence);
                }
                parsed
            }
        };

        if !cli.single_instance_per_host && !cli.test_mode {
            return Err(ConfigError::UnsafePlacement);
        }

        let address = cli.address.unwrap_or_else(|| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "127.0.0.1".to_string())
        });

        Ok(Self {
            cluster_name: cli.cluster_name,
            master: cli.master,
            persist,
            persist_chroot: cli.persist_chroot,
            desired_members: cli.cluster_size,
            single_instance_per_host: cli.single_instance_per_host,
            auto_reseed: cli.auto_reseed,
            reseed_timeout: Duration::from_secs(cli.reseed_timeout),
            failover_timeout: Duration::from_secs(cli.failover_timeout),
            convergence_delay: Duration::from_secs(cli.convergence_delay),
            health_window: Duration::from_secs(cli.health_window),
            health_check_interval: Duration::from_secs(cli.health_check_interval.max(1)),
            launch_request_interval: Duration::from_secs(cli.launch_request_interval.max(1)),
            unhealthy_grace: Duration::from_secs(cli.unhealthy_grace),
            launch_timeout: Duration::from_secs(cli.launch_timeout),
            member_requirements: MemberRequirements {
                cpus: cli.member_cpus,
                mem_mb: cli.member_mem_mb,
                disk_mb: cli.member_disk_mb,
                ..MemberRequirements::default()
            },
            health_probe: cli.health_probe,
            health_probe_timeout: Duration::from_secs(cli.health_probe_timeout.max(1)),
            admin_port: cli.admin_port,
            artifacts: ArtifactConfig {
                address,
                port: cli.artifact_port,
                executor_bin: cli.executor_bin,
                store_bin: cli.store_bin,
            },
            simulate_hosts: cli.simulate_hosts,
            log_level: cli.log_level,
            test_mode: cli.test_mode,
        })
    }

    /// In-memory configuration for local runs and tests.
    pub fn local(cluster_name: &str, desired_members: usize) -> Self {
        let cli = Cli::parse_from([
            "seedkeeper-scheduler",
            "--test-mode",
            "--cluster-name",
            cluster_name,
            "--cluster-size",
            &desired_members.max(1).to_string(),
            "--address",
            "127.0.0.1",
        ]);
        let mut config = match Self::from_cli(cli) {
            Ok(config) => config,
            Err(e) => unreachable!("local configuration is always valid: {e}"),
        };
        config.desired_members = desired_members;
        config
    }

    /// Name the cluster manager knows this scheduler by.
    pub fn framework_name(&self) -> String {
        format!("seedkeeper-{}", self.cluster_name)
    }

    /// Registration for this scheduler, failing over to `previous` if set.
    pub fn framework_info(&self, previous: Option<FrameworkId>) -> FrameworkInfo {
        FrameworkInfo {
            name: self.framework_name(),
            id: previous,
            failover_timeout: self.failover_timeout,
        }
    }
}
