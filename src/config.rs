//! Startup configuration.
//!
//! Every setting can be given as a flag or through its
//! `K8S_AWAIT_ELECTION_*` environment variable. Everything after the first
//! positional argument is the governed command.

use std::time::Duration;

use clap::Parser;

use crate::election::ElectionConfig;
use crate::error::ConfigError;
use crate::record::LockId;
use crate::registrar::{EndpointPort, ServiceEndpoint};
use crate::supervisor::CommandWorkload;

pub const ENABLED_KEY: &str = "K8S_AWAIT_ELECTION_ENABLED";
pub const NAME_KEY: &str = "K8S_AWAIT_ELECTION_NAME";
pub const LOCK_NAME_KEY: &str = "K8S_AWAIT_ELECTION_LOCK_NAME";
pub const LOCK_NAMESPACE_KEY: &str = "K8S_AWAIT_ELECTION_LOCK_NAMESPACE";
pub const IDENTITY_KEY: &str = "K8S_AWAIT_ELECTION_IDENTITY";
pub const STATUS_ENDPOINT_KEY: &str = "K8S_AWAIT_ELECTION_STATUS_ENDPOINT";
pub const POD_IP_KEY: &str = "K8S_AWAIT_ELECTION_POD_IP";
pub const NODE_NAME_KEY: &str = "K8S_AWAIT_ELECTION_NODE_NAME";
pub const SERVICE_NAME_KEY: &str = "K8S_AWAIT_ELECTION_SERVICE_NAME";
pub const SERVICE_NAMESPACE_KEY: &str = "K8S_AWAIT_ELECTION_SERVICE_NAMESPACE";
pub const SERVICE_PORTS_JSON_KEY: &str = "K8S_AWAIT_ELECTION_SERVICE_PORTS_JSON";
pub const LEASE_DURATION_KEY: &str = "K8S_AWAIT_ELECTION_LEASE_DURATION";
pub const RENEW_DEADLINE_KEY: &str = "K8S_AWAIT_ELECTION_RENEW_DEADLINE";
pub const RETRY_PERIOD_KEY: &str = "K8S_AWAIT_ELECTION_RETRY_PERIOD";
pub const TERMINATION_GRACE_KEY: &str = "K8S_AWAIT_ELECTION_TERMINATION_GRACE";
pub const RELEASE_ON_CANCEL_KEY: &str = "K8S_AWAIT_ELECTION_RELEASE_ON_CANCEL";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run a command on exactly one replica, elected through a shared lease")]
pub struct Settings {
    /// Any non-empty value turns election on; otherwise the command just runs
    #[arg(
        long,
        env = ENABLED_KEY,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub enabled: Option<String>,

    /// Election name, used in logs
    #[arg(long, env = NAME_KEY)]
    pub name: Option<String>,

    /// Name of the lease object
    #[arg(long, env = LOCK_NAME_KEY)]
    pub lock_name: Option<String>,

    /// Namespace of the lease object
    #[arg(long, env = LOCK_NAMESPACE_KEY)]
    pub lock_namespace: Option<String>,

    /// Identity of this candidate, unique among replicas
    #[arg(long, env = IDENTITY_KEY)]
    pub identity: Option<String>,

    /// Listen address of the status endpoint (e.g. ":9999")
    #[arg(long, env = STATUS_ENDPOINT_KEY)]
    pub status_endpoint: Option<String>,

    /// Address published as the service endpoint while leading
    #[arg(long, env = POD_IP_KEY)]
    pub pod_ip: Option<String>,

    /// Node name attached to the published address
    #[arg(long, env = NODE_NAME_KEY)]
    pub node_name: Option<String>,

    /// Service whose endpoint is pointed at the leader
    #[arg(long, env = SERVICE_NAME_KEY)]
    pub service_name: Option<String>,

    /// Namespace of the service (defaults to the lock namespace)
    #[arg(long, env = SERVICE_NAMESPACE_KEY)]
    pub service_namespace: Option<String>,

    /// JSON list of endpoint ports, e.g. '[{"name":"http","port":8080}]'
    #[arg(long, env = SERVICE_PORTS_JSON_KEY)]
    pub service_ports_json: Option<String>,

    /// Seconds a lease stays valid without renewal
    #[arg(long, env = LEASE_DURATION_KEY, default_value_t = 15)]
    pub lease_duration: u64,

    /// Seconds a leader keeps retrying renewal before stepping down
    #[arg(long, env = RENEW_DEADLINE_KEY, default_value_t = 10)]
    pub renew_deadline: u64,

    /// Seconds between election attempts
    #[arg(long, env = RETRY_PERIOD_KEY, default_value_t = 2)]
    pub retry_period: u64,

    /// Seconds between SIGTERM and SIGKILL when the command is stopped
    #[arg(long, env = TERMINATION_GRACE_KEY, default_value_t = 0)]
    pub termination_grace: u64,

    /// Clear the lease holder on shutdown
    #[arg(
        long,
        env = RELEASE_ON_CANCEL_KEY,
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub release_on_cancel: bool,

    /// Command to run while leading, with its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Everything the election path needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectedConfig {
    pub name: String,
    pub lock: LockId,
    pub identity: String,
    pub timing: ElectionConfig,
    pub status_endpoint: Option<String>,
    pub service: Option<ServiceEndpoint>,
}

/// Validated configuration of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub workload: CommandWorkload,
    /// `None` runs the command without any election.
    pub election: Option<ElectedConfig>,
}

impl TryFrom<Settings> for RunConfig {
    type Error = ConfigError;

    fn try_from(settings: Settings) -> Result<Self, ConfigError> {
        let workload = CommandWorkload::from_argv(&settings.command)
            .ok_or(ConfigError::MissingCommand)?
            .termination_grace(Duration::from_secs(settings.termination_grace));

        let enabled = settings.enabled.as_deref().is_some_and(|v| !v.is_empty());
        let election = if enabled {
            Some(elected_config(&settings)?)
        } else {
            None
        };
        Ok(Self { workload, election })
    }
}

fn elected_config(settings: &Settings) -> Result<ElectedConfig, ConfigError> {
    let name = required(&settings.name, NAME_KEY)?;
    let lock_name = required(&settings.lock_name, LOCK_NAME_KEY)?;
    let lock_namespace = required(&settings.lock_namespace, LOCK_NAMESPACE_KEY)?;
    let identity = required(&settings.identity, IDENTITY_KEY)?;

    let timing = ElectionConfig {
        lease_duration: Duration::from_secs(settings.lease_duration),
        renew_deadline: Duration::from_secs(settings.renew_deadline),
        retry_period: Duration::from_secs(settings.retry_period),
        release_on_cancel: settings.release_on_cancel,
    };
    timing.validate()?;

    let service = match optional(&settings.service_name) {
        None => None,
        Some(service_name) => {
            let address = optional(&settings.pod_ip).ok_or(ConfigError::MissingEnv(POD_IP_KEY))?;
            let ports = EndpointPort::parse_list(settings.service_ports_json.as_deref().unwrap_or(""))
                .map_err(|e| ConfigError::Invalid {
                    key: SERVICE_PORTS_JSON_KEY,
                    reason: format!("failed to parse ports: {e}"),
                })?;
            Some(ServiceEndpoint {
                name: service_name,
                namespace: optional(&settings.service_namespace).unwrap_or_else(|| lock_namespace.clone()),
                address,
                node_name: settings.node_name.clone(),
                ports,
            })
        }
    };

    Ok(ElectedConfig {
        name,
        lock: LockId::new(lock_namespace, lock_name),
        identity,
        timing,
        status_endpoint: optional(&settings.status_endpoint),
        service,
    })
}

fn optional(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

fn required(value: &Option<String>, key: &'static str) -> Result<String, ConfigError> {
    optional(value).ok_or(ConfigError::MissingEnv(key))
}
