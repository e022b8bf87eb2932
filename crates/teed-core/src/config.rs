//! Worker configuration, read from the environment.
//!
//! Every value has a default, so an empty environment yields a worker that
//! talks to a local RabbitMQ as guest/guest. `BROKER_*` variables win over the
//! older `RABBITMQ_*` names.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::app::reconnect::ReconnectPolicy;
use crate::domain::Operation;
use crate::ports::AckMode;

pub const DEFAULT_QUEUE_NAME: &str = "teed-worker";
pub const DEFAULT_PARTIAL_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{var}: invalid value '{value}': {reason}")]
pub struct ConfigError {
    pub var: String,
    pub value: String,
    pub reason: String,
}

/// Where the broker lives and which queue to bind.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    pub queue_name: String,
}

impl BrokerConfig {
    /// `amqp://host:port/vhost`, without credentials.
    pub fn endpoint(&self) -> String {
        format!("amqp://{}:{}{}", self.host, self.port, self.virtual_host)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("queue_name", &self.queue_name)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,

    /// Written to `processed_by`; `<name>:<pid>`.
    pub worker_name: String,

    pub ack_mode: AckMode,

    pub prefetch: u16,

    /// Per-task limit. `None` lets operations run as long as they need.
    pub task_timeout: Option<Duration>,

    pub reconnect: ReconnectPolicy,

    /// External command bound to each operation (program + leading args).
    pub operation_commands: BTreeMap<Operation, Vec<String>>,

    /// Exit code an operation command uses to report a partial failure.
    pub partial_exit_code: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            worker_name: format!("teed-worker:{}", std::process::id()),
            ack_mode: AckMode::Manual,
            prefetch: 1,
            task_timeout: None,
            reconnect: ReconnectPolicy::default(),
            operation_commands: BTreeMap::new(),
            partial_exit_code: DEFAULT_PARTIAL_EXIT_CODE,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key -> value lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = WorkerConfig::default();
        let broker_defaults = defaults.broker;

        let broker = BrokerConfig {
            host: env
                .first(&["BROKER_HOST", "RABBITMQ_HOST"])
                .map(|(_, v)| v)
                .unwrap_or(broker_defaults.host),
            port: env
                .parsed::<u16>(&["BROKER_PORT", "RABBITMQ_PORT"])?
                .unwrap_or(broker_defaults.port),
            virtual_host: broker_defaults.virtual_host,
            username: env
                .first(&["BROKER_USERNAME", "RABBITMQ_USERNAME"])
                .map(|(_, v)| v)
                .unwrap_or(broker_defaults.username),
            password: env
                .first(&["BROKER_PASSWORD", "RABBITMQ_PASSWORD"])
                .map(|(_, v)| v)
                .unwrap_or(broker_defaults.password),
            queue_name: env
                .first(&["QUEUE_NAME"])
                .map(|(_, v)| v)
                .unwrap_or(broker_defaults.queue_name),
        };

        let worker_name = env
            .first(&["WORKER_NAME", "HOSTNAME"])
            .map(|(_, name)| format!("{name}:{}", std::process::id()))
            .unwrap_or(defaults.worker_name);

        let ack_mode = match env.first(&["ACK_MODE"]) {
            Some((var, raw)) => raw
                .parse::<AckMode>()
                .map_err(|reason| invalid(var, &raw, reason))?,
            None => defaults.ack_mode,
        };

        let prefetch = env.parsed::<u16>(&["PREFETCH"])?.unwrap_or(defaults.prefetch);
        if prefetch == 0 {
            return Err(invalid("PREFETCH", "0", "must be at least 1"));
        }

        let task_timeout = env
            .parsed::<u64>(&["TASK_TIMEOUT_SECS"])?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let mut reconnect = defaults.reconnect;
        if let Some(max) = env.parsed::<u32>(&["RECONNECT_MAX_ATTEMPTS"])? {
            reconnect.max_attempts = max;
        }
        if let Some(ms) = env.parsed::<u64>(&["RECONNECT_BASE_DELAY_MS"])? {
            reconnect.base_delay = Duration::from_millis(ms);
        }

        let mut operation_commands = BTreeMap::new();
        for op in Operation::ALL {
            let var = command_var(op);
            if let Some((_, raw)) = env.first(&[var.as_str()]) {
                let argv: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
                if argv.is_empty() {
                    return Err(invalid(&var, &raw, "command is empty"));
                }
                operation_commands.insert(op, argv);
            }
        }

        let partial_exit_code = env
            .parsed::<i32>(&["OPERATION_PARTIAL_EXIT_CODE"])?
            .unwrap_or(defaults.partial_exit_code);

        Ok(Self {
            broker,
            worker_name,
            ack_mode,
            prefetch,
            task_timeout,
            reconnect,
            operation_commands,
            partial_exit_code,
        })
    }
}

/// `OPERATION_BULKCM_SPLIT_COMMAND` and friends.
pub fn command_var(op: Operation) -> String {
    format!("OPERATION_{}_COMMAND", op.as_str().to_ascii_uppercase())
}

fn invalid(var: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError {
        var: var.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// First non-empty variable among `vars`, with its name.
    fn first<'a>(&self, vars: &[&'a str]) -> Option<(&'a str, String)> {
        vars.iter().find_map(|var| {
            (self.lookup)(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (*var, v))
        })
    }

    fn parsed<T>(&self, vars: &[&str]) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        match self.first(vars) {
            None => Ok(None),
            Some((var, raw)) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| invalid(var, &raw, e.to_string())),
        }
    }
}
