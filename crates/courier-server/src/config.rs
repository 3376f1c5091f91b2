use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use courier_gateway::broker::InstanceId;

/// Which broker, if any, links this process to its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerMode {
    Amqp { url: String },
    /// Local delivery only. For single-process deployments.
    Disabled,
}

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP/WebSocket listener binds to.
    pub addr: SocketAddr,
    /// SQLite database file.
    pub db_path: PathBuf,
    pub broker: BrokerMode,
    /// Delay between reconnect attempts while the broker is unreachable.
    pub broker_retry: Duration,
    /// Names this process's broker queues.
    pub instance_id: InstanceId,
    /// Optional directory served for every path no other route claims.
    pub static_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let host = var("COURIER_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = var("COURIER_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("COURIER_PORT must be a port number")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {host}:{port}"))?;

        let broker = match var("COURIER_BROKER").as_deref().unwrap_or("amqp") {
            "amqp" => BrokerMode::Amqp {
                url: var("COURIER_AMQP_URL")
                    .or_else(|| var("RABBITMQ_URL"))
                    .unwrap_or_else(|| "amqp://localhost:5672".into()),
            },
            "none" => BrokerMode::Disabled,
            other => anyhow::bail!("COURIER_BROKER must be amqp or none, got {other}"),
        };

        let retry_secs: u64 = var("COURIER_BROKER_RETRY_SECS")
            .unwrap_or_else(|| "5".into())
            .parse()
            .context("COURIER_BROKER_RETRY_SECS must be a whole number of seconds")?;

        Ok(Self {
            addr,
            db_path: PathBuf::from(var("COURIER_DB_PATH").unwrap_or_else(|| "courier.db".into())),
            broker,
            broker_retry: Duration::from_secs(retry_secs.max(1)),
            instance_id: var("COURIER_INSTANCE_ID")
                .map(InstanceId::new)
                .unwrap_or_else(InstanceId::generate),
            static_dir: var("COURIER_STATIC_DIR").map(PathBuf::from),
        })
    }
}
