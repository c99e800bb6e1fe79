use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::time::Duration;
use crackhash_core::{
    config::{BrokerArgs, BrokerConfig},
    keyspace::Keyspace,
    types::Alphabet,
};

/// Runtime configuration for the `crackhash-manager` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is honored), with defaults suitable for the reference
/// docker-compose deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "crackhash-manager",
    version,
    about = "Accepts MD5 crack requests and coordinates workers over a broker"
)]
pub struct CliArgs {
    /// Address the HTTP API listens on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Seconds a request may stay in progress before it is failed.
    ///
    /// Environment variable: `RESPONSE_TIMEOUT_SECS`
    #[arg(long, env = "RESPONSE_TIMEOUT_SECS", default_value_t = 180)]
    pub response_timeout_secs: u64,

    /// Maximum number of in-progress requests. New requests beyond this
    /// ceiling are refused.
    ///
    /// Environment variable: `MAX_QUEUE_SIZE`
    #[arg(long, env = "MAX_QUEUE_SIZE", default_value_t = 100)]
    pub max_queue_size: usize,

    /// Largest `maxLength` a client may ask for.
    ///
    /// Environment variable: `MAX_ALLOWED_LENGTH`
    #[arg(long, env = "MAX_ALLOWED_LENGTH", default_value_t = 8)]
    pub max_allowed_length: u32,

    /// Number of partitions, and therefore tasks, each request is split
    /// into.
    ///
    /// Environment variable: `PART_COUNT`
    #[arg(long, env = "PART_COUNT", default_value_t = 1)]
    pub part_count: u32,

    /// Seconds between attempts to republish requests whose dispatch failed.
    ///
    /// Environment variable: `RETRY_INTERVAL_SECS`
    #[arg(long, env = "RETRY_INTERVAL_SECS", default_value_t = 5)]
    pub retry_interval_secs: u64,

    /// Milliseconds between scans for requests past their deadline.
    ///
    /// Environment variable: `SWEEP_INTERVAL_MS`
    #[arg(long, env = "SWEEP_INTERVAL_MS", default_value_t = 1000)]
    pub sweep_interval_ms: u64,

    /// Request store backend.
    ///
    /// Environment variable: `STORE`
    #[arg(long, env = "STORE", value_enum, default_value_t = StoreKind::Memory)]
    pub store: StoreKind,

    /// MongoDB connection string, used with `STORE=mongo`.
    ///
    /// Environment variable: `MONGO_URI`
    #[arg(
        long,
        env = "MONGO_URI",
        default_value_t = String::from("mongodb://mongo1:27017,mongo2:27017,mongo3:27017/?replicaSet=rs0")
    )]
    pub mongo_uri: String,

    /// MongoDB database holding the `requests` collection.
    ///
    /// Environment variable: `MONGO_DB`
    #[arg(long, env = "MONGO_DB", default_value_t = String::from("crackhash"))]
    pub mongo_db: String,

    /// Upper bound in milliseconds on a single store operation.
    ///
    /// Environment variable: `STORE_OP_TIMEOUT_MS`
    #[arg(long, env = "STORE_OP_TIMEOUT_MS", default_value_t = 5000)]
    pub store_op_timeout_ms: u64,

    /// How tasks reach the workers: through the broker, or POSTed straight
    /// to `WORKER_URLS`.
    ///
    /// Environment variable: `DISPATCH`
    #[arg(long, env = "DISPATCH", value_enum, default_value_t = DispatchKind::Broker)]
    pub dispatch: DispatchKind,

    /// Comma-separated worker task endpoints, used with `DISPATCH=http`.
    /// Each request is split into one part per URL.
    ///
    /// Environment variable: `WORKER_URLS`
    #[arg(long, env = "WORKER_URLS", value_delimiter = ',')]
    pub worker_urls: Vec<String>,

    /// Seconds a worker may take to scan and report one part, used with
    /// `DISPATCH=http`.
    ///
    /// Environment variable: `WORKER_TIMEOUT_SECS`
    #[arg(long, env = "WORKER_TIMEOUT_SECS", default_value_t = 120)]
    pub worker_timeout_secs: u64,

    #[command(flatten)]
    pub broker: BrokerArgs,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Mongo,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Broker,
    Http,
}

/// Settings of the orchestration loops.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub response_timeout: Duration,
    pub max_queue_size: usize,
    pub max_allowed_length: u32,
    pub part_count: u32,
    pub retry_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(180),
            max_queue_size: 100,
            max_allowed_length: 8,
            part_count: 1,
            retry_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StoreConfig {
    Memory,
    Mongo {
        uri: String,
        database: String,
        op_timeout: Duration,
    },
}

#[derive(Debug, Clone)]
pub enum DispatchConfig {
    Broker(BrokerConfig),
    Http {
        worker_urls: Vec<String>,
        timeout: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub server_addr: String,
    pub service: ServiceConfig,
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
}

impl TryFrom<CliArgs> for ManagerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.response_timeout_secs == 0 {
            bail!("RESPONSE_TIMEOUT_SECS must be greater than 0");
        }
        if args.max_queue_size == 0 {
            bail!("MAX_QUEUE_SIZE must be greater than 0");
        }
        if args.max_allowed_length == 0 {
            bail!("MAX_ALLOWED_LENGTH must be greater than 0");
        }
        if Keyspace::new(&Alphabet::default(), args.max_allowed_length).is_err() {
            bail!(
                "MAX_ALLOWED_LENGTH ({}) yields a keyspace too large to address",
                args.max_allowed_length
            );
        }
        if args.part_count == 0 {
            bail!("PART_COUNT must be greater than 0");
        }
        if args.worker_timeout_secs == 0 {
            bail!("WORKER_TIMEOUT_SECS must be greater than 0");
        }
        if args.retry_interval_secs == 0 {
            bail!("RETRY_INTERVAL_SECS must be greater than 0");
        }
        if args.sweep_interval_ms == 0 {
            bail!("SWEEP_INTERVAL_MS must be greater than 0");
        }
        if args.store_op_timeout_ms == 0 {
            bail!("STORE_OP_TIMEOUT_MS must be greater than 0");
        }

        let store = match args.store {
            StoreKind::Memory => StoreConfig::Memory,
            StoreKind::Mongo => StoreConfig::Mongo {
                uri: args.mongo_uri,
                database: args.mongo_db,
                op_timeout: Duration::from_millis(args.store_op_timeout_ms),
            },
        };

        let mut part_count = args.part_count;
        let dispatch = match args.dispatch {
            DispatchKind::Broker => DispatchConfig::Broker(BrokerConfig::try_from(args.broker)?),
            DispatchKind::Http => {
                let worker_urls: Vec<String> = args
                    .worker_urls
                    .into_iter()
                    .map(|url| url.trim().to_owned())
                    .filter(|url| !url.is_empty())
                    .collect();
                if worker_urls.is_empty() {
                    bail!("WORKER_URLS must name at least one worker when DISPATCH=http");
                }
                // One part per worker.
                part_count = u32::try_from(worker_urls.len())?;
                DispatchConfig::Http {
                    worker_urls,
                    timeout: Duration::from_secs(args.worker_timeout_secs),
                }
            }
        };

        Ok(Self {
            server_addr: args.server_addr,
            service: ServiceConfig {
                response_timeout: Duration::from_secs(args.response_timeout_secs),
                max_queue_size: args.max_queue_size,
                max_allowed_length: args.max_allowed_length,
                part_count,
                retry_interval: Duration::from_secs(args.retry_interval_secs),
                sweep_interval: Duration::from_millis(args.sweep_interval_ms),
            },
            store,
            dispatch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ManagerConfig> {
        let args = CliArgs::try_parse_from(std::iter::once("crackhash-manager").chain(args.iter().copied()))?;
        ManagerConfig::try_from(args)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.server_addr, "0.0.0.0:8080");
        assert_eq!(config.service.response_timeout, Duration::from_secs(180));
        assert_eq!(config.service.max_queue_size, 100);
        assert_eq!(config.service.part_count, 1);
        assert!(matches!(config.store, StoreConfig::Memory));
        assert!(matches!(config.dispatch, DispatchConfig::Broker(_)));
    }

    #[test]
    fn http_dispatch_splits_one_part_per_worker() {
        let config = parse(&[
            "--dispatch",
            "http",
            "--part-count",
            "7",
            "--worker-urls",
            "http://w1:8081/task, http://w2:8081/task,",
        ])
        .unwrap();
        assert_eq!(config.service.part_count, 2);
        match config.dispatch {
            DispatchConfig::Http {
                worker_urls,
                timeout,
            } => {
                assert_eq!(worker_urls, ["http://w1:8081/task", "http://w2:8081/task"]);
                assert_eq!(timeout, Duration::from_secs(120));
            }
            DispatchConfig::Broker(_) => panic!("expected http dispatch"),
        }
    }

    #[test]
    fn http_dispatch_needs_workers() {
        assert!(parse(&["--dispatch", "http"]).is_err());
        assert!(parse(&["--dispatch", "http", "--worker-urls", " , "]).is_err());
    }

    #[test]
    fn mongo_store_carries_its_settings() {
        let config = parse(&["--store", "mongo", "--mongo-db", "test"]).unwrap();
        match config.store {
            StoreConfig::Mongo {
                database,
                op_timeout,
                ..
            } => {
                assert_eq!(database, "test");
                assert_eq!(op_timeout, Duration::from_secs(5));
            }
            StoreConfig::Memory => panic!("expected mongo store"),
        }
    }

    #[test]
    fn rejects_zero_limits() {
        assert!(parse(&["--max-queue-size", "0"]).is_err());
        assert!(parse(&["--part-count", "0"]).is_err());
        assert!(parse(&["--response-timeout-secs", "0"]).is_err());
        assert!(parse(&["--max-allowed-length", "0"]).is_err());
        assert!(parse(&["--max-allowed-length", "40"]).is_err());
    }
}
