use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use crackhash_core::config::{BrokerArgs, BrokerConfig};

/// Runtime configuration for the `crackhash-worker` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is honored).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "crackhash-worker",
    version,
    about = "Scans MD5 keyspace partitions handed out by the manager"
)]
pub struct CliArgs {
    /// Address the HTTP API listens on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8081"))]
    pub server_addr: String,

    /// Manager endpoint that direct-path responses are PATCHed to.
    ///
    /// Environment variable: `MANAGER_URL`
    #[arg(
        long,
        env = "MANAGER_URL",
        default_value_t = String::from("http://manager:8080/internal/api/manager/hash/crack/request")
    )]
    pub manager_url: String,

    /// Number of compute threads scanning a partition. `0` uses one per
    /// CPU.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 0)]
    pub num_workers: usize,

    /// Seconds to wait for the manager to accept a direct-path response.
    ///
    /// Environment variable: `REPORT_TIMEOUT_SECS`
    #[arg(long, env = "REPORT_TIMEOUT_SECS", default_value_t = 10)]
    pub report_timeout_secs: u64,

    /// Serve the HTTP path only, without consuming tasks from the broker.
    ///
    /// Environment variable: `DISABLE_QUEUE`
    #[arg(long, env = "DISABLE_QUEUE", default_value_t = false)]
    pub disable_queue: bool,

    #[command(flatten)]
    pub broker: BrokerArgs,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub server_addr: String,
    pub manager_url: String,
    pub num_workers: usize,
    pub report_timeout: Duration,
    pub disable_queue: bool,
    pub broker: BrokerConfig,
}

impl TryFrom<CliArgs> for WorkerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.report_timeout_secs == 0 {
            bail!("REPORT_TIMEOUT_SECS must be greater than 0");
        }
        if args.manager_url.trim().is_empty() {
            bail!("MANAGER_URL must not be empty");
        }

        let num_workers = if args.num_workers == 0 {
            num_cpus::get()
        } else {
            args.num_workers
        };

        Ok(Self {
            server_addr: args.server_addr,
            manager_url: args.manager_url,
            num_workers,
            report_timeout: Duration::from_secs(args.report_timeout_secs),
            disable_queue: args.disable_queue,
            broker: BrokerConfig::try_from(args.broker)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<WorkerConfig> {
        let args =
            CliArgs::try_parse_from(std::iter::once("crackhash-worker").chain(args.iter().copied()))?;
        WorkerConfig::try_from(args)
    }

    #[test]
    fn defaults_resolve_worker_count() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.server_addr, "0.0.0.0:8081");
        assert!(config.num_workers >= 1);
        assert!(!config.disable_queue);
        assert_eq!(config.broker.topology.tasks.queue, "task_queue");
    }

    #[test]
    fn explicit_values_are_kept() {
        let config = parse(&["--num-workers", "3", "--disable-queue"]).unwrap();
        assert_eq!(config.num_workers, 3);
        assert!(config.disable_queue);
    }

    #[test]
    fn rejects_zero_timeout() {
        assert!(parse(&["--report-timeout-secs", "0"]).is_err());
    }
}
