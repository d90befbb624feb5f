//! launchpad: the Launchpad runner daemon.
//!
//! Single binary that assembles the runner subsystems:
//! - Autoscale store (redb)
//! - Istio driver
//! - Access ingestion, autoscaler and compaction loops
//! - Front door API
//! - Cold-start proxy
//!
//! # Usage
//!
//! ```text
//! launchpad runner --config /etc/launchpad/runner.toml --port 4050 --proxy-port 4055
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use launchpad_core::RunnerConfig;

#[derive(Parser)]
#[command(name = "launchpad", about = "Launchpad runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the runner: front door, cold-start proxy and autoscaler.
    Runner(RunnerArgs),
}

/// Flags override the config file; unset flags keep the file's values.
#[derive(clap::Args)]
struct RunnerArgs {
    /// TOML config file.
    #[arg(long, env = "LAUNCHPAD_CONFIG")]
    config: Option<PathBuf>,

    /// Front door port.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Cold-start proxy port.
    #[arg(long, env = "PROXY_PORT")]
    proxy_port: Option<u16>,

    /// debug | info | error
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// HS256 secret for operator tokens.
    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: Option<String>,

    /// HS256 secret for metric reporter tokens.
    #[arg(long, env = "JWT_PROXY_SECRET")]
    jwt_proxy_secret: Option<String>,

    #[arg(long, env = "DRIVER")]
    driver: Option<String>,

    /// Kubeconfig used with --outside-cluster.
    #[arg(long, env = "DRIVER_CONFIG")]
    driver_config: Option<PathBuf>,

    #[arg(long, env = "OUTSIDE_CLUSTER")]
    outside_cluster: bool,

    /// Directory of the autoscale store.
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,
}

impl RunnerArgs {
    fn into_config(self) -> anyhow::Result<RunnerConfig> {
        let mut config = match &self.config {
            Some(path) => RunnerConfig::from_file(path)?,
            None => RunnerConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(port) = self.proxy_port {
            config.proxy_port = port;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(secret) = self.jwt_secret {
            config.auth.secret = secret;
        }
        if let Some(secret) = self.jwt_proxy_secret {
            config.auth.proxy_secret = secret;
        }
        if let Some(driver) = self.driver {
            config.driver.driver_type = driver;
        }
        if let Some(path) = self.driver_config {
            config.driver.config_file_path = Some(path);
        }
        if self.outside_cluster {
            config.driver.in_cluster = false;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        config.link_proxy_port();
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Runner(args) => {
            let config = args.into_config()?;

            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .or_else(|_| EnvFilter::try_new(&config.log_level))?,
                )
                .init();

            launchpad::run(config).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RunnerArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::Runner(args) => args,
        }
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "launchpad",
            "runner",
            "--port",
            "9000",
            "--proxy-port",
            "9005",
            "--outside-cluster",
            "--driver-config",
            "/home/ops/.kube/config",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.proxy_port, 9005);
        assert_eq!(config.driver.proxy_port, 9005);
        assert!(!config.driver.in_cluster);
        assert_eq!(
            config.driver.config_file_path,
            Some(PathBuf::from("/home/ops/.kube/config"))
        );
        assert_eq!(config.auth, RunnerConfig::default().auth);
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.toml");
        std::fs::write(
            &path,
            "port = 7000\nproxy_port = 7005\n\n[auth]\nsecret = \"from-file\"\n",
        )
        .unwrap();

        let config = parse(&[
            "launchpad",
            "runner",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "8000",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.port, 8000);
        assert_eq!(config.proxy_port, 7005);
        assert_eq!(config.driver.proxy_port, 7005);
        assert_eq!(config.auth.secret, "from-file");
    }
}
