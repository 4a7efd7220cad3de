use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use redeploy_controller::ConfigChangeController;
use redeploy_core::JsonAnnotationCodec;
use redeploy_kubehub::KubeChangeStrategy;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod check;

#[derive(Parser, Debug)]
#[command(name = "redeployctl", version, about = "Redeploy config change controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns", global = true, env = "REDEPLOY_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch deployment configs and advance them on template changes
    Run,
    /// Reconcile one config offline against an optional deployment; nothing is written
    Check {
        /// DeploymentConfig manifest (YAML or JSON)
        #[arg(long = "config")]
        config: PathBuf,
        /// ReplicationController manifest of the latest deployment
        #[arg(long = "deployment")]
        deployment: Option<PathBuf>,
    },
    /// Print the deployment a config's current version materializes as
    Render {
        /// DeploymentConfig manifest (YAML or JSON)
        #[arg(long = "config")]
        config: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("REDEPLOY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REDEPLOY_METRICS_ADDR") {
        match install_metrics_exporter(&addr) {
            Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = ?e, "metrics exporter disabled"),
        }
    }
}

fn install_metrics_exporter(addr: &str) -> Result<()> {
    let sock: std::net::SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid REDEPLOY_METRICS_ADDR {:?}; expected host:port", addr))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(sock)
        .install()
        .context("installing Prometheus exporter")
}

fn queue_cap() -> usize {
    std::env::var("REDEPLOY_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(1024)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run(cli.namespace).await,
        Commands::Check { config, deployment } => {
            let report = check::check(&config, deployment.as_deref()).await?;
            match cli.output {
                Output::Human => print!("{}", report.human()),
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            Ok(())
        }
        Commands::Render { config } => {
            let deployment = check::render(&config)?;
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(&deployment)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&deployment)?),
            }
            Ok(())
        }
    }
}

async fn run(namespace: Option<String>) -> Result<()> {
    let cap = queue_cap();
    let client = redeploy_kubehub::get_kube_client().await?;

    let (delta_tx, cache) = redeploy_store::spawn_ingest(cap);
    let mut epochs = cache.subscribe_epoch();
    let mut deployments = {
        let client = client.clone();
        let ns = namespace.clone();
        tokio::spawn(async move { redeploy_kubehub::start_deployment_watcher(client, ns.as_deref(), delta_tx).await })
    };

    // Configs seen before the first relist would all look undeployed-yet.
    info!("waiting for deployment cache to sync");
    epochs.changed().await.context("deployment cache closed before first sync")?;
    info!(deployments = cache.current().len(), "deployment cache synced");

    let (config_tx, config_rx) = mpsc::channel(cap);
    {
        let client = client.clone();
        let ns = namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = redeploy_kubehub::start_config_watcher(client, ns.as_deref(), config_tx).await {
                error!(error = ?e, "config watcher failed");
            }
        });
    }

    let controller = ConfigChangeController::new(KubeChangeStrategy::new(client), cache, JsonAnnotationCodec);
    let (mut join, stop) = controller.spawn(config_rx);

    // A stale cache or a dead event source must take the process down so a
    // supervisor restarts it.
    let exit: Result<()> = tokio::select! {
        res = signal::ctrl_c() => {
            res.context("listening for ctrl-c")?;
            info!("ctrl-c received; stopping controller");
            Ok(())
        }
        res = &mut join => {
            res.context("joining controller task")?;
            Err(anyhow!("controller exited before shutdown was requested"))
        }
        res = &mut deployments => Err(match res {
            Ok(Ok(())) => anyhow!("deployment watcher stopped"),
            Ok(Err(e)) => e.context("deployment watcher failed"),
            Err(e) => anyhow::Error::from(e).context("deployment watcher task aborted"),
        }),
    };

    if !join.is_finished() {
        stop.stop();
        join.await.context("joining controller task")?;
    }
    exit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_metrics_addr_is_an_error() {
        let err = install_metrics_exporter("not-an-addr").unwrap_err();
        assert!(format!("{:#}", err).contains("expected host:port"));
    }

    #[test]
    fn cli_parses_check_arguments() {
        let cli = Cli::try_parse_from(["redeployctl", "-o", "json", "check", "--config", "dc.yaml", "--deployment", "rc.yaml"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Check { config, deployment } => {
                assert_eq!(config, PathBuf::from("dc.yaml"));
                assert_eq!(deployment, Some(PathBuf::from("rc.yaml")));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
