use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use liftbridge_operator::{
    exit, signals, ClusterWatchWorkload, ExitCode, GuardedWorkload, KubeEventSink, KubeLeaseLock,
    LeaderElectionConfig, LeaderElector, LockKey, DEFAULT_LEASE_DURATION_SECONDS,
    DEFAULT_LOCK_NAME, DEFAULT_LOCK_NAMESPACE, DEFAULT_RENEW_DEADLINE_SECONDS,
    DEFAULT_RETRY_PERIOD_SECONDS,
};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

const COMPONENT: &str = "liftbridge-operator";

#[derive(Parser, Debug)]
#[command(name = "liftbridge-operator")]
#[command(about = "Liftbridge Operator - manages Liftbridge clusters on Kubernetes")]
struct Args {
    /// Kubeconfig to use instead of the in-cluster or default configuration.
    #[arg(long)]
    path_to_kubeconfig: Option<PathBuf>,

    /// One of trace, debug, info, warn, error. Falls back to RUST_LOG, then info.
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, default_value = DEFAULT_LOCK_NAMESPACE)]
    namespace: String,

    #[arg(long, default_value = DEFAULT_LOCK_NAME)]
    lease_name: String,

    /// Candidate identity. Defaults to the host name.
    #[arg(long)]
    identity: Option<String>,

    #[arg(long, default_value_t = DEFAULT_LEASE_DURATION_SECONDS)]
    lease_duration_seconds: i32,

    #[arg(long, default_value_t = DEFAULT_RENEW_DEADLINE_SECONDS)]
    renew_deadline_seconds: u64,

    #[arg(long, default_value_t = DEFAULT_RETRY_PERIOD_SECONDS)]
    retry_period_seconds: u64,
}

fn parse_level(level: &str) -> Result<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "panic" | "fatal" => Ok(LevelFilter::ERROR),
        "warning" => Ok(LevelFilter::WARN),
        other => other
            .parse::<LevelFilter>()
            .with_context(|| format!("invalid log level {:?}", level)),
    }
}

fn env_filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(level) => Ok(EnvFilter::default().add_directive(parse_level(level)?.into())),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
    }
}

async fn build_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("failed to load kubeconfig")?
        }
        None => Config::infer()
            .await
            .context("failed to infer Kubernetes configuration")?,
    };
    Client::try_from(config).context("failed to build Kubernetes client")
}

fn resolve_identity(identity: Option<String>) -> Result<String> {
    if let Some(identity) = identity {
        return Ok(identity);
    }
    let host = hostname::get().context("failed to read host name")?;
    host.into_string()
        .map_err(|raw| anyhow::anyhow!("host name {:?} is not valid UTF-8", raw))
}

fn fatal(err: anyhow::Error) -> ! {
    error!(error = ?err, "Liftbridge Operator failed to start");
    exit::abort(ExitCode::StartupFailure)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let root = match signals::install() {
        Ok(root) => root,
        Err(e) => {
            tracing_subscriber::fmt().init();
            fatal(anyhow::Error::new(e).context("failed to install signal handlers"))
        }
    };

    match env_filter(args.log_level.as_deref()) {
        Ok(filter) => tracing_subscriber::fmt().with_env_filter(filter).init(),
        Err(e) => {
            tracing_subscriber::fmt().init();
            fatal(e)
        }
    }

    info!("Liftbridge Operator is starting");

    let client = match build_client(args.path_to_kubeconfig.as_deref()).await {
        Ok(client) => client,
        Err(e) => fatal(e),
    };
    match client.apiserver_version().await {
        Ok(version) => info!(
            version = %version.git_version,
            platform = %version.platform,
            "Connected to Kubernetes API server"
        ),
        Err(e) => fatal(anyhow::Error::new(e).context("failed to reach Kubernetes API server")),
    }

    let identity = match resolve_identity(args.identity) {
        Ok(identity) => identity,
        Err(e) => fatal(e),
    };

    let key = LockKey::new(&args.namespace, &args.lease_name);
    let events = Arc::new(KubeEventSink::new(
        client.clone(),
        key.clone(),
        COMPONENT,
        identity.clone(),
    ));
    let lock = match KubeLeaseLock::new(client.clone(), key, identity.clone(), events) {
        Ok(lock) => Arc::new(lock),
        Err(e) => fatal(anyhow::Error::new(e).context("failed to create leader election lock")),
    };

    let config = LeaderElectionConfig::new(&args.lease_name, &args.namespace, identity.as_str())
        .with_lease_duration(args.lease_duration_seconds)
        .with_renew_deadline(Duration::from_secs(args.renew_deadline_seconds))
        .with_retry_period(Duration::from_secs(args.retry_period_seconds));
    let callbacks = Arc::new(GuardedWorkload::new(
        root.clone(),
        ClusterWatchWorkload::new(client),
    ));
    let elector = match LeaderElector::new(lock, config, callbacks) {
        Ok(elector) => elector,
        Err(e) => fatal(anyhow::Error::new(e).context("invalid leader election configuration")),
    };

    info!(identity = %identity, lease = %elector.config().key(), "Liftbridge Operator started");
    let outcome = elector.run(&root).await;
    info!(outcome = ?outcome, "Leader election finished");
    exit::abort(outcome.exit_code())
}
