use std::{path::PathBuf, time::Duration};

use canary_controller_apis::Canary;
use clap::Parser;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client,
};
use kube_runtime::watcher;

use crate::errors::ControllerError;

/// Command line flags, each of them can also be set through the environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "canary-controller", version, about = "Kubernetes controller for Canary resources")]
pub(crate) struct Args {
    /// The address of the Kubernetes API server. Overrides any value in
    /// kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "KUBERNETES_MASTER")]
    pub master: Option<String>,

    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace to watch for Canary objects, empty or `*` for all namespaces.
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Comma separated label selector restricting the watched Canary objects.
    #[arg(long, env = "SELECTOR_LABELS", default_value = "")]
    pub selector_labels: String,

    /// Seconds between replays of all cached objects, 0 disables resync.
    #[arg(long, env = "RESYNC_INTERVAL", default_value_t = 30, value_name = "SECONDS")]
    pub resync_interval: u64,

    /// Number of concurrent workers.
    #[arg(long, visible_alias = "threadiness", env = "WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Log level, `RUST_LOG` takes precedence.
    #[arg(
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = ["debug", "info", "warn", "warning", "error"]
    )]
    pub log_level: String,

    /// Port of the `/metrics` and `/healthz` endpoint.
    #[arg(long, env = "HTTP_PORT", default_value_t = 8081)]
    pub port: u16,

    /// Seconds open HTTP connections may take to finish on shutdown.
    #[arg(long, env = "SHUTDOWN_GRACE_PERIOD", default_value_t = 3, value_name = "SECONDS")]
    pub shutdown_grace_period: u64,

    /// Chat provider for notifications: slack or rocket.
    #[arg(long, env = "NOTIFIER_PROVIDER", default_value = "slack")]
    pub notifier_provider: String,

    /// Incoming webhook URL, notifications are disabled without it.
    #[arg(long, env = "SLACK_URL", default_value = "")]
    pub slack_url: String,

    #[arg(long, env = "SLACK_USER", default_value = "")]
    pub slack_user: String,

    #[arg(long, env = "SLACK_CHANNEL", default_value = "")]
    pub slack_channel: String,
}

impl Args {
    /// Filter for `env_logger`, which does not know `warning`.
    pub fn log_filter(&self) -> &str {
        match self.log_level.as_str() {
            "warning" => "warn",
            level => level,
        }
    }

    pub fn watch_namespace(&self) -> Option<&str> {
        match self.namespace.trim() {
            "" | "*" => None,
            ns => Some(ns),
        }
    }

    pub fn label_selector(&self) -> Option<String> {
        let labels: Vec<&str> = self
            .selector_labels
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if labels.is_empty() {
            None
        } else {
            Some(labels.join(","))
        }
    }

    pub fn resync_period(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.resync_interval)).filter(|p| !p.is_zero())
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period)
    }
}

#[derive(Clone)]
pub(crate) struct Configuration {
    pub client: Client,
    pub canaries: Api<Canary>,
    pub watcher_config: watcher::Config,
}

impl Configuration {
    pub async fn new(args: &Args) -> Result<Self, ControllerError> {
        let client = Client::try_from(kube_config(args).await?)?;
        Ok(Self::with_client(client, args))
    }

    pub fn with_client(client: Client, args: &Args) -> Self {
        let canaries = match args.watch_namespace() {
            Some(ns) => {
                info!("Controller is only watching resources in namespace {}", ns);
                Api::<Canary>::namespaced(client.clone(), ns)
            }
            None => {
                info!("Controller is watching resources in all namespaces");
                Api::<Canary>::all(client.clone())
            }
        };
        let mut watcher_config = watcher::Config::default();
        if let Some(selector) = args.label_selector() {
            info!("Controller is only watching resources matching {}", selector);
            watcher_config = watcher_config.labels(&selector);
        }
        Configuration {
            client,
            canaries,
            watcher_config,
        }
    }
}

async fn kube_config(args: &Args) -> Result<kube::Config, ControllerError> {
    let mut config = match &args.kubeconfig {
        Some(path) => {
            debug!("Loading kubeconfig from {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await?
        }
        None => kube::Config::infer().await.map_err(anyhow::Error::from)?,
    };
    if let Some(master) = args.master.as_deref().filter(|m| !m.is_empty()) {
        config.cluster_url = master.parse().map_err(|e| {
            ControllerError::Configuration(format!("invalid master URL {}: {}", master, e))
        })?;
    }
    Ok(config)
}
