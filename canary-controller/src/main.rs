#[macro_use]
extern crate log;

use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use kube_runtime::{watcher, WatchStreamExt};
use opentelemetry::global;
use prometheus::Registry;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;

mod config;
mod controller;
mod errors;
mod event_handler;
mod events;
#[cfg(test)]
mod fixtures;
mod informer;
mod notifier;
mod prometheus_exporter;
mod rate_limiter;
mod reconciler;
mod resource_key;
mod snapshot;
mod utils;
mod worker_pool;
mod workqueue;

use config::{Args, Configuration};
use controller::CanaryController;
use events::KubeEventRecorder;
use notifier::{Factory, NopNotifier, Notifier};
use prometheus_exporter::{meter_provider, start_prometheus_metrics_server};
use utils::{verify_crds, verify_kubernetes_version};

fn init_notifier(args: &Args) -> Arc<dyn Notifier> {
    let factory = Factory::new(&args.slack_url, &args.slack_user, &args.slack_channel);
    match factory.notifier(&args.notifier_provider) {
        Ok(notifier) => {
            if !args.slack_url.is_empty() {
                let prefix: String = args.slack_url.chars().take(30).collect();
                info!("Notifications enabled for {}", prefix);
            }
            notifier
        }
        Err(e) => {
            error!("Notifier {}", e);
            Arc::new(NopNotifier)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_filter()))
        .init();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            shutdown.cancel();
        });
    }

    let registry = Registry::new();
    let meter_provider = meter_provider(&registry)?;
    global::set_meter_provider(meter_provider.clone());
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], args.port))).await?;
    let metrics_server = tokio::spawn(start_prometheus_metrics_server(
        listener,
        registry,
        shutdown.clone(),
        args.shutdown_grace_period(),
    ));

    let configuration = Configuration::new(&args).await?;
    verify_crds(&configuration.canaries).await?;
    verify_kubernetes_version(&configuration.client).await?;

    let (recorder, publisher) = KubeEventRecorder::new(
        configuration.client.clone(),
        init_notifier(&args),
        shutdown.clone(),
    );
    let publisher = tokio::spawn(publisher.run());
    let events = watcher::watcher(
        configuration.canaries.clone(),
        configuration.watcher_config.clone(),
    )
    .default_backoff();
    let controller = CanaryController::new(Arc::new(recorder), args.resync_period());
    info!("start controllers ...");
    let result = controller.run(events, args.workers, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = publisher.await {
        error!("event publisher terminated abnormally: {}", e);
    }
    if let Err(e) = metrics_server.await {
        error!("metrics server terminated abnormally: {}", e);
    }
    if let Err(e) = meter_provider.shutdown() {
        debug!("failed to shut down meter provider: {:?}", e);
    }
    result?;
    Ok(())
}
