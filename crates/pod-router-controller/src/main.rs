use std::env;

use anyhow::{Context, Result};
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pod_router_controller::config::{RouterConfig, NGINX_CONF_PATH};
use pod_router_controller::controller::Controller;
use pod_router_controller::kubernetes::ClusterClient;
use pod_router_controller::nginx::{self, NginxServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().json())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("pod-router starting");

    let config = RouterConfig::from_env().context("Invalid configuration")?;
    info!(
        api_key_header = %config.api_key_header,
        api_key_secret = %config.api_key_secret,
        api_key_secret_data_field = %config.api_key_secret_data_field,
        hosts_annotation = %config.hosts_annotation,
        paths_annotation = %config.paths_annotation,
        port = config.port,
        routable_label_selector = %config.routable_label_selector,
        enable_upstream_check = config.enable_upstream_check,
        "Using configuration"
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let cluster = ClusterClient::new(client);

    // DISABLE_NGINX supports running against a remote cluster without a
    // colocated nginx: configurations are generated and logged, never applied.
    let nginx = if env::var_os("DISABLE_NGINX").is_some() {
        NginxServer::disabled(NGINX_CONF_PATH)
    } else {
        NginxServer::new(NGINX_CONF_PATH)
    };

    // Bring nginx up as a daemon before the first routable pod is known; the
    // controller is useless without a working proxy, so this is fatal.
    nginx
        .start(&nginx::build_default_config(&config))
        .await
        .context("Failed to start nginx")?;

    let controller = Controller::new(config, cluster, nginx);

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    tokio::select! {
        result = controller.run() => {
            return result.context("Controller failure");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
    }

    Ok(())
}
