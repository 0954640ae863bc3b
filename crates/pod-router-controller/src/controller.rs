//! Control loop.
//!
//! Owns the reconciliation cache: lists cluster state once, then folds
//! batched watch events into it, recompiling and reloading nginx only when a
//! batch actually changed the generated routing. Watch streams ending (the
//! server expires resource versions periodically) trigger a full relist and
//! rebuild; a failed listing is fatal since the controller cannot proceed
//! without a baseline view of the cluster.
//!
//! The loop is the only writer of the cache and the only caller into the
//! nginx process, so there is never more than one reload in flight.

use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::cache::RouterCache;
use crate::config::RouterConfig;
use crate::kubernetes::{ClusterClient, ClusterError, EventStream, ObjectEvent};
use crate::nginx::{self, NginxServer, ServerError};
use crate::routes;

/// How long watch events accumulate before being folded into the cache.
pub const EVENT_BATCH_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to list cluster state: {0}")]
    Listing(#[from] ClusterError),

    #[error("failed to activate nginx configuration during initialization: {0}")]
    Activation(#[from] ServerError),
}

pub struct Controller {
    config: RouterConfig,
    cluster: ClusterClient,
    nginx: NginxServer,
}

struct WatchState {
    cache: RouterCache,
    pod_events: EventStream<Pod>,
    secret_events: EventStream<Secret>,
}

impl Controller {
    pub fn new(config: RouterConfig, cluster: ClusterClient, nginx: NginxServer) -> Self {
        Self {
            config,
            cluster,
            nginx,
        }
    }

    /// Runs the reconciliation loop until a fatal error occurs.
    pub async fn run(self) -> Result<(), ControllerError> {
        let mut state = self.initialize().await?;

        loop {
            let mut pod_batch: Vec<ObjectEvent<Pod>> = Vec::new();
            let mut secret_batch: Vec<ObjectEvent<Secret>> = Vec::new();
            let mut restart = false;

            let deadline = Instant::now() + EVENT_BATCH_WINDOW;
            loop {
                tokio::select! {
                    event = state.pod_events.next() => match event {
                        Some(event) => pod_batch.push(event),
                        None => {
                            warn!("pod watch closed, rebuilding cluster view");
                            restart = true;
                            break;
                        }
                    },
                    event = state.secret_events.next() => match event {
                        Some(event) => {
                            // Only secrets with the configured name can gate
                            // locations; everything else is noise.
                            if routes::secret_name(event.object()) == self.config.api_key_secret {
                                secret_batch.push(event);
                            }
                        }
                        None => {
                            warn!("secret watch closed, rebuilding cluster view");
                            restart = true;
                            break;
                        }
                    },
                    _ = sleep_until(deadline) => break,
                }
            }

            if restart {
                // The relist supersedes anything collected this window.
                state = self.initialize().await?;
                continue;
            }

            if pod_batch.is_empty() && secret_batch.is_empty() {
                continue;
            }

            info!(
                pod_events = pod_batch.len(),
                secret_events = secret_batch.len(),
                "applying event batch"
            );

            let mut needs_reload = state.cache.apply_pod_events(&self.config, pod_batch);
            needs_reload |= state.cache.apply_secret_events(&self.config, secret_batch);

            if needs_reload {
                info!("routing changed, activating new configuration");
                let conf = nginx::build_config(&self.config, &state.cache);
                // Transient reload failures are survivable mid-flight: the
                // next routing change retries with a fresh configuration.
                if let Err(error) = self.nginx.reload(&conf).await {
                    error!(error = %error, "nginx reload failed");
                }
            } else {
                debug!("event batch did not change routing");
            }
        }
    }

    /// Lists cluster state, loads the cache, activates the matching
    /// configuration, and opens watches from the listing's resource versions.
    async fn initialize(&self) -> Result<WatchState, ControllerError> {
        info!("listing routable pods and routing secrets");

        let (pods, pods_version) = self.cluster.list_routable_pods(&self.config).await?;
        let (secrets, secrets_version) = self.cluster.list_router_secrets(&self.config).await?;

        info!(
            pods = pods.len(),
            secrets = secrets.len(),
            "loaded initial cluster state"
        );

        let mut cache = RouterCache::new();
        cache.bulk_load(&self.config, pods, secrets);

        // With zero pods this activates the default configuration rather than
        // failing; a working catch-all beats an empty file.
        let conf = nginx::build_config(&self.config, &cache);
        self.nginx.reload(&conf).await?;

        let pod_events = self.cluster.watch_pods(&self.config, &pods_version).await?;
        let secret_events = self.cluster.watch_secrets(&secrets_version).await?;

        Ok(WatchState {
            cache,
            pod_events,
            secret_events,
        })
    }
}
