//! Cluster API boundary.
//!
//! Wraps the kube client behind list and watch calls that hand the rest of
//! the controller plain objects and a tagged event type; nothing outside this
//! module touches the watch wire format. Watch streams simply end when the
//! server closes them or an error arrives, which the control loop treats as a
//! signal to relist and rebuild.

use futures::future;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::Client;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RouterConfig;
use crate::routes;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("listing returned no resource version")]
    MissingResourceVersion,
}

/// A decoded watch event for a single object.
#[derive(Debug, Clone)]
pub enum ObjectEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> ObjectEvent<T> {
    /// The object the event refers to, regardless of event type.
    pub fn object(&self) -> &T {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => object,
        }
    }
}

/// A stream of object events that ends when the watch must be recreated.
pub type EventStream<T> = BoxStream<'static, ObjectEvent<T>>;

/// Cluster API access scoped to what the controller needs.
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Lists pods matching the routable selector, filtered down to the ones
    /// that qualify for the cache. Returns the listing's resource version for
    /// starting watches.
    pub async fn list_routable_pods(
        &self,
        config: &RouterConfig,
    ) -> Result<(Vec<Pod>, String), ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&config.routable_label_selector.to_query());

        let list = api.list(&params).await?;
        let resource_version = list
            .metadata
            .resource_version
            .ok_or(ClusterError::MissingResourceVersion)?;

        let pods: Vec<Pod> = list
            .items
            .into_iter()
            .filter(|pod| routes::is_pod_routable(config, pod))
            .collect();

        debug!(pods = pods.len(), "listed routable pods");
        Ok((pods, resource_version))
    }

    /// Lists routing secrets across all namespaces. Returns the listing's
    /// resource version for starting watches.
    pub async fn list_router_secrets(
        &self,
        config: &RouterConfig,
    ) -> Result<(Vec<Secret>, String), ClusterError> {
        let api: Api<Secret> = Api::all(self.client.clone());

        let list = api.list(&ListParams::default()).await?;
        let resource_version = list
            .metadata
            .resource_version
            .ok_or(ClusterError::MissingResourceVersion)?;

        let secrets: Vec<Secret> = list
            .items
            .into_iter()
            .filter(|secret| {
                let usable = routes::is_router_secret(config, secret);
                if !usable && routes::secret_name(secret) == config.api_key_secret {
                    warn!(
                        namespace = routes::secret_namespace(secret),
                        field = %config.api_key_secret_data_field,
                        "routing secret is missing its key field"
                    );
                }
                usable
            })
            .collect();

        debug!(secrets = secrets.len(), "listed routing secrets");
        Ok((secrets, resource_version))
    }

    /// Opens a watch on routable pods from the given resource version.
    pub async fn watch_pods(
        &self,
        config: &RouterConfig,
        resource_version: &str,
    ) -> Result<EventStream<Pod>, ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = WatchParams::default().labels(&config.routable_label_selector.to_query());

        let stream = api.watch(&params, resource_version).await?;
        Ok(map_watch_events(stream))
    }

    /// Opens a watch on secrets from the given resource version.
    pub async fn watch_secrets(
        &self,
        resource_version: &str,
    ) -> Result<EventStream<Secret>, ClusterError> {
        let api: Api<Secret> = Api::all(self.client.clone());

        let stream = api.watch(&WatchParams::default(), resource_version).await?;
        Ok(map_watch_events(stream))
    }
}

/// Converts the wire-format watch stream into tagged object events.
///
/// Transport errors and server error statuses (for example an expired
/// resource version) terminate the stream instead of surfacing items, so
/// consumers only ever see valid events followed by end-of-stream.
fn map_watch_events<T>(
    stream: impl Stream<Item = kube::Result<WatchEvent<T>>> + Send + 'static,
) -> EventStream<T>
where
    T: Send + 'static,
{
    stream
        .take_while(|item| future::ready(is_healthy(item)))
        .filter_map(|item| {
            future::ready(match item {
                Ok(WatchEvent::Added(object)) => Some(ObjectEvent::Added(object)),
                Ok(WatchEvent::Modified(object)) => Some(ObjectEvent::Modified(object)),
                Ok(WatchEvent::Deleted(object)) => Some(ObjectEvent::Deleted(object)),
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(_)) | Err(_) => None,
            })
        })
        .boxed()
}

fn is_healthy<T>(item: &kube::Result<WatchEvent<T>>) -> bool {
    match item {
        Ok(WatchEvent::Error(status)) => {
            warn!(
                code = status.code,
                reason = %status.reason,
                "watch returned an error status, stream will be recreated"
            );
            false
        }
        Err(error) => {
            warn!(error = %error, "watch transport error, stream will be recreated");
            false
        }
        Ok(_) => true,
    }
}
