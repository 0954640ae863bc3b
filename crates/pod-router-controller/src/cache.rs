//! Reconciliation cache.
//!
//! The single source of truth for generated configuration: routable pods with
//! their derived routes keyed by name, and per-namespace routing API keys.
//! The control loop is the only writer, so no internal locking is needed; the
//! configuration compiler reads snapshots through the accessors.
//!
//! Event folding reports whether the batch changed anything that affects the
//! generated configuration, so callers can skip nginx reloads for no-op
//! batches. The annotation fingerprint is a fast path only; recomputed route
//! content (which also covers pod IP changes) is the authoritative trigger.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::{Pod, Secret};
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::kubernetes::ObjectEvent;
use crate::routes::{self, PodWithRoutes};

#[derive(Debug, Default)]
pub struct RouterCache {
    pods: HashMap<String, PodWithRoutes>,
    secrets: HashMap<String, Vec<u8>>,
}

impl RouterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routable pods keyed by pod name.
    pub fn pods(&self) -> &HashMap<String, PodWithRoutes> {
        &self.pods
    }

    /// The routing API key for a namespace, if one is cached.
    pub fn secret(&self, namespace: &str) -> Option<&[u8]> {
        self.secrets.get(namespace).map(Vec::as_slice)
    }

    /// Replaces the cache content from a full listing.
    ///
    /// Secrets fold in sorted (namespace, name) order so that the
    /// last-writer-wins outcome for duplicate routing secrets in one
    /// namespace is deterministic.
    pub fn bulk_load(&mut self, config: &RouterConfig, pods: Vec<Pod>, mut secrets: Vec<Secret>) {
        self.pods.clear();
        self.secrets.clear();

        for pod in &pods {
            let entry = routes::pod_with_routes(config, pod);
            self.pods.insert(entry.name.clone(), entry);
        }

        secrets.sort_by(|a, b| {
            (routes::secret_namespace(a), routes::secret_name(a))
                .cmp(&(routes::secret_namespace(b), routes::secret_name(b)))
        });
        for secret in &secrets {
            let Some(key) = routes::secret_api_key(config, secret) else {
                continue;
            };
            let namespace = routes::secret_namespace(secret).to_string();
            if let Some(previous) = self.secrets.get(&namespace) {
                if previous != &key {
                    warn!(
                        namespace = %namespace,
                        "multiple routing secrets in namespace, keeping the last listed"
                    );
                }
            }
            self.secrets.insert(namespace, key);
        }
    }

    /// Folds a batch of pod events in arrival order.
    ///
    /// Returns whether the batch requires regenerating the configuration.
    pub fn apply_pod_events(
        &mut self,
        config: &RouterConfig,
        events: Vec<ObjectEvent<Pod>>,
    ) -> bool {
        let mut needs_reload = false;

        for event in events {
            needs_reload |= match event {
                ObjectEvent::Added(pod) => self.upsert_pod(config, &pod, true),
                ObjectEvent::Modified(pod) => self.upsert_pod(config, &pod, false),
                ObjectEvent::Deleted(pod) => {
                    let name = routes::pod_name(&pod);
                    let removed = self.pods.remove(name).is_some();
                    if removed {
                        info!(pod = name, "pod deleted");
                    }
                    removed
                }
            };
        }

        needs_reload
    }

    fn upsert_pod(&mut self, config: &RouterConfig, pod: &Pod, added: bool) -> bool {
        let name = routes::pod_name(pod);

        if !routes::is_pod_routable(config, pod) {
            let removed = self.pods.remove(name).is_some();
            if removed {
                info!(pod = name, "pod no longer routable, removed");
            }
            return removed || added;
        }

        let entry = routes::pod_with_routes(config, pod);
        match self.pods.get_mut(name) {
            None => {
                info!(pod = name, routes = entry.routes.len(), "pod added");
                self.pods.insert(entry.name.clone(), entry);
                true
            }
            Some(existing) => {
                let changed = existing.fingerprint != entry.fingerprint
                    || existing.routes != entry.routes;
                if changed {
                    info!(pod = name, routes = entry.routes.len(), "pod routing updated");
                } else {
                    debug!(pod = name, "pod updated without routing changes");
                }
                // Keep descriptor fields current even when routing is intact.
                *existing = entry;
                changed
            }
        }
    }

    /// Folds a batch of routing secret events in arrival order.
    ///
    /// Added and Deleted always require a reload; Modified only when the API
    /// key field itself changed, so edits to unrelated secret fields stay
    /// cheap.
    pub fn apply_secret_events(
        &mut self,
        config: &RouterConfig,
        events: Vec<ObjectEvent<Secret>>,
    ) -> bool {
        let mut needs_reload = false;

        for event in events {
            needs_reload |= match event {
                ObjectEvent::Added(secret) => {
                    let namespace = routes::secret_namespace(&secret).to_string();
                    info!(namespace = %namespace, "routing secret added");
                    self.store_secret(config, namespace, &secret);
                    true
                }
                ObjectEvent::Deleted(secret) => {
                    let namespace = routes::secret_namespace(&secret);
                    info!(namespace, "routing secret deleted");
                    self.secrets.remove(namespace);
                    true
                }
                ObjectEvent::Modified(secret) => {
                    let namespace = routes::secret_namespace(&secret).to_string();
                    let new_key = routes::secret_api_key(config, &secret);
                    let changed = api_key_changed(
                        self.secrets.get(&namespace).map(Vec::as_slice),
                        new_key.as_deref(),
                    );
                    self.store_secret(config, namespace.clone(), &secret);
                    if changed {
                        info!(namespace = %namespace, "routing API key changed");
                    } else {
                        debug!(namespace = %namespace, "routing secret modified without key change");
                    }
                    changed
                }
            };
        }

        needs_reload
    }

    fn store_secret(&mut self, config: &RouterConfig, namespace: String, secret: &Secret) {
        match routes::secret_api_key(config, secret) {
            Some(key) => {
                self.secrets.insert(namespace, key);
            }
            None => {
                // A routing secret without the key field cannot gate anything.
                self.secrets.remove(&namespace);
            }
        }
    }
}

fn api_key_changed(old: Option<&[u8]>, new: Option<&[u8]>) -> bool {
    match (old, new) {
        (None, None) => false,
        (Some(_), None) | (None, Some(_)) => true,
        (Some(old), Some(new)) => old.len() != new.len() || old != new,
    }
}
