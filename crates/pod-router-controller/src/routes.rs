//! Route derivation from workload metadata.
//!
//! A pod advertises routing through two annotations: a whitespace-separated
//! host list and a whitespace-separated list of `port:path` pairs. The
//! extractor produces the cross product of the two for each running pod with
//! an assigned IP. Invalid tokens are dropped individually with a warning so
//! one bad entry never takes the rest of the pod's routes down with it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, Probe, Secret};
use tracing::{debug, warn};

use pod_router_common::hash::fnv1a_64;
use pod_router_common::validation;

use crate::config::RouterConfig;

/// Matching half of a route: the host and path of an incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub host: String,
    pub path: String,
}

/// Backend half of a route: where the matched request is proxied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub ip: String,
    pub port: u16,
    pub health_check: Option<HealthCheck>,
}

/// Health check parameters derived from a pod's readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Probe path for HTTP checks; `None` means a plain TCP check.
    pub http_path: Option<String>,
    pub interval_ms: u32,
    pub timeout_ms: u32,
    pub rise: u32,
    pub fall: u32,
}

/// A single host+path to pod mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub incoming: Incoming,
    pub outgoing: Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Cache entry for a routable pod: identity, derived routes, and the
/// annotation fingerprint used to short-circuit reload decisions.
#[derive(Debug, Clone)]
pub struct PodWithRoutes {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    pub fingerprint: u64,
    pub routes: Vec<Route>,
}

/// Returns the pod name, or an empty string for objects without one.
pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("")
}

/// Returns the pod namespace, or an empty string for objects without one.
pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("")
}

/// Returns the secret name, or an empty string for objects without one.
pub fn secret_name(secret: &Secret) -> &str {
    secret.metadata.name.as_deref().unwrap_or("")
}

/// Returns the secret namespace, or an empty string for objects without one.
pub fn secret_namespace(secret: &Secret) -> &str {
    secret.metadata.namespace.as_deref().unwrap_or("")
}

fn pod_phase(pod: &Pod) -> PodPhase {
    PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref()))
}

fn pod_annotation<'a>(pod: &'a Pod, name: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(name))
        .map(String::as_str)
}

fn valid_hosts(config: &RouterConfig, pod: &Pod) -> Vec<String> {
    let Some(annotation) = pod_annotation(pod, &config.hosts_annotation) else {
        return Vec::new();
    };

    annotation
        .split_whitespace()
        .filter(|host| {
            let valid = validation::is_valid_host(host);
            if !valid {
                warn!(
                    pod = pod_name(pod),
                    host = %host,
                    "dropping host that is not a valid hostname or IP"
                );
            }
            valid
        })
        .map(str::to_string)
        .collect()
}

fn parse_port_path(pod: &Pod, token: &str) -> Option<(u16, String)> {
    let Some((port, path)) = token.split_once(':') else {
        warn!(pod = pod_name(pod), token, "dropping path pair without a port");
        return None;
    };

    let Some(port) = port
        .parse::<u32>()
        .ok()
        .filter(|port| validation::is_valid_port(*port))
    else {
        warn!(pod = pod_name(pod), token, "dropping path pair with an invalid port");
        return None;
    };

    if !validation::is_valid_path(path) {
        warn!(pod = pod_name(pod), token, "dropping path pair with an invalid path");
        return None;
    }

    Some((port as u16, path.to_string()))
}

fn port_path_pairs(config: &RouterConfig, pod: &Pod) -> Vec<(u16, String)> {
    match pod_annotation(pod, &config.paths_annotation) {
        // Pods without the paths annotation serve `/` on the listen port.
        None => vec![(config.port, "/".to_string())],
        Some(annotation) => annotation
            .split_whitespace()
            .filter_map(|token| parse_port_path(pod, token))
            .collect(),
    }
}

fn readiness_health_check(pod: &Pod) -> Option<HealthCheck> {
    let probe: &Probe = pod
        .spec
        .as_ref()?
        .containers
        .iter()
        .find_map(|container| container.readiness_probe.as_ref())?;

    let http_path = match (&probe.http_get, &probe.tcp_socket) {
        (Some(http), _) => Some(http.path.clone().unwrap_or_else(|| "/".to_string())),
        (None, Some(_)) => None,
        // Exec probes have no nginx equivalent.
        (None, None) => return None,
    };

    Some(HealthCheck {
        http_path,
        interval_ms: probe.period_seconds.unwrap_or(10).max(0) as u32 * 1000,
        timeout_ms: probe.timeout_seconds.unwrap_or(1).max(0) as u32 * 1000,
        rise: probe.success_threshold.unwrap_or(1).max(0) as u32,
        fall: probe.failure_threshold.unwrap_or(3).max(0) as u32,
    })
}

/// Derives every route encoded in the pod's annotations.
///
/// Returns an empty list for pods that are not running, have no assigned IP,
/// or end up without at least one valid host and one valid port:path pair.
pub fn routes_for_pod(config: &RouterConfig, pod: &Pod) -> Vec<Route> {
    if pod_phase(pod) != PodPhase::Running {
        return Vec::new();
    }

    let ip = pod
        .status
        .as_ref()
        .and_then(|status| status.pod_ip.clone())
        .filter(|ip| !ip.is_empty());
    let Some(ip) = ip else {
        // Running but not yet scheduled onto an address; routable later.
        debug!(pod = pod_name(pod), "pod has no assigned IP yet");
        return Vec::new();
    };

    let hosts = valid_hosts(config, pod);
    if hosts.is_empty() {
        return Vec::new();
    }

    let pairs = port_path_pairs(config, pod);
    if pairs.is_empty() {
        return Vec::new();
    }

    let health_check = readiness_health_check(pod);

    let mut routes = Vec::with_capacity(hosts.len() * pairs.len());
    for host in &hosts {
        for (port, path) in &pairs {
            routes.push(Route {
                incoming: Incoming {
                    host: host.clone(),
                    path: path.clone(),
                },
                outgoing: Outgoing {
                    ip: ip.clone(),
                    port: *port,
                    health_check: health_check.clone(),
                },
            });
        }
    }

    routes
}

/// Stable hash over the routing-relevant annotation values.
///
/// A cheap change detector only; route content is always the authoritative
/// reload trigger.
pub fn annotation_fingerprint(config: &RouterConfig, pod: &Pod) -> u64 {
    let hosts = pod_annotation(pod, &config.hosts_annotation).unwrap_or("");
    let paths = pod_annotation(pod, &config.paths_annotation).unwrap_or("");

    let mut bytes = Vec::with_capacity(hosts.len() + paths.len() + 1);
    bytes.extend_from_slice(hosts.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(paths.as_bytes());

    fnv1a_64(&bytes)
}

/// Returns whether the pod qualifies for the routing cache: running, carrying
/// the routable label, and advertising at least one valid host.
pub fn is_pod_routable(config: &RouterConfig, pod: &Pod) -> bool {
    if pod_phase(pod) != PodPhase::Running {
        debug!(pod = pod_name(pod), "pod is not routable: not running");
        return false;
    }

    static NO_LABELS: BTreeMap<String, String> = BTreeMap::new();
    let labels = pod.metadata.labels.as_ref().unwrap_or(&NO_LABELS);
    if !config.routable_label_selector.matches(labels) {
        debug!(
            pod = pod_name(pod),
            selector = %config.routable_label_selector,
            "pod is not routable: missing routable label"
        );
        return false;
    }

    if valid_hosts(config, pod).is_empty() {
        debug!(
            pod = pod_name(pod),
            annotation = %config.hosts_annotation,
            "pod is not routable: no valid hosts"
        );
        return false;
    }

    true
}

/// Converts a pod into its cache entry, deriving routes and fingerprint.
pub fn pod_with_routes(config: &RouterConfig, pod: &Pod) -> PodWithRoutes {
    PodWithRoutes {
        name: pod_name(pod).to_string(),
        namespace: pod_namespace(pod).to_string(),
        phase: pod_phase(pod),
        fingerprint: annotation_fingerprint(config, pod),
        routes: routes_for_pod(config, pod),
    }
}

/// Returns whether the secret is the configured routing secret with a usable
/// API key field.
pub fn is_router_secret(config: &RouterConfig, secret: &Secret) -> bool {
    secret_name(secret) == config.api_key_secret && secret_api_key(config, secret).is_some()
}

/// Extracts the routing API key bytes from the secret, if present.
pub fn secret_api_key(config: &RouterConfig, secret: &Secret) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(&config.api_key_secret_data_field))
        .map(|bytes| bytes.0.clone())
}
