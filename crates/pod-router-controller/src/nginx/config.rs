//! nginx configuration compiler.
//!
//! A pure transform from a cache snapshot to configuration text. Output is
//! byte-stable for a given snapshot: hosts, paths, and upstream keys render
//! in lexical order, upstream members sort by pod name, and pods fold in
//! sorted name order so the result is independent of cache insertion order.
//!
//! A location backed by a single pod proxies straight to its target. When a
//! second distinct target appears for the same host and path, the location is
//! promoted to a named upstream; the name hashes the host+path key so it
//! stays stable across recompiles and pod churn.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use pod_router_common::hash::fnv1a_32;

use crate::cache::RouterCache;
use crate::config::RouterConfig;
use crate::routes::{HealthCheck, Outgoing, PodWithRoutes};

struct TargetServer {
    pod_name: String,
    pod_namespace: String,
    target: String,
}

enum LocationBackend {
    Pod(TargetServer),
    Upstream(String),
}

struct Location {
    namespace: String,
    api_key: Option<String>,
    backend: LocationBackend,
}

struct HostEntry {
    locations: BTreeMap<String, Location>,
    needs_default_location: bool,
}

struct Upstream {
    name: String,
    host: String,
    path: String,
    servers: Vec<TargetServer>,
    health_check: Option<HealthCheck>,
}

impl Upstream {
    /// Adds a member unless one with the same target already exists, keeping
    /// members sorted by pod name for reproducible output.
    fn add_server(&mut self, server: TargetServer) {
        if self.servers.iter().any(|s| s.target == server.target) {
            return;
        }
        self.servers.push(server);
        self.servers.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));
    }
}

/// Compiles the cache snapshot into nginx configuration text.
///
/// An empty cache compiles to [`build_default_config`].
pub fn build_config(config: &RouterConfig, cache: &RouterCache) -> String {
    if cache.pods().is_empty() {
        return build_default_config(config);
    }

    let mut hosts: BTreeMap<String, HostEntry> = BTreeMap::new();
    let mut upstreams: BTreeMap<String, Upstream> = BTreeMap::new();

    // Fold pods in sorted name order so upstream seeding and promotion do not
    // depend on cache insertion order.
    let mut entries: Vec<&PodWithRoutes> = cache.pods().values().collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    for entry in entries {
        for route in &entry.routes {
            let host = hosts
                .entry(route.incoming.host.clone())
                .or_insert_with(|| HostEntry {
                    locations: BTreeMap::new(),
                    needs_default_location: true,
                });

            if route.incoming.path == "/" {
                host.needs_default_location = false;
            }

            let target = render_target(&route.outgoing);
            let server = TargetServer {
                pod_name: entry.name.clone(),
                pod_namespace: entry.namespace.clone(),
                target: target.clone(),
            };

            let Some(location) = host.locations.get_mut(&route.incoming.path) else {
                host.locations.insert(
                    route.incoming.path.clone(),
                    Location {
                        namespace: entry.namespace.clone(),
                        api_key: cache.secret(&entry.namespace).map(|key| BASE64.encode(key)),
                        backend: LocationBackend::Pod(server),
                    },
                );
                continue;
            };

            let upstream_key = format!("{}{}", route.incoming.host, route.incoming.path);
            let seed = match &location.backend {
                // Another pod already serves this exact target; nothing to add.
                LocationBackend::Pod(current) if current.target == target => continue,
                // A second distinct target: promote, seeding the upstream
                // with the location's current backend.
                LocationBackend::Pod(current) => Some(TargetServer {
                    pod_name: current.pod_name.clone(),
                    pod_namespace: current.pod_namespace.clone(),
                    target: current.target.clone(),
                }),
                LocationBackend::Upstream(_) => None,
            };

            if let Some(seed) = seed {
                let name = format!("upstream{}", fnv1a_32(upstream_key.as_bytes()));
                let mut upstream = Upstream {
                    name: name.clone(),
                    host: route.incoming.host.clone(),
                    path: route.incoming.path.clone(),
                    servers: vec![seed],
                    health_check: route.outgoing.health_check.clone(),
                };
                upstream.add_server(server);
                upstreams.insert(upstream_key, upstream);
                location.backend = LocationBackend::Upstream(name);
            } else if let Some(upstream) = upstreams.get_mut(&upstream_key) {
                if upstream.health_check.is_none() {
                    upstream.health_check = route.outgoing.health_check.clone();
                }
                upstream.add_server(server);
            }
        }
    }

    render(config, &hosts, &upstreams)
}

/// The fallback configuration for an empty cache: nginx comes up as a daemon
/// and closes every connection. Deliberately not a 404, so "no backend
/// configured" is distinguishable from "resource not found".
pub fn build_default_config(config: &RouterConfig) -> String {
    format!(
        "\n# A very simple nginx configuration file that forces nginx to start as a daemon.\n\
         events {{}}\n\
         http {{{}}}\n\
         daemon on;\n",
        default_server_block(config)
    )
}

/// Formats a proxy target, eliding the canonical ports 80 and 443.
fn render_target(outgoing: &Outgoing) -> String {
    if outgoing.port == 80 || outgoing.port == 443 {
        outgoing.ip.clone()
    } else {
        format!("{}:{}", outgoing.ip, outgoing.port)
    }
}

fn render(
    config: &RouterConfig,
    hosts: &BTreeMap<String, HostEntry>,
    upstreams: &BTreeMap<String, Upstream>,
) -> String {
    let mut out = String::new();

    out.push_str("\nevents {\n  worker_connections 1024;\n}\nhttp {");
    out.push_str(&http_preamble(config));

    for upstream in upstreams.values() {
        render_upstream(&mut out, config, upstream);
    }

    for (host, entry) in hosts {
        render_server(&mut out, config, host, entry);
    }

    out.push_str(&default_server_block(config));
    out.push_str("}\n");
    out
}

fn http_preamble(config: &RouterConfig) -> String {
    let mut out = String::from(
        "\n  # http://nginx.org/en/docs/http/ngx_http_core_module.html\n\
         \x20 types_hash_max_size 2048;\n\
         \x20 server_names_hash_max_size 512;\n\
         \x20 server_names_hash_bucket_size 64;\n",
    );

    if let Some(size) = &config.client_max_body_size {
        out.push_str(&format!("  client_max_body_size {size};\n"));
    }

    out.push_str(
        "\n  # Force HTTP 1.1 for upstream requests\n\
         \x20 proxy_http_version 1.1;\n\
         \n\
         \x20 # When a 'Connection' header is present in the request the variable\n\
         \x20 # reflects the provided value, otherwise it falls back to 'close' the way\n\
         \x20 # nginx itself treats upstream connections.\n\
         \x20 map $http_connection $p_connection {\n\
         \x20   default $http_connection;\n\
         \x20   ''      close;\n\
         \x20 }\n\
         \n\
         \x20 # Pass through the appropriate headers\n\
         \x20 proxy_set_header Connection $p_connection;\n\
         \x20 proxy_set_header Host $http_host;\n\
         \x20 proxy_set_header Upgrade $http_upgrade;\n",
    );

    out
}

fn default_server_block(config: &RouterConfig) -> String {
    format!(
        "\n  # Default server that will just close the connection as if there was no server available\n\
         \x20 server {{\n\
         \x20   listen {} default_server;\n\
         \x20   return 444;\n\
         \x20 }}\n",
        config.port
    )
}

fn render_upstream(out: &mut String, config: &RouterConfig, upstream: &Upstream) {
    out.push_str(&format!(
        "\n  # Upstream for {} traffic on {}\n",
        upstream.path, upstream.host
    ));
    out.push_str(&format!("  upstream {} {{\n", upstream.name));

    for server in &upstream.servers {
        out.push_str(&format!(
            "    # Pod {} (namespace: {})\n",
            server.pod_name, server.pod_namespace
        ));
        out.push_str(&format!("    server {};\n", server.target));
    }

    if config.enable_upstream_check {
        if let Some(check) = &upstream.health_check {
            render_health_check(out, check);
        }
    }

    out.push_str("  }\n");
}

fn render_health_check(out: &mut String, check: &HealthCheck) {
    let check_type = if check.http_path.is_some() { "http" } else { "tcp" };

    out.push_str("\n    # Health checks provided by nginx_upstream_check_module\n");
    out.push_str(&format!(
        "    check interval={} rise={} fall={} timeout={} port=0 type={};\n",
        check.interval_ms, check.rise, check.fall, check.timeout_ms, check_type
    ));

    if let Some(path) = &check.http_path {
        out.push_str(&format!(
            "    check_http_send \"GET {path} HTTP/1.0\\r\\n\\r\\n\";\n"
        ));
        out.push_str("    check_http_expect_alive http_2xx;\n");
    }
}

fn render_server(out: &mut String, config: &RouterConfig, host: &str, entry: &HostEntry) {
    out.push_str("\n  server {\n");
    out.push_str(&format!("    listen {};\n", config.port));
    out.push_str(&format!("    server_name {host};\n"));

    if entry.needs_default_location {
        out.push_str(
            "\n    # Here to avoid returning the nginx welcome page for servers that do not\n\
             \x20   # have a \"/\" location\n\
             \x20   location / {\n\
             \x20     return 404;\n\
             \x20   }\n",
        );
    }

    for (path, location) in &entry.locations {
        out.push_str(&format!("\n    location {path} {{\n"));

        if let Some(api_key) = &location.api_key {
            out.push_str(&format!(
                "      # Check the routing API key (namespace: {})\n",
                location.namespace
            ));
            out.push_str(&format!(
                "      if ($http_{} != \"{}\") {{\n        return 403;\n      }}\n\n",
                config.api_key_header_nginx, api_key
            ));
        }

        match &location.backend {
            LocationBackend::Pod(server) => {
                out.push_str(&format!(
                    "      # Pod {} (namespace: {})\n",
                    server.pod_name, server.pod_namespace
                ));
                out.push_str(&format!("      proxy_pass http://{};\n", server.target));
            }
            LocationBackend::Upstream(name) => {
                out.push_str(&format!("      # Upstream {name}\n"));
                out.push_str(&format!("      proxy_pass http://{name};\n"));
            }
        }

        out.push_str("    }\n");
    }

    out.push_str("  }\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::tests::{test_config, test_pod, test_secret};
    use k8s_openapi::api::core::v1::{HTTPGetAction, Pod, Probe, Secret, TCPSocketAction};

    fn compile(pods: Vec<Pod>, secrets: Vec<Secret>) -> String {
        compile_with(test_config(), pods, secrets)
    }

    fn compile_with(config: RouterConfig, pods: Vec<Pod>, secrets: Vec<Secret>) -> String {
        let mut cache = RouterCache::new();
        cache.bulk_load(&config, pods, secrets);
        build_config(&config, &cache)
    }

    fn http_probe(path: &str) -> Probe {
        Probe {
            http_get: Some(HTTPGetAction {
                path: Some(path.to_string()),
                ..Default::default()
            }),
            period_seconds: Some(10),
            timeout_seconds: Some(5),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_cache_returns_default_config() {
        let config = test_config();

        let conf = build_config(&config, &RouterCache::new());

        assert_eq!(conf, build_default_config(&config));
        assert_eq!(
            conf,
            "\n# A very simple nginx configuration file that forces nginx to start as a daemon.\n\
             events {}\n\
             http {\n\
             \x20 # Default server that will just close the connection as if there was no server available\n\
             \x20 server {\n\
             \x20   listen 80 default_server;\n\
             \x20   return 444;\n\
             \x20 }\n\
             }\n\
             daemon on;\n"
        );
    }

    #[test]
    fn test_default_config_custom_port() {
        let mut config = test_config();
        config.port = 90;

        assert!(build_default_config(&config).contains("listen 90 default_server;"));
    }

    #[test]
    fn test_single_pod_multiple_paths() {
        let conf = compile(
            vec![test_pod(
                "testing",
                "testing",
                "10.244.1.16",
                "test.github.com",
                Some("80:/prod 3000:/test"),
            )],
            vec![],
        );

        let expected = format!(
            "\nevents {{\n\
             \x20 worker_connections 1024;\n\
             }}\n\
             http {{{preamble}\n\
             \x20 server {{\n\
             \x20   listen 80;\n\
             \x20   server_name test.github.com;\n\
             \n\
             \x20   # Here to avoid returning the nginx welcome page for servers that do not\n\
             \x20   # have a \"/\" location\n\
             \x20   location / {{\n\
             \x20     return 404;\n\
             \x20   }}\n\
             \n\
             \x20   location /prod {{\n\
             \x20     # Pod testing (namespace: testing)\n\
             \x20     proxy_pass http://10.244.1.16;\n\
             \x20   }}\n\
             \n\
             \x20   location /test {{\n\
             \x20     # Pod testing (namespace: testing)\n\
             \x20     proxy_pass http://10.244.1.16:3000;\n\
             \x20   }}\n\
             \x20 }}\n\
             {default_server}}}\n",
            preamble = http_preamble(&test_config()),
            default_server = default_server_block(&test_config()),
        );

        assert_eq!(conf, expected);
    }

    #[test]
    fn test_multiple_single_pod_services() {
        let conf = compile(
            vec![
                test_pod(
                    "testing",
                    "testing",
                    "10.244.1.16",
                    "test.github.com",
                    Some("3000:/nodejs"),
                ),
                test_pod(
                    "testing2",
                    "testing",
                    "10.244.1.17",
                    "prod.github.com",
                    Some("80:/"),
                ),
            ],
            vec![],
        );

        let expected = format!(
            "\nevents {{\n\
             \x20 worker_connections 1024;\n\
             }}\n\
             http {{{preamble}\n\
             \x20 server {{\n\
             \x20   listen 80;\n\
             \x20   server_name prod.github.com;\n\
             \n\
             \x20   location / {{\n\
             \x20     # Pod testing2 (namespace: testing)\n\
             \x20     proxy_pass http://10.244.1.17;\n\
             \x20   }}\n\
             \x20 }}\n\
             \n\
             \x20 server {{\n\
             \x20   listen 80;\n\
             \x20   server_name test.github.com;\n\
             \n\
             \x20   # Here to avoid returning the nginx welcome page for servers that do not\n\
             \x20   # have a \"/\" location\n\
             \x20   location / {{\n\
             \x20     return 404;\n\
             \x20   }}\n\
             \n\
             \x20   location /nodejs {{\n\
             \x20     # Pod testing (namespace: testing)\n\
             \x20     proxy_pass http://10.244.1.16:3000;\n\
             \x20   }}\n\
             \x20 }}\n\
             {default_server}}}\n",
            preamble = http_preamble(&test_config()),
            default_server = default_server_block(&test_config()),
        );

        assert_eq!(conf, expected);
    }

    #[test]
    fn test_upstream_promotion() {
        let conf = compile(
            vec![
                test_pod("testing", "testing", "10.244.1.16", "test.github.com", Some("80:/")),
                test_pod("testing2", "testing", "10.244.1.17", "test.github.com", Some("80:/")),
                test_pod("testing3", "testing", "10.244.1.18", "test.github.com", Some("3000:/")),
            ],
            vec![],
        );

        let expected = format!(
            "\nevents {{\n\
             \x20 worker_connections 1024;\n\
             }}\n\
             http {{{preamble}\n\
             \x20 # Upstream for / traffic on test.github.com\n\
             \x20 upstream upstream619897598 {{\n\
             \x20   # Pod testing (namespace: testing)\n\
             \x20   server 10.244.1.16;\n\
             \x20   # Pod testing2 (namespace: testing)\n\
             \x20   server 10.244.1.17;\n\
             \x20   # Pod testing3 (namespace: testing)\n\
             \x20   server 10.244.1.18:3000;\n\
             \x20 }}\n\
             \n\
             \x20 server {{\n\
             \x20   listen 80;\n\
             \x20   server_name test.github.com;\n\
             \n\
             \x20   location / {{\n\
             \x20     # Upstream upstream619897598\n\
             \x20     proxy_pass http://upstream619897598;\n\
             \x20   }}\n\
             \x20 }}\n\
             {default_server}}}\n",
            preamble = http_preamble(&test_config()),
            default_server = default_server_block(&test_config()),
        );

        assert_eq!(conf, expected);
    }

    #[test]
    fn test_upstream_members_deduplicate_targets() {
        let conf = compile(
            vec![
                test_pod("a", "testing", "10.244.1.16", "test.github.com", Some("80:/")),
                test_pod("b", "testing", "10.244.1.17", "test.github.com", Some("80:/")),
                // Same target as pod a; must not appear twice.
                test_pod("c", "testing", "10.244.1.16", "test.github.com", Some("80:/")),
            ],
            vec![],
        );

        assert_eq!(conf.matches("server 10.244.1.16;").count(), 1);
        assert_eq!(conf.matches("server 10.244.1.17;").count(), 1);
    }

    #[test]
    fn test_api_key_gating() {
        let api_key = b"Updated-API-Key";
        let conf = compile(
            vec![test_pod("testing", "testing", "10.244.1.16", "test.github.com", Some("80:/"))],
            vec![test_secret("testing", "routing", api_key)],
        );

        let expected_check = format!(
            "    location / {{\n\
             \x20     # Check the routing API key (namespace: testing)\n\
             \x20     if ($http_x_routing_api_key != \"{}\") {{\n\
             \x20       return 403;\n\
             \x20     }}\n\
             \n\
             \x20     # Pod testing (namespace: testing)\n\
             \x20     proxy_pass http://10.244.1.16;\n\
             \x20   }}\n",
            BASE64.encode(api_key)
        );

        assert!(conf.contains(&expected_check), "missing API key check:\n{conf}");
    }

    #[test]
    fn test_custom_api_key_header() {
        let mut config = test_config();
        config.api_key_header_nginx = "x_something_custom_api_key".to_string();

        let conf = compile_with(
            config,
            vec![test_pod("testing", "testing", "10.244.1.16", "test.github.com", Some("80:/"))],
            vec![test_secret("testing", "routing", b"key")],
        );

        assert!(conf.contains("if ($http_x_something_custom_api_key != "));
    }

    #[test]
    fn test_secret_scoped_to_pod_namespace() {
        let conf = compile(
            vec![test_pod("testing", "ns-a", "10.244.1.16", "test.github.com", Some("80:/"))],
            vec![test_secret("ns-b", "routing", b"other-namespace-key")],
        );

        // A secret in another namespace must not gate this pod's location.
        assert!(!conf.contains("return 403;"));
    }

    #[test]
    fn test_canonical_port_elision() {
        let conf = compile(
            vec![test_pod(
                "testing",
                "testing",
                "10.244.1.16",
                "test.github.com",
                Some("80:/http 443:/https 3000:/other"),
            )],
            vec![],
        );

        assert!(conf.contains("\n      proxy_pass http://10.244.1.16;\n"));
        assert!(conf.contains("\n      proxy_pass http://10.244.1.16:3000;\n"));
        assert!(!conf.contains("10.244.1.16:80"));
        assert!(!conf.contains("10.244.1.16:443"));
    }

    #[test]
    fn test_recompilation_is_idempotent() {
        let config = test_config();
        let mut cache = RouterCache::new();
        cache.bulk_load(
            &config,
            vec![
                test_pod("p1", "ns1", "10.0.0.5", "a.example.com b.example.com", Some("8080:/api")),
                test_pod("p2", "ns1", "10.0.0.6", "a.example.com", Some("8080:/api")),
            ],
            vec![test_secret("ns1", "routing", b"key")],
        );

        assert_eq!(build_config(&config, &cache), build_config(&config, &cache));
    }

    #[test]
    fn test_insertion_order_independence() {
        let pods = vec![
            test_pod("p1", "ns1", "10.0.0.5", "a.example.com", Some("8080:/api")),
            test_pod("p2", "ns1", "10.0.0.6", "a.example.com", Some("8080:/api")),
            test_pod("p3", "ns2", "10.0.0.7", "b.example.com", None),
        ];

        let forward = compile(pods.clone(), vec![]);
        let reversed = compile(pods.into_iter().rev().collect(), vec![]);

        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_example_scenario() {
        let conf = compile(
            vec![test_pod("p1", "ns1", "10.0.0.5", "a.example.com", Some("8080:/api"))],
            vec![],
        );

        assert!(conf.contains("server_name a.example.com;"));
        assert!(conf.contains("location /api {"));
        assert!(conf.contains("proxy_pass http://10.0.0.5:8080;"));
        assert!(conf.contains("location / {\n      return 404;\n    }"));
    }

    #[test]
    fn test_health_checks_disabled_by_default() {
        let mut pod = test_pod("p1", "ns1", "10.0.0.5", "a.example.com", Some("80:/"));
        pod.spec.as_mut().unwrap().containers[0].readiness_probe = Some(http_probe("/status"));
        let mut other = test_pod("p2", "ns1", "10.0.0.6", "a.example.com", Some("80:/"));
        other.spec.as_mut().unwrap().containers[0].readiness_probe = Some(http_probe("/status"));

        let conf = compile(vec![pod, other], vec![]);

        assert!(!conf.contains("check interval="));
    }

    #[test]
    fn test_http_health_checks_enabled() {
        let mut config = test_config();
        config.enable_upstream_check = true;

        let mut pod = test_pod("p1", "ns1", "10.0.0.5", "a.example.com", Some("80:/"));
        pod.spec.as_mut().unwrap().containers[0].readiness_probe = Some(http_probe("/status"));
        let mut other = test_pod("p2", "ns1", "10.0.0.6", "a.example.com", Some("80:/"));
        other.spec.as_mut().unwrap().containers[0].readiness_probe = Some(http_probe("/status"));

        let conf = compile_with(config, vec![pod, other], vec![]);

        assert!(conf.contains(
            "    check interval=10000 rise=1 fall=3 timeout=5000 port=0 type=http;\n"
        ));
        assert!(conf.contains("    check_http_send \"GET /status HTTP/1.0\\r\\n\\r\\n\";\n"));
        assert!(conf.contains("    check_http_expect_alive http_2xx;\n"));
    }

    #[test]
    fn test_tcp_health_checks_enabled() {
        let mut config = test_config();
        config.enable_upstream_check = true;

        let probe = Probe {
            tcp_socket: Some(TCPSocketAction::default()),
            period_seconds: Some(10),
            timeout_seconds: Some(5),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            ..Default::default()
        };
        let mut pod = test_pod("p1", "ns1", "10.0.0.5", "a.example.com", Some("80:/"));
        pod.spec.as_mut().unwrap().containers[0].readiness_probe = Some(probe.clone());
        let mut other = test_pod("p2", "ns1", "10.0.0.6", "a.example.com", Some("80:/"));
        other.spec.as_mut().unwrap().containers[0].readiness_probe = Some(probe);

        let conf = compile_with(config, vec![pod, other], vec![]);

        assert!(conf.contains(
            "    check interval=10000 rise=1 fall=3 timeout=5000 port=0 type=tcp;\n"
        ));
        assert!(!conf.contains("check_http_send"));
    }

    #[test]
    fn test_client_max_body_size() {
        let mut config = test_config();
        config.client_max_body_size = Some("1234m".to_string());

        let conf = compile_with(
            config,
            vec![test_pod("p1", "ns1", "10.0.0.5", "a.example.com", None)],
            vec![],
        );

        assert!(conf.contains("  client_max_body_size 1234m;\n"));
    }

    #[test]
    fn test_trailing_default_server_always_present() {
        let conf = compile(
            vec![test_pod("p1", "ns1", "10.0.0.5", "a.example.com", None)],
            vec![],
        );

        assert!(conf.contains("listen 80 default_server;\n    return 444;"));
    }
}
