//! Controller configuration.
//!
//! Environment-driven configuration with fail-fast validation: an unparsable
//! port, a malformed label selector, or an invalid annotation name aborts
//! startup. Derived values (the parsed selector, the nginx-normalized API key
//! header) are computed once at construction and carried on the value so
//! nothing downstream re-derives them.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use pod_router_common::validation;

/// Environment variable names understood by the controller.
pub mod env_vars {
    /// Header carrying the routing API key on incoming requests.
    pub const API_KEY_HEADER: &str = "API_KEY_HEADER";
    /// Location of the routing API key secret, as `{secret-name}:{data-field}`.
    pub const API_KEY_SECRET_LOCATION: &str = "API_KEY_SECRET_LOCATION";
    /// Name of the annotation listing routable hosts.
    pub const HOSTS_ANNOTATION: &str = "HOSTS_ANNOTATION";
    /// Name of the annotation listing `port:path` pairs.
    pub const PATHS_ANNOTATION: &str = "PATHS_ANNOTATION";
    /// Port nginx listens on.
    pub const PORT: &str = "PORT";
    /// Label selector identifying routable pods.
    pub const ROUTABLE_LABEL_SELECTOR: &str = "ROUTABLE_LABEL_SELECTOR";
    /// Optional `client_max_body_size` value for the generated configuration.
    pub const CLIENT_MAX_BODY_SIZE: &str = "CLIENT_MAX_BODY_SIZE";
    /// Enables upstream health check directives in generated upstreams.
    pub const ENABLE_UPSTREAM_CHECK: &str = "ENABLE_UPSTREAM_CHECK";
}

/// Default configuration values.
pub mod defaults {
    pub const API_KEY_HEADER: &str = "X-ROUTING-API-KEY";
    pub const API_KEY_SECRET: &str = "routing";
    pub const API_KEY_SECRET_DATA_FIELD: &str = "api-key";
    pub const HOSTS_ANNOTATION: &str = "routingHosts";
    pub const PATHS_ANNOTATION: &str = "routingPaths";
    pub const PORT: u16 = 80;
    pub const ROUTABLE_LABEL_SELECTOR: &str = "routable=true";
}

/// The nginx configuration file path.
pub const NGINX_CONF_PATH: &str = "/etc/nginx/nginx.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is an invalid port: {value}")]
    InvalidPort { var: &'static str, value: String },

    #[error("{var} has an invalid annotation name: {value}")]
    InvalidAnnotationName { var: &'static str, value: String },

    #[error("{var} has an invalid label selector: {value}")]
    InvalidLabelSelector { var: &'static str, value: String },

    #[error("{var} is not in the format of {{secret-name}}:{{data-field}}")]
    InvalidSecretLocation { var: &'static str },
}

// Kubernetes qualified name: optional DNS-subdomain prefix, then a name of
// alphanumerics, dashes, underscores, and dots with alphanumeric ends.
static QUALIFIED_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9]([a-z0-9\-.]*[a-z0-9])?/)?[a-z0-9]([a-z0-9\-_.]{0,61}[a-z0-9])?$")
        .unwrap()
});

static LABEL_VALUE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9\-_.]{0,61}[A-Za-z0-9])?$").unwrap()
});

fn is_qualified_name(value: &str) -> bool {
    QUALIFIED_NAME_REGEX.is_match(&value.to_lowercase())
}

/// A parsed `label=value` equality selector.
///
/// Only equality selectors are supported; anything else fails configuration
/// validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    pub label: String,
    pub value: String,
}

impl LabelSelector {
    fn parse(selector: &str) -> Option<Self> {
        let (label, value) = selector.split_once('=')?;
        let label = label.trim();
        let value = value.trim();

        if !is_qualified_name(label) || !LABEL_VALUE_REGEX.is_match(value) {
            return None;
        }

        Some(Self {
            label: label.to_string(),
            value: value.to_string(),
        })
    }

    /// Returns whether the label set carries this selector's label and value.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.label) == Some(&self.value)
    }

    /// Renders the selector for list/watch query parameters.
    pub fn to_query(&self) -> String {
        format!("{}={}", self.label, self.value)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.label, self.value)
    }
}

/// Validated controller configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Header name used to identify the routing API key.
    pub api_key_header: String,
    /// The header as nginx sees it in `$http_...` variables.
    pub api_key_header_nginx: String,
    /// Name of the secret holding the per-namespace routing API key.
    pub api_key_secret: String,
    /// Data field within the secret that holds the key bytes.
    pub api_key_secret_data_field: String,
    /// Annotation naming the hosts a pod serves.
    pub hosts_annotation: String,
    /// Annotation naming the `port:path` pairs a pod serves.
    pub paths_annotation: String,
    /// Port nginx listens on; also the target port for pods that omit the
    /// paths annotation.
    pub port: u16,
    /// Selector identifying routable pods.
    pub routable_label_selector: LabelSelector,
    /// Optional `client_max_body_size` directive value.
    pub client_max_body_size: Option<String>,
    /// Emit nginx_upstream_check_module directives into upstream blocks.
    pub enable_upstream_check: bool,
}

impl RouterConfig {
    /// Builds the configuration from the environment, validating every value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key_header =
            env_or_default(env_vars::API_KEY_HEADER, defaults::API_KEY_HEADER);
        let hosts_annotation =
            env_or_default(env_vars::HOSTS_ANNOTATION, defaults::HOSTS_ANNOTATION);
        let paths_annotation =
            env_or_default(env_vars::PATHS_ANNOTATION, defaults::PATHS_ANNOTATION);

        if !is_qualified_name(&hosts_annotation) {
            return Err(ConfigError::InvalidAnnotationName {
                var: env_vars::HOSTS_ANNOTATION,
                value: hosts_annotation,
            });
        }

        if !is_qualified_name(&paths_annotation) {
            return Err(ConfigError::InvalidAnnotationName {
                var: env_vars::PATHS_ANNOTATION,
                value: paths_annotation,
            });
        }

        let (api_key_secret, api_key_secret_data_field) =
            match env::var(env_vars::API_KEY_SECRET_LOCATION)
                .ok()
                .filter(|value| !value.is_empty())
            {
                None => (
                    defaults::API_KEY_SECRET.to_string(),
                    defaults::API_KEY_SECRET_DATA_FIELD.to_string(),
                ),
                Some(location) => match location.split_once(':') {
                    Some((name, field)) if !name.is_empty() && !field.is_empty() => {
                        (name.to_string(), field.to_string())
                    }
                    _ => {
                        return Err(ConfigError::InvalidSecretLocation {
                            var: env_vars::API_KEY_SECRET_LOCATION,
                        })
                    }
                },
            };

        let port = match env::var(env_vars::PORT).ok().filter(|value| !value.is_empty()) {
            None => defaults::PORT,
            Some(value) => value
                .parse::<u32>()
                .ok()
                .filter(|port| validation::is_valid_port(*port))
                .map(|port| port as u16)
                .ok_or(ConfigError::InvalidPort {
                    var: env_vars::PORT,
                    value,
                })?,
        };

        let selector = env_or_default(
            env_vars::ROUTABLE_LABEL_SELECTOR,
            defaults::ROUTABLE_LABEL_SELECTOR,
        );
        let routable_label_selector =
            LabelSelector::parse(&selector).ok_or(ConfigError::InvalidLabelSelector {
                var: env_vars::ROUTABLE_LABEL_SELECTOR,
                value: selector,
            })?;

        let client_max_body_size = env::var(env_vars::CLIENT_MAX_BODY_SIZE)
            .ok()
            .filter(|value| !value.is_empty());

        let enable_upstream_check = env::var(env_vars::ENABLE_UPSTREAM_CHECK)
            .map(|value| matches!(value.as_str(), "true" | "1"))
            .unwrap_or(false);

        Ok(Self {
            api_key_header_nginx: nginx_header_variable(&api_key_header),
            api_key_header,
            api_key_secret,
            api_key_secret_data_field,
            hosts_annotation,
            paths_annotation,
            port,
            routable_label_selector,
            client_max_body_size,
            enable_upstream_check,
        })
    }
}

fn env_or_default(var: &str, default: &str) -> String {
    env::var(var).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

/// Converts a header name to the form nginx uses in `$http_...` variables.
fn nginx_header_variable(header: &str) -> String {
    header
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
