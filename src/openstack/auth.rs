//! Cloud profile discovery and Keystone v3 password authentication.
//!
//! Profiles come from the first `clouds.yaml` found on the usual search
//! path. Authenticating yields one [`HttpSession`] per service listed in the
//! token's catalogue.

use std::collections::HashMap;
use std::env;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::http::{HTTP_CLIENT, HttpSession, transport};
use super::rest::{Service, SessionMap};
use super::OpenstackError;
use crate::userdata::read_to_string_ambient;

/// Overrides the `clouds.yaml` search path with a single file.
pub const CLIENT_CONFIG_FILE_ENV: &str = "OS_CLIENT_CONFIG_FILE";

const CLOUDS_FILE: &str = "clouds.yaml";
const SYSTEM_CLOUDS_FILE: &str = "/etc/openstack/clouds.yaml";
const DEFAULT_DOMAIN: &str = "Default";

/// Credentials section of a cloud profile.
#[derive(Clone, Deserialize, Eq, PartialEq)]
pub struct AuthSettings {
    /// Keystone URL, with or without the `/v3` suffix.
    pub auth_url: String,
    /// User name.
    #[serde(default)]
    pub username: Option<String>,
    /// User password.
    #[serde(default)]
    pub password: Option<String>,
    /// Project scope by name.
    #[serde(default, alias = "tenant_name")]
    pub project_name: Option<String>,
    /// Project scope by id.
    #[serde(default, alias = "tenant_id")]
    pub project_id: Option<String>,
    /// Domain of the user.
    #[serde(default)]
    pub user_domain_name: Option<String>,
    /// Domain of the project.
    #[serde(default)]
    pub project_domain_name: Option<String>,
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("project_name", &self.project_name)
            .field("project_id", &self.project_id)
            .field("user_domain_name", &self.user_domain_name)
            .field("project_domain_name", &self.project_domain_name)
            .finish()
    }
}

/// One named cloud from `clouds.yaml`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct CloudProfile {
    /// Credentials.
    pub auth: AuthSettings,
    /// Region used to pick catalogue endpoints.
    #[serde(default)]
    pub region_name: Option<String>,
    /// Endpoint interface (`public`, `internal`, `admin`).
    #[serde(default = "default_interface")]
    pub interface: String,
}

fn default_interface() -> String {
    String::from("public")
}

#[derive(Deserialize)]
struct CloudsFile {
    clouds: serde_yaml::Mapping,
}

/// Files searched for cloud profiles, most specific first.
#[must_use]
pub fn candidate_paths(workspace: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut paths = Vec::new();
    if let Some(explicit) = env::var_os(CLIENT_CONFIG_FILE_ENV)
        .and_then(|value| value.into_string().ok())
        .filter(|value| !value.trim().is_empty())
    {
        paths.push(Utf8PathBuf::from(explicit));
    }
    paths.push(Utf8PathBuf::from(CLOUDS_FILE));
    if let Some(home) = env::var_os("HOME").and_then(|value| value.into_string().ok()) {
        paths.push(Utf8PathBuf::from(home).join(".config/openstack").join(CLOUDS_FILE));
    }
    paths.push(workspace.join(".config/openstack").join(CLOUDS_FILE));
    paths.push(Utf8PathBuf::from(SYSTEM_CLOUDS_FILE));
    paths
}

/// Loads the profile from the first existing file in `paths`.
///
/// # Errors
///
/// - [`OpenstackError::Auth`] when no file exists or it cannot be parsed.
/// - [`OpenstackError::Usage`] when `cloud_name` is not defined.
pub fn load_profile(
    paths: &[Utf8PathBuf],
    cloud_name: Option<&str>,
) -> Result<(String, CloudProfile), OpenstackError> {
    let path = paths
        .iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| OpenstackError::Auth {
            message: format!("no {CLOUDS_FILE} found in {}", join_paths(paths)),
        })?;
    debug!(path = %path, "reading cloud profiles");
    let content = read_to_string_ambient(path).map_err(|message| OpenstackError::Io {
        path: path.to_string(),
        message,
    })?;
    parse_profile(&content, cloud_name)
}

/// Picks a profile out of `clouds.yaml` content.
///
/// Without `cloud_name` the first cloud in file order is used.
///
/// # Errors
///
/// As for [`load_profile`].
pub fn parse_profile(
    content: &str,
    cloud_name: Option<&str>,
) -> Result<(String, CloudProfile), OpenstackError> {
    let file: CloudsFile = serde_yaml::from_str(content).map_err(|err| OpenstackError::Auth {
        message: format!("invalid {CLOUDS_FILE}: {err}"),
    })?;
    let (key, value) = match cloud_name {
        Some(wanted) => file
            .clouds
            .iter()
            .find(|(key, _)| key.as_str() == Some(wanted))
            .ok_or_else(|| OpenstackError::Usage(format!("cloud '{wanted}' is not defined")))?,
        None => file.clouds.iter().next().ok_or_else(|| OpenstackError::Auth {
            message: format!("{CLOUDS_FILE} defines no clouds"),
        })?,
    };
    let name = key.as_str().unwrap_or_default().to_owned();
    let profile: CloudProfile =
        serde_yaml::from_value(value.clone()).map_err(|err| OpenstackError::Auth {
            message: format!("cloud '{name}' is malformed: {err}"),
        })?;
    Ok((name, profile))
}

/// Endpoint advertised for one service in the token catalogue.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct CatalogEndpoint {
    /// `public`, `internal` or `admin`.
    pub interface: String,
    /// Region the endpoint lives in.
    #[serde(default)]
    pub region: Option<String>,
    /// Base URL.
    pub url: String,
}

/// Catalogue entry for one service type.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct CatalogEntry {
    /// Service type (`compute`, `volumev3`, ...).
    #[serde(rename = "type")]
    pub service_type: String,
    /// Endpoints for the service.
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize)]
struct TokenBody {
    token: Token,
}

#[derive(Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

fn service_for(service_type: &str) -> Option<Service> {
    match service_type {
        "compute" => Some(Service::Compute),
        "volumev3" | "block-storage" | "volumev2" | "volume" => Some(Service::Volume),
        "network" => Some(Service::Network),
        "image" => Some(Service::Image),
        _ => None,
    }
}

/// Maps catalogue entries to endpoint URLs for the services in use.
///
/// When several block-storage types are advertised the first listed wins.
#[must_use]
pub fn catalog_endpoints(
    catalog: &[CatalogEntry],
    interface: &str,
    region: Option<&str>,
) -> HashMap<Service, String> {
    let mut endpoints = HashMap::new();
    for entry in catalog {
        let Some(service) = service_for(&entry.service_type) else {
            continue;
        };
        if endpoints.contains_key(&service) {
            continue;
        }
        if let Some(endpoint) = entry.endpoints.iter().find(|endpoint| {
            endpoint.interface == interface
                && region.is_none_or(|wanted| endpoint.region.as_deref() == Some(wanted))
        }) {
            endpoints.insert(service, endpoint.url.clone());
        }
    }
    endpoints
}

/// Authenticates against Keystone and builds a session per service.
///
/// # Errors
///
/// Returns [`OpenstackError::Auth`] when credentials are incomplete,
/// rejected, or the catalogue lacks a required service.
pub async fn authenticate(profile: &CloudProfile) -> Result<SessionMap, OpenstackError> {
    let auth = &profile.auth;
    let username = auth.username.as_deref().ok_or_else(|| missing("username"))?;
    let password = auth.password.as_deref().ok_or_else(|| missing("password"))?;
    let project = match (&auth.project_id, &auth.project_name) {
        (Some(id), _) => json!({"id": id}),
        (None, Some(name)) => json!({
            "name": name,
            "domain": {"name": auth.project_domain_name.as_deref().unwrap_or(DEFAULT_DOMAIN)},
        }),
        (None, None) => return Err(missing("project_name or project_id")),
    };
    let body = json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": username,
                        "domain": {"name": auth.user_domain_name.as_deref().unwrap_or(DEFAULT_DOMAIN)},
                        "password": password,
                    }
                }
            },
            "scope": {"project": project},
        }
    });

    let url = token_url(&auth.auth_url);
    let response = HTTP_CLIENT
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(transport)?;
    let status = response.status();
    let subject_token = response
        .headers()
        .get("X-Subject-Token")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let bytes = response.bytes().await.map_err(transport)?;
    if !status.is_success() {
        return Err(OpenstackError::Auth {
            message: format!("{url} returned status {}", status.as_u16()),
        });
    }
    let token = subject_token.ok_or_else(|| OpenstackError::Auth {
        message: String::from("response carried no X-Subject-Token header"),
    })?;
    let parsed: TokenBody = serde_json::from_slice(&bytes).map_err(|err| OpenstackError::Auth {
        message: format!("unreadable token response: {err}"),
    })?;

    let endpoints = catalog_endpoints(
        &parsed.token.catalog,
        &profile.interface,
        profile.region_name.as_deref(),
    );
    let mut sessions = SessionMap::new();
    for service in Service::ALL {
        let endpoint = endpoints.get(&service).ok_or_else(|| OpenstackError::Auth {
            message: format!("catalogue has no {} endpoint for the {service} service", profile.interface),
        })?;
        let session = HttpSession::new(endpoint, token.clone());
        debug!(%service, endpoint = session.endpoint(), "using endpoint");
        sessions.insert(service, Box::new(session));
    }
    info!(user = username, "authenticated with keystone");
    Ok(sessions)
}

fn token_url(auth_url: &str) -> String {
    let base = auth_url.trim_end_matches('/');
    if base.ends_with("/v3") {
        format!("{base}/auth/tokens")
    } else {
        format!("{base}/v3/auth/tokens")
    }
}

fn missing(field: &str) -> OpenstackError {
    OpenstackError::Auth {
        message: format!("cloud profile is missing auth.{field}"),
    }
}

fn join_paths(paths: &[Utf8PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const CLOUDS: &str = "
clouds:
  lab:
    auth:
      auth_url: https://keystone.lab:5000
      username: ci
      password: hunter2
      project_name: builds
    region_name: RegionOne
  prod:
    auth:
      auth_url: https://keystone.prod:5000/v3
      username: ops
      password: secret
      project_id: abc123
    interface: internal
";

    #[test]
    fn first_cloud_is_the_default() {
        let (name, profile) =
            parse_profile(CLOUDS, None).unwrap_or_else(|err| panic!("profile should parse: {err}"));
        assert_eq!(name, "lab");
        assert_eq!(profile.interface, "public");
        assert_eq!(profile.region_name.as_deref(), Some("RegionOne"));
    }

    #[test]
    fn missing_clouds_file_lists_every_searched_path() {
        let paths = [
            Utf8PathBuf::from("/nonexistent/a/clouds.yaml"),
            Utf8PathBuf::from("/nonexistent/b/clouds.yaml"),
        ];
        let err = load_profile(&paths, None).expect_err("no file exists");
        assert_eq!(
            err.to_string(),
            "authentication failed: no clouds.yaml found in \
             /nonexistent/a/clouds.yaml, /nonexistent/b/clouds.yaml"
        );
    }

    #[test]
    fn named_cloud_is_selected() {
        let (name, profile) = parse_profile(CLOUDS, Some("prod"))
            .unwrap_or_else(|err| panic!("profile should parse: {err}"));
        assert_eq!(name, "prod");
        assert_eq!(profile.auth.project_id.as_deref(), Some("abc123"));
        assert_eq!(profile.interface, "internal");
    }

    #[test]
    fn unknown_cloud_is_a_usage_error() {
        let err = parse_profile(CLOUDS, Some("staging")).expect_err("cloud is undefined");
        assert!(matches!(err, OpenstackError::Usage(_)));
    }

    #[test]
    fn debug_output_redacts_password() {
        let (_, profile) =
            parse_profile(CLOUDS, None).unwrap_or_else(|err| panic!("profile should parse: {err}"));
        let rendered = format!("{profile:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[rstest]
    #[case("https://keystone:5000", "https://keystone:5000/v3/auth/tokens")]
    #[case("https://keystone:5000/v3/", "https://keystone:5000/v3/auth/tokens")]
    fn token_url_appends_version_once(#[case] auth_url: &str, #[case] expected: &str) {
        assert_eq!(token_url(auth_url), expected);
    }

    #[test]
    fn catalogue_maps_services_by_interface_and_region() {
        let catalog: Vec<CatalogEntry> = serde_json::from_value(json!([
            {"type": "compute", "endpoints": [
                {"interface": "internal", "region": "RegionOne", "url": "http://nova-int/v2.1"},
                {"interface": "public", "region": "RegionOne", "url": "http://nova/v2.1"}
            ]},
            {"type": "volumev3", "endpoints": [
                {"interface": "public", "region": "RegionOne", "url": "http://cinder/v3/p"}
            ]},
            {"type": "volumev2", "endpoints": [
                {"interface": "public", "region": "RegionOne", "url": "http://cinder/v2/p"}
            ]},
            {"type": "image", "endpoints": [
                {"interface": "public", "region": "RegionTwo", "url": "http://glance-two"}
            ]},
            {"type": "identity", "endpoints": [
                {"interface": "public", "region": "RegionOne", "url": "http://keystone"}
            ]}
        ]))
        .unwrap_or_else(|err| panic!("catalogue fixture should decode: {err}"));

        let endpoints = catalog_endpoints(&catalog, "public", Some("RegionOne"));

        assert_eq!(endpoints.get(&Service::Compute).map(String::as_str), Some("http://nova/v2.1"));
        assert_eq!(endpoints.get(&Service::Volume).map(String::as_str), Some("http://cinder/v3/p"));
        assert!(!endpoints.contains_key(&Service::Image));
        assert!(!endpoints.contains_key(&Service::Network));
    }
}
