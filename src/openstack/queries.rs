//! Resource-level helpers built on [`RequestCache::request`].

use rand::seq::SliceRandom;
use reqwest::Url;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::rest::{Method, RequestCache, Service};
use super::types::{FloatingIp, Router, Server, ServerId, ServerSummary, Volume, VolumeId, decode};
use super::OpenstackError;

impl RequestCache {
    /// Lists servers and returns the value of `key` for each one.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn server_list(&mut self, key: &str) -> Result<Vec<String>, OpenstackError> {
        self.request(Service::Compute, "/servers", Some("servers"), Method::Get, None)
            .await?;
        self.child_strings(key, None)
    }

    /// Lists servers as id/name pairs.
    ///
    /// # Errors
    ///
    /// Propagates request and decoding failures.
    pub async fn server_summaries(&mut self) -> Result<Vec<ServerSummary>, OpenstackError> {
        let listing = self
            .request(Service::Compute, "/servers", Some("servers"), Method::Get, None)
            .await?;
        decode(listing, "server listing")
    }

    /// Fetches one server's details.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::Api`] (404) when the server does not exist.
    pub async fn server(&mut self, id: &ServerId) -> Result<Server, OpenstackError> {
        let detail = self
            .request(
                Service::Compute,
                &format!("/servers/{id}"),
                Some("server"),
                Method::Get,
                None,
            )
            .await?;
        decode(detail, "server details")
    }

    /// Resolves a server name to its details through the listing.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::NotFound`] when no server carries `name`.
    pub async fn server_by_name(&mut self, name: &str) -> Result<Server, OpenstackError> {
        self.request(Service::Compute, "/servers", Some("servers"), Method::Get, None)
            .await?;
        let entry = self
            .child_search("name", name, None)
            .map_err(|err| match err {
                OpenstackError::NotFound { .. } => {
                    OpenstackError::not_found(format!("server '{name}'"))
                }
                other => other,
            })?;
        let summary: ServerSummary = decode(entry, "server listing entry")?;
        self.server(&summary.id).await
    }

    /// Requests deletion of a server and returns the ids still listed.
    ///
    /// A rejected delete is logged; the caller re-checks the listing.
    ///
    /// # Errors
    ///
    /// Propagates failures of the follow-up listing.
    pub async fn server_delete(&mut self, id: &ServerId) -> Result<Vec<String>, OpenstackError> {
        if let Err(err) = self
            .request(
                Service::Compute,
                &format!("/servers/{id}"),
                None,
                Method::Delete,
                None,
            )
            .await
        {
            warn!(server = %id, error = %err, "server delete request was rejected");
        }
        self.server_list("id").await
    }

    /// Resolves a flavor name to its id.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::NotFound`] for unknown flavors.
    pub async fn flavor_id(&mut self, name: &str) -> Result<String, OpenstackError> {
        self.request(Service::Compute, "/flavors", Some("flavors"), Method::Get, None)
            .await?;
        let flavor = self
            .child_search("name", name, None)
            .map_err(|_| OpenstackError::not_found(format!("flavor '{name}'")))?;
        id_of(&flavor, "flavor")
    }

    /// Resolves an active image name to its id.
    ///
    /// When several active images share the name the first is used.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::NotFound`] when no active image matches.
    pub async fn image_id(&mut self, name: &str) -> Result<String, OpenstackError> {
        let path = format!(
            "/v2/images?{}",
            encode_query(&[("name", name), ("status", "active")])?
        );
        let images = self
            .request(Service::Image, &path, Some("images"), Method::Get, None)
            .await?;
        let candidates = images.as_array().map(Vec::as_slice).unwrap_or_default();
        if candidates.len() > 1 {
            warn!(image = name, count = candidates.len(), "multiple active images share this name");
        }
        let image = candidates
            .first()
            .ok_or_else(|| OpenstackError::not_found(format!("active image '{name}'")))?;
        id_of(image, "image")
    }

    /// Lists routers.
    ///
    /// # Errors
    ///
    /// Propagates request and decoding failures.
    pub async fn routers(&mut self) -> Result<Vec<Router>, OpenstackError> {
        let routers = self
            .request(Service::Network, "/v2.0/routers", Some("routers"), Method::Get, None)
            .await?;
        decode(routers, "router listing")
    }

    /// Picks a random unassigned floating address, if any.
    ///
    /// # Errors
    ///
    /// Propagates request and decoding failures.
    pub async fn unassigned_floating_ip(&mut self) -> Result<Option<String>, OpenstackError> {
        let listing = self
            .request(
                Service::Network,
                "/v2.0/floatingips",
                Some("floatingips"),
                Method::Get,
                None,
            )
            .await?;
        let addresses: Vec<FloatingIp> = decode(listing, "floating ip listing")?;
        let free: Vec<&FloatingIp> = addresses.iter().filter(|ip| ip.is_unassigned()).collect();
        debug!(free = free.len(), total = addresses.len(), "floating ip pool");
        Ok(free
            .choose(&mut rand::thread_rng())
            .map(|ip| ip.floating_ip_address.clone()))
    }

    /// Allocates a new floating address on `network_id`.
    ///
    /// # Errors
    ///
    /// Propagates request and decoding failures.
    pub async fn create_floating_ip(&mut self, network_id: &str) -> Result<String, OpenstackError> {
        let created = self
            .request(
                Service::Network,
                "/v2.0/floatingips",
                Some("floatingip"),
                Method::Post,
                Some(json!({"floatingip": {"floating_network_id": network_id}})),
            )
            .await?;
        let address: FloatingIp = decode(created, "allocated floating ip")?;
        Ok(address.floating_ip_address)
    }

    /// Asks the platform to map `address` onto a server.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn add_floating_ip(
        &mut self,
        server: &ServerId,
        address: &str,
    ) -> Result<(), OpenstackError> {
        self.request(
            Service::Compute,
            &format!("/servers/{server}/action"),
            None,
            Method::Post,
            Some(json!({"addFloatingIp": {"address": address}})),
        )
        .await
        .map(drop)
    }

    /// Lists volume ids.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn volume_list(&mut self) -> Result<Vec<VolumeId>, OpenstackError> {
        self.request(Service::Volume, "/volumes", Some("volumes"), Method::Get, None)
            .await?;
        Ok(self
            .child_strings("id", None)?
            .into_iter()
            .map(VolumeId::from)
            .collect())
    }

    /// Fetches one volume's details.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::Api`] (404) when the volume does not exist.
    pub async fn volume(&mut self, id: &VolumeId) -> Result<Volume, OpenstackError> {
        let detail = self
            .request(
                Service::Volume,
                &format!("/volumes/{id}"),
                Some("volume"),
                Method::Get,
                None,
            )
            .await?;
        decode(detail, "volume details")
    }

    /// Creates a volume named after `server` and scheduled on its host.
    ///
    /// # Errors
    ///
    /// Propagates request and decoding failures.
    pub async fn create_volume(
        &mut self,
        server: &ServerId,
        size_gb: u32,
        description: &str,
    ) -> Result<VolumeId, OpenstackError> {
        let body = json!({
            "volume": {
                "size": size_gb,
                "name": server.as_str(),
                "multiattach": false,
                "description": description,
            },
            "OS-SCH-HNT:scheduler_hints": {"same_host": [server.as_str()]},
        });
        let created = self
            .request(Service::Volume, "/volumes", Some("volume"), Method::Post, Some(body))
            .await?;
        let volume: Volume = decode(created, "created volume")?;
        Ok(volume.id)
    }

    /// Requests deletion of a volume.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn delete_volume(&mut self, id: &VolumeId) -> Result<(), OpenstackError> {
        self.request(
            Service::Volume,
            &format!("/volumes/{id}"),
            None,
            Method::Delete,
            None,
        )
        .await
        .map(drop)
    }

    /// Requests attachment of a volume to a server.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn attach_volume(
        &mut self,
        server: &ServerId,
        volume: &VolumeId,
    ) -> Result<(), OpenstackError> {
        self.request(
            Service::Compute,
            &format!("/servers/{server}/os-volume_attachments"),
            None,
            Method::Post,
            Some(json!({"volumeAttachment": {"volumeId": volume.as_str()}})),
        )
        .await
        .map(drop)
    }

    /// Requests detachment of a volume from a server.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn detach_volume(
        &mut self,
        server: &ServerId,
        volume: &VolumeId,
    ) -> Result<(), OpenstackError> {
        self.request(
            Service::Compute,
            &format!("/servers/{server}/os-volume_attachments/{volume}"),
            None,
            Method::Delete,
            None,
        )
        .await
        .map(drop)
    }
}

fn id_of(entry: &Value, what: &str) -> Result<String, OpenstackError> {
    entry
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| OpenstackError::Shape {
            message: format!("{what} entry has no id"),
        })
}

/// Never requested; only lends [`Url`] its form encoder.
const QUERY_BASE: &str = "http://query.invalid/";

/// Renders `pairs` as an `application/x-www-form-urlencoded` query string.
fn encode_query(pairs: &[(&str, &str)]) -> Result<String, OpenstackError> {
    let url = Url::parse_with_params(QUERY_BASE, pairs)
        .map_err(|err| OpenstackError::Usage(format!("cannot encode query: {err}")))?;
    Ok(url.query().unwrap_or_default().to_owned())
}
