//! Boot a server and wait until it is active and powered on.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use tracing::{debug, info};

use crate::openstack::rest::{Method, RequestCache, Service};
use crate::openstack::types::{ServerId, ServerSummary, decode};
use crate::openstack::OpenstackError;
use crate::request::CreateRequest;

use super::{PollSettings, PollerKind, PollingAction};

/// Poller for a freshly submitted server.
#[derive(Clone, Debug)]
pub struct CreateServer {
    name: String,
    server_id: ServerId,
}

impl CreateServer {
    /// Resolves flavor and image, refuses duplicate names, then submits the
    /// create call with `user_data` base64-encoded.
    ///
    /// # Errors
    ///
    /// - [`OpenstackError::NotFound`] for an unknown flavor or image.
    /// - [`OpenstackError::Ambiguous`] when the name is already shared.
    /// - Request failures from the create call.
    pub async fn submit(
        rest: &mut RequestCache,
        request: &CreateRequest,
        user_data: &str,
    ) -> Result<Self, OpenstackError> {
        let flavor = rest.flavor_id(&request.flavor).await?;
        let image = rest.image_id(&request.image).await?;
        ensure_unique(rest, &request.name).await?;

        let body = json!({
            "server": {
                "name": request.name,
                "flavorRef": flavor,
                "imageRef": image,
                "user_data": STANDARD.encode(user_data),
            }
        });
        let created = rest
            .request(Service::Compute, "/servers", Some("server"), Method::Post, Some(body))
            .await?;
        let summary: ServerSummary = decode(created, "created server")?;
        info!(name = request.name, server = %summary.id, "server create submitted");
        Ok(Self {
            name: request.name.clone(),
            server_id: summary.id,
        })
    }

    /// Id allocated by the create call.
    #[must_use]
    pub const fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Waits until the server runs and returns its id.
    ///
    /// # Errors
    ///
    /// - [`OpenstackError::Ambiguous`] as soon as a second server with the
    ///   same name appears.
    /// - [`OpenstackError::Shape`] for unknown power codes.
    /// - [`OpenstackError::Timeout`] when the deadline passes.
    pub async fn wait(
        self,
        rest: &mut RequestCache,
        settings: PollSettings,
    ) -> Result<ServerId, OpenstackError> {
        let mut driver = PollingAction::new(PollerKind::CreateServer, settings);
        driver.run(async |_: Duration| self.check(rest).await).await
    }

    async fn check(&self, rest: &mut RequestCache) -> Result<Option<ServerId>, OpenstackError> {
        ensure_unique(rest, &self.name).await?;
        let server = rest.server(&self.server_id).await?;
        let power = server.power()?;
        debug!(
            server = %self.server_id,
            vm_state = server.vm_state,
            power = ?power,
            "server status"
        );
        Ok(server.is_running()?.then(|| self.server_id.clone()))
    }
}

async fn ensure_unique(rest: &mut RequestCache, name: &str) -> Result<(), OpenstackError> {
    let count = rest
        .server_list("name")
        .await?
        .iter()
        .filter(|candidate| candidate.as_str() == name)
        .count();
    if count > 1 {
        return Err(OpenstackError::Ambiguous {
            name: name.to_owned(),
            count,
        });
    }
    Ok(())
}
