//! Orchestrates discovery, creation, and teardown of a single VM.
//!
//! The provisioner owns the request cache and the host-wide address lock
//! for one run. Creation is leak-free: any failure after the server id has
//! been allocated triggers a best-effort teardown before the original error
//! is returned.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{error, info, warn};

use crate::lock::{LockMode, ProcessLock};
use crate::openstack::types::{ServerSummary, VolumeId};
use crate::openstack::{
    AddressKind, AssignFloatingIp, AttachVolume, CreateServer, DeleteServer, DeleteVolume,
    OpenstackError, PollSettings, RequestCache, ServerId,
};
use crate::output::HostDescription;
use crate::request::{CreateRequest, ServerLookup};
use crate::userdata::{load_public_keys, render_user_data};

/// Operation requested by the caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Invocation {
    /// Report the VM, creating it when absent.
    DiscoverCreate(CreateRequest),
    /// Create the VM, refusing when it already exists.
    ExclusiveCreate(CreateRequest),
    /// Remove the VM and its volumes.
    Destroy(ServerLookup),
}

impl Invocation {
    /// Stable operation name, also used to name API dumps.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::DiscoverCreate(_) => "discover_create",
            Self::ExclusiveCreate(_) => "exclusive_create",
            Self::Destroy(_) => "destroy",
        }
    }
}

/// Result of a successful [`Invocation`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// An existing VM was found.
    Found(HostDescription),
    /// A new VM was created.
    Created(HostDescription),
    /// Exclusive creation found an existing VM and did nothing.
    Refused(HostDescription),
    /// The VM is gone, whether or not it existed.
    Destroyed,
}

impl Outcome {
    /// Document to print, for outcomes that produce one.
    #[must_use]
    pub const fn host(&self) -> Option<&HostDescription> {
        match self {
            Self::Found(host) | Self::Created(host) => Some(host),
            Self::Refused(_) | Self::Destroyed => None,
        }
    }
}

/// Drives the pollers for one run.
pub struct Provisioner {
    rest: RequestCache,
    address_lock: ProcessLock,
    settings: PollSettings,
}

impl fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provisioner")
            .field("rest", &self.rest)
            .field("address_lock", &self.address_lock.path())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Provisioner {
    /// Creates a provisioner over `rest`, serialising address assignment
    /// on `address_lock`.
    #[must_use]
    pub const fn new(rest: RequestCache, address_lock: ProcessLock, settings: PollSettings) -> Self {
        Self {
            rest,
            address_lock,
            settings,
        }
    }

    /// Request history accumulated so far.
    #[must_use]
    pub const fn rest(&self) -> &RequestCache {
        &self.rest
    }

    /// Runs `invocation`.
    ///
    /// # Errors
    ///
    /// Propagates errors from discovery, creation, or teardown. A missing VM
    /// during the create operations is not an error; it triggers creation.
    pub async fn execute(&mut self, invocation: &Invocation) -> Result<Outcome, OpenstackError> {
        match invocation {
            Invocation::DiscoverCreate(request) => {
                match self.discover_for(request).await {
                    Ok(host) => Ok(Outcome::Found(host)),
                    Err(err) if err.is_not_found() => {
                        warn!(name = request.name, "no existing VM; creating one");
                        self.create(request).await.map(Outcome::Created)
                    }
                    Err(err) => Err(err),
                }
            }
            Invocation::ExclusiveCreate(request) => match self.discover_for(request).await {
                Ok(host) => {
                    error!(name = request.name, address = host.ansible_host, "VM already exists; refusing to create");
                    Ok(Outcome::Refused(host))
                }
                Err(err) if err.is_not_found() => self.create(request).await.map(Outcome::Created),
                Err(err) => Err(err),
            },
            Invocation::Destroy(lookup) => self.destroy(lookup).await.map(|()| Outcome::Destroyed),
        }
    }

    async fn discover_for(&mut self, request: &CreateRequest) -> Result<HostDescription, OpenstackError> {
        self.discover(&request.lookup(), request.router_name.as_deref(), request.private)
            .await
    }

    /// Describes the single server matching `lookup`.
    ///
    /// The fixed address is reported when `private`, else the floating one,
    /// looked up on the network named after `router_name` or on the first
    /// network when none is named.
    ///
    /// # Errors
    ///
    /// - [`OpenstackError::NotFound`] when nothing matches.
    /// - [`OpenstackError::Ambiguous`] when several servers share the name.
    /// - [`OpenstackError::MissingAddress`] when the server lacks the address.
    pub async fn discover(
        &mut self,
        lookup: &ServerLookup,
        router_name: Option<&str>,
        private: bool,
    ) -> Result<HostDescription, OpenstackError> {
        let servers = self.rest.server_summaries().await?;
        let target = select(&servers, lookup)?;
        let server = self.rest.server(&target.id).await?;
        let kind = if private {
            AddressKind::Fixed
        } else {
            AddressKind::Floating
        };
        let address = server
            .address(router_name, kind)
            .ok_or_else(|| OpenstackError::MissingAddress {
                server: server.id.to_string(),
                kind: kind.to_string(),
                network: router_name.unwrap_or("<first>").to_owned(),
            })?;
        info!(name = server.name, server = %server.id, address, "discovered VM");
        Ok(HostDescription::new(address, server.id.as_str(), server.name.as_str()))
    }

    /// Creates the VM described by `request` and reports it.
    ///
    /// # Errors
    ///
    /// Returns the first failure; teardown failures during cleanup are only
    /// logged.
    pub async fn create(&mut self, request: &CreateRequest) -> Result<HostDescription, OpenstackError> {
        let keys = load_public_keys(&request.public_key_files)?;
        let user_data = render_user_data(&keys, request.userdata_template.as_deref())?;

        let mut allocated = None;
        let result = self.create_steps(request, &user_data, &mut allocated).await;
        let Err(err) = result else {
            return result;
        };

        error!(name = request.name, error = %err, "create failed");
        if let Some(id) = allocated {
            warn!(server = %id, "destroying partially created VM");
            if let Err(cleanup) = self.destroy(&ServerLookup::by_id(id)).await {
                warn!(error = %cleanup, "cleanup after failed create also failed");
            }
        }
        Err(err)
    }

    async fn create_steps(
        &mut self,
        request: &CreateRequest,
        user_data: &str,
        allocated: &mut Option<ServerId>,
    ) -> Result<HostDescription, OpenstackError> {
        let poller = CreateServer::submit(&mut self.rest, request, user_data).await?;
        *allocated = Some(poller.server_id().clone());
        let server_id = poller.wait(&mut self.rest, self.settings).await?;
        info!(name = request.name, server = %server_id, "server is running");

        if let Some(size) = request.volume_size_gb {
            let volume = AttachVolume::submit(&mut self.rest, &request.name, &server_id, size)
                .await?
                .wait(&mut self.rest, self.settings)
                .await?;
            info!(server = %server_id, volume = %volume, "volume attached");
        }

        if !request.private {
            let _exclusive = self
                .address_lock
                .acquire_exclusive_within(self.settings.timeout())
                .await?
                .ok_or_else(|| OpenstackError::LockTimeout {
                    path: self.address_lock.path().to_string(),
                    mode: LockMode::Exclusive,
                })?;
            let address = AssignFloatingIp::resolve(&mut self.rest, &server_id, request.router_name.as_deref())
                .await?
                .wait(&mut self.rest, &self.address_lock, self.settings)
                .await?;
            info!(server = %server_id, address, "floating address assigned");
        }

        self.discover(
            &request.lookup().with_id(server_id),
            request.router_name.as_deref(),
            request.private,
        )
        .await
    }

    /// Removes the server matching `lookup` and every volume that belongs
    /// to it. Succeeds without side effects when no server matches by name;
    /// a known id whose server is gone still has its volumes swept.
    ///
    /// # Errors
    ///
    /// - [`OpenstackError::Ambiguous`] when several servers share the name.
    /// - Poller failures from server or volume deletion.
    pub async fn destroy(&mut self, lookup: &ServerLookup) -> Result<(), OpenstackError> {
        let server_id = match (lookup.id(), lookup.name()) {
            (Some(id), _) => id.clone(),
            (None, Some(_)) => {
                let servers = self.rest.server_summaries().await?;
                match select(&servers, lookup) {
                    Ok(summary) => summary.id.clone(),
                    Err(err) if err.is_not_found() => {
                        info!(target = lookup.describe(), "nothing to destroy");
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
            }
            (None, None) => {
                return Err(OpenstackError::Usage(String::from(
                    "destroy needs a server name or id",
                )));
            }
        };

        let server = match self.rest.server(&server_id).await {
            Ok(server) => server,
            Err(err) if err.api_status() == Some(404) => {
                info!(server = %server_id, "server already gone; sweeping its volumes");
                return self.destroy_volumes(Vec::new(), &server_id).await;
            }
            Err(err) => return Err(err),
        };
        let attached = server.attached_volume_ids();

        DeleteServer::submit(&mut self.rest, &server_id)
            .await?
            .wait(&mut self.rest, self.settings)
            .await?;
        info!(server = %server_id, "server deleted");

        self.destroy_volumes(attached, &server_id).await
    }

    async fn destroy_volumes(
        &mut self,
        attached: Vec<VolumeId>,
        server_id: &ServerId,
    ) -> Result<(), OpenstackError> {
        let mut targets: BTreeSet<VolumeId> = attached.into_iter().collect();
        match self.rest.volume_list().await {
            Ok(listed) => {
                for volume_id in listed {
                    if targets.contains(&volume_id) {
                        continue;
                    }
                    match self.rest.volume(&volume_id).await {
                        Ok(volume) if volume.name.as_deref() == Some(server_id.as_str()) => {
                            info!(volume = %volume_id, "found orphaned volume");
                            targets.insert(volume_id);
                        }
                        Ok(_) => {}
                        Err(err) => warn!(volume = %volume_id, error = %err, "skipping unreadable volume"),
                    }
                }
            }
            Err(err) => warn!(error = %err, "cannot list volumes; orphan sweep skipped"),
        }

        for volume_id in targets {
            DeleteVolume::new(volume_id)
                .wait(&mut self.rest, self.settings)
                .await?;
        }
        Ok(())
    }
}

fn select<'a>(servers: &'a [ServerSummary], lookup: &ServerLookup) -> Result<&'a ServerSummary, OpenstackError> {
    if let Some(name) = lookup.name() {
        let matches: Vec<&ServerSummary> = servers.iter().filter(|server| server.name == name).collect();
        return match matches.as_slice() {
            [] => Err(OpenstackError::not_found(lookup.describe())),
            [only] => match lookup.id() {
                Some(id) if &only.id != id => Err(OpenstackError::not_found(lookup.describe())),
                _ => Ok(*only),
            },
            several => Err(OpenstackError::Ambiguous {
                name: name.to_owned(),
                count: several.len(),
            }),
        };
    }
    lookup
        .id()
        .and_then(|id| servers.iter().find(|server| &server.id == id))
        .ok_or_else(|| OpenstackError::not_found(lookup.describe()))
}

#[cfg(test)]
mod tests;
