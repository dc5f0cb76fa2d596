//! Map a floating address onto a server under the address lock.
//!
//! Picking a free address and assigning it is not atomic on the platform,
//! so concurrent runs serialise on a host-wide lock. The fast path (the
//! server already has an address) only needs the shared side of the lock.
//! An address counts as assigned only after two consecutive checks see it,
//! which catches an address taken over by another run between checks.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::lock::{LockMode, ProcessLock};
use crate::openstack::rest::RequestCache;
use crate::openstack::types::{AddressKind, ServerId};
use crate::openstack::OpenstackError;

use super::{PollSettings, PollerKind, PollingAction};

/// Poller for a floating address on one server.
#[derive(Clone, Debug)]
pub struct AssignFloatingIp {
    server_id: ServerId,
    network_name: String,
    external_network: String,
}

impl AssignFloatingIp {
    /// Resolves the router (named, or the first one listed) and its
    /// external network.
    ///
    /// # Errors
    ///
    /// - [`OpenstackError::NotFound`] when no matching router exists.
    /// - [`OpenstackError::Shape`] when the router has no external gateway.
    pub async fn resolve(
        rest: &mut RequestCache,
        server_id: &ServerId,
        router_name: Option<&str>,
    ) -> Result<Self, OpenstackError> {
        let routers = rest.routers().await?;
        let router = match router_name {
            Some(name) => routers.into_iter().find(|router| router.name == name),
            None => routers.into_iter().next(),
        }
        .ok_or_else(|| {
            OpenstackError::not_found(format!("router '{}'", router_name.unwrap_or("<any>")))
        })?;
        let gateway = router.external_gateway_info.ok_or_else(|| OpenstackError::Shape {
            message: format!("router '{}' has no external gateway", router.name),
        })?;
        debug!(router = router.name, network = gateway.network_id, "resolved router");
        Ok(Self {
            server_id: server_id.clone(),
            network_name: router.name,
            external_network: gateway.network_id,
        })
    }

    /// Waits until the server holds a floating address and returns it.
    ///
    /// # Errors
    ///
    /// - [`OpenstackError::LockTimeout`] when the address lock cannot be
    ///   taken within the remaining time.
    /// - [`OpenstackError::Timeout`] when assignment never sticks.
    pub async fn wait(
        self,
        rest: &mut RequestCache,
        lock: &ProcessLock,
        settings: PollSettings,
    ) -> Result<String, OpenstackError> {
        let mut driver = PollingAction::new(PollerKind::AssignFloatingIp, settings);
        driver
            .run(async |remaining: Duration| self.check(rest, lock, remaining).await)
            .await
    }

    async fn check(
        &self,
        rest: &mut RequestCache,
        lock: &ProcessLock,
        remaining: Duration,
    ) -> Result<Option<String>, OpenstackError> {
        if self.attempt(rest, lock, remaining).await?.is_none() {
            return Ok(None);
        }
        self.attempt(rest, lock, remaining).await
    }

    async fn attempt(
        &self,
        rest: &mut RequestCache,
        lock: &ProcessLock,
        remaining: Duration,
    ) -> Result<Option<String>, OpenstackError> {
        {
            let _shared = lock
                .acquire_shared_within(remaining)
                .await?
                .ok_or_else(|| lock_timeout(lock, LockMode::Shared))?;
            let server = rest.server(&self.server_id).await?;
            if let Some(address) = server.address(Some(&self.network_name), AddressKind::Floating) {
                debug!(server = %self.server_id, address, "floating address present");
                return Ok(Some(address.to_owned()));
            }
        }

        let _exclusive = lock
            .acquire_exclusive_within(remaining)
            .await?
            .ok_or_else(|| lock_timeout(lock, LockMode::Exclusive))?;
        let address = match rest.unassigned_floating_ip().await? {
            Some(address) => address,
            None => {
                let address = rest.create_floating_ip(&self.external_network).await?;
                info!(address, network = self.external_network, "allocated floating address");
                address
            }
        };
        match rest.add_floating_ip(&self.server_id, &address).await {
            Ok(()) => info!(server = %self.server_id, address, "floating address assignment submitted"),
            Err(err) => warn!(server = %self.server_id, address, error = %err, "floating address assignment failed"),
        }
        Ok(None)
    }
}

fn lock_timeout(lock: &ProcessLock, mode: LockMode) -> OpenstackError {
    OpenstackError::LockTimeout {
        path: lock.path().to_string(),
        mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeCloud;
    use tempfile::TempDir;

    fn address_lock(dir: &TempDir) -> ProcessLock {
        let path = camino::Utf8Path::from_path(dir.path())
            .unwrap_or_else(|| panic!("temp dir should be UTF-8"))
            .join("address.lock");
        ProcessLock::new(path).unwrap_or_else(|err| panic!("lock should open: {err}"))
    }

    #[tokio::test(start_paused = true)]
    async fn pool_of_one_is_never_shared() {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let lock = address_lock(&dir);
        let cloud = FakeCloud::new().with_floating_ip("9.9.9.9");
        let first = cloud.add_server("a", None);
        let second = cloud.add_server("b", None);
        let mut rest = cloud.request_cache();
        let settings = PollSettings::new(Duration::from_secs(30));

        let mut addresses = Vec::new();
        for server in [&first, &second] {
            let address = AssignFloatingIp::resolve(&mut rest, server, None)
                .await
                .unwrap_or_else(|err| panic!("router should resolve: {err}"))
                .wait(&mut rest, &lock, settings)
                .await
                .unwrap_or_else(|err| panic!("address should be assigned: {err}"));
            addresses.push(address);
        }

        assert_eq!(addresses.first().map(String::as_str), Some("9.9.9.9"));
        assert_ne!(addresses.first(), addresses.get(1));
        assert_eq!(cloud.floating_ip_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_address_is_returned_without_assignment() {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let lock = address_lock(&dir);
        let cloud = FakeCloud::new();
        let server = cloud.add_server("web1", Some("9.9.9.9"));
        let mut rest = cloud.request_cache();

        let address = AssignFloatingIp::resolve(&mut rest, &server, None)
            .await
            .unwrap_or_else(|err| panic!("router should resolve: {err}"))
            .wait(&mut rest, &lock, PollSettings::default())
            .await
            .unwrap_or_else(|err| panic!("address should be found: {err}"));

        assert_eq!(address, "9.9.9.9");
        assert!(cloud.requests().iter().all(|request| !request.path.ends_with("/action")));
    }

    #[tokio::test]
    async fn unknown_router_is_not_found() {
        let cloud = FakeCloud::new();
        let server = cloud.add_server("web1", None);
        let mut rest = cloud.request_cache();

        let err = AssignFloatingIp::resolve(&mut rest, &server, Some("nope"))
            .await
            .expect_err("router is missing");

        assert!(err.is_not_found());
    }
}
