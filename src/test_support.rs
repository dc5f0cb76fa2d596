//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeCloud`] is an in-memory platform speaking the subset of the
//! compute, volume, network, and image APIs the provisioner uses. State
//! transitions that take time on a real cloud are driven by request counts
//! so tests stay deterministic. [`ReplaySession`] serves a recorded API dump
//! back in order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Url;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::openstack::rest::{
    Method, RawResponse, Service, Session, SessionFuture, SessionMap,
};
use crate::openstack::{OpenstackError, RequestCache, ServerId, VolumeId};

/// Name of the router every [`FakeCloud`] starts with.
pub const DEFAULT_ROUTER: &str = "public-router";
/// External network behind [`DEFAULT_ROUTER`].
pub const DEFAULT_EXTERNAL_NETWORK: &str = "ext-net";

const FAKE_BASE_URL: &str = "http://fake";

/// One request received by a [`FakeCloud`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    /// Verb used.
    pub method: Method,
    /// Service-relative path, query string included.
    pub path: String,
    /// JSON body, when one was sent.
    pub body: Option<Value>,
}

#[derive(Debug)]
struct FakeServer {
    id: ServerId,
    name: String,
    building_for: u32,
    fixed: Option<String>,
    floating: Option<String>,
    pending_floating: Option<(String, u32)>,
    volumes: Vec<VolumeId>,
    user_data: Option<String>,
    deleted: bool,
}

#[derive(Debug)]
struct FakeVolume {
    id: VolumeId,
    name: String,
    status: String,
    attached_to: Vec<ServerId>,
    pending_attach: Option<(ServerId, u32)>,
    vanish_after: Option<u32>,
}

#[derive(Debug)]
struct FakeFloatingIp {
    address: String,
    server: Option<ServerId>,
}

#[derive(Debug, Default)]
struct Behaviour {
    active_after: u32,
    attach_after: u32,
    assign_after: u32,
    duplicate_after: Option<u32>,
    fail_volume_create: bool,
    fail_floating_ip_assign: bool,
    without_fixed_addresses: bool,
}

#[derive(Debug, Default)]
struct CloudState {
    flavors: Vec<String>,
    images: Vec<String>,
    routers: Vec<(String, Option<String>)>,
    servers: Vec<FakeServer>,
    volumes: Vec<FakeVolume>,
    floating_ips: Vec<FakeFloatingIp>,
    behaviour: Behaviour,
    pending_duplicate: Option<(String, u32)>,
    fixed_counter: u32,
    floating_counter: u32,
    requests: Vec<RecordedRequest>,
}

type Reply = (u16, Value);

/// In-memory cloud implementing [`Session`] for every service.
///
/// Clones share state, so a test keeps one handle for assertions while the
/// provisioner drives another through its sessions.
#[derive(Clone, Debug)]
pub struct FakeCloud {
    state: Arc<Mutex<CloudState>>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloud {
    /// Creates an empty cloud with [`DEFAULT_ROUTER`] in place.
    ///
    /// Servers become active, volumes attach, and floating addresses appear
    /// as soon as they are requested unless configured otherwise.
    #[must_use]
    pub fn new() -> Self {
        let state = CloudState {
            routers: vec![(
                DEFAULT_ROUTER.to_owned(),
                Some(DEFAULT_EXTERNAL_NETWORK.to_owned()),
            )],
            ..CloudState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a flavor.
    #[must_use]
    pub fn with_flavor(self, name: &str) -> Self {
        self.state().flavors.push(name.to_owned());
        self
    }

    /// Adds an active image.
    #[must_use]
    pub fn with_image(self, name: &str) -> Self {
        self.state().images.push(name.to_owned());
        self
    }

    /// Adds a router, optionally gatewayed to `external_network`.
    #[must_use]
    pub fn with_router(self, name: &str, external_network: Option<&str>) -> Self {
        self.state()
            .routers
            .push((name.to_owned(), external_network.map(str::to_owned)));
        self
    }

    /// Adds an unassigned floating address to the pool.
    #[must_use]
    pub fn with_floating_ip(self, address: &str) -> Self {
        self.state().floating_ips.push(FakeFloatingIp {
            address: address.to_owned(),
            server: None,
        });
        self
    }

    /// New servers report `building`, with no power state, for `gets`
    /// detail requests.
    #[must_use]
    pub fn server_active_after(self, gets: u32) -> Self {
        self.state().behaviour.active_after = gets;
        self
    }

    /// Requested attachments appear after `gets` volume detail requests.
    #[must_use]
    pub fn volume_attach_after(self, gets: u32) -> Self {
        self.state().behaviour.attach_after = gets;
        self
    }

    /// Assigned floating addresses appear after `gets` server detail
    /// requests.
    #[must_use]
    pub fn address_assign_after(self, gets: u32) -> Self {
        self.state().behaviour.assign_after = gets;
        self
    }

    /// A competing server with the same name appears `listings` server
    /// listings after each create.
    #[must_use]
    pub fn duplicate_name_after(self, listings: u32) -> Self {
        self.state().behaviour.duplicate_after = Some(listings);
        self
    }

    /// Volume creation is refused with a server error.
    #[must_use]
    pub fn fail_volume_create(self) -> Self {
        self.state().behaviour.fail_volume_create = true;
        self
    }

    /// Floating address assignment is always refused.
    #[must_use]
    pub fn fail_floating_ip_assign(self) -> Self {
        self.state().behaviour.fail_floating_ip_assign = true;
        self
    }

    /// New servers get no fixed address.
    #[must_use]
    pub fn without_fixed_addresses(self) -> Self {
        self.state().behaviour.without_fixed_addresses = true;
        self
    }

    /// Adds an active server, with `floating` already mapped when given.
    pub fn add_server(&self, name: &str, floating: Option<&str>) -> ServerId {
        let mut state = self.state();
        let id = ServerId::new(Uuid::new_v4().to_string());
        let fixed = state.next_fixed_address();
        if let Some(address) = floating {
            state.floating_ips.push(FakeFloatingIp {
                address: address.to_owned(),
                server: Some(id.clone()),
            });
        }
        state.servers.push(FakeServer {
            id: id.clone(),
            name: name.to_owned(),
            building_for: 0,
            fixed,
            floating: floating.map(str::to_owned),
            pending_floating: None,
            volumes: Vec::new(),
            user_data: None,
            deleted: false,
        });
        id
    }

    /// Adds a volume, attached to `server` when given.
    ///
    /// The server need not exist, which models a volume left pointing at a
    /// server that is already gone.
    pub fn add_volume(&self, name: &str, attached_to: Option<&ServerId>) -> VolumeId {
        let mut state = self.state();
        let id = VolumeId::new(Uuid::new_v4().to_string());
        if let Some(server_id) = attached_to
            && let Some(server) = state.server_mut(server_id)
        {
            server.volumes.push(id.clone());
        }
        state.volumes.push(FakeVolume {
            id: id.clone(),
            name: name.to_owned(),
            status: String::from(if attached_to.is_some() { "in-use" } else { "available" }),
            attached_to: attached_to.into_iter().cloned().collect(),
            pending_attach: None,
            vanish_after: None,
        });
        id
    }

    /// Removes `volume` after it has been served `gets` more times.
    pub fn vanish_volume_after(&self, volume: &VolumeId, gets: u32) {
        if let Some(entry) = self.state().volume_mut(volume) {
            entry.vanish_after = Some(gets);
        }
    }

    /// Number of live servers called `name`.
    #[must_use]
    pub fn servers_named(&self, name: &str) -> usize {
        self.state()
            .servers
            .iter()
            .filter(|server| !server.deleted && server.name == name)
            .count()
    }

    /// Names of live servers in creation order.
    #[must_use]
    pub fn server_names(&self) -> Vec<String> {
        self.state()
            .servers
            .iter()
            .filter(|server| !server.deleted)
            .map(|server| server.name.clone())
            .collect()
    }

    /// Ids of volumes that still exist.
    #[must_use]
    pub fn volume_ids(&self) -> Vec<VolumeId> {
        self.state()
            .volumes
            .iter()
            .filter(|volume| volume.status != "deleting")
            .map(|volume| volume.id.clone())
            .collect()
    }

    /// Volumes attached to `server`.
    #[must_use]
    pub fn volumes_attached_to(&self, server: &ServerId) -> Vec<VolumeId> {
        self.state()
            .servers
            .iter()
            .find(|entry| &entry.id == server)
            .map(|entry| entry.volumes.clone())
            .unwrap_or_default()
    }

    /// Size of the floating address pool, assigned or not.
    #[must_use]
    pub fn floating_ip_count(&self) -> usize {
        self.state().floating_ips.len()
    }

    /// Decoded user data submitted for the server called `name`.
    #[must_use]
    pub fn user_data(&self, name: &str) -> Option<String> {
        self.state()
            .servers
            .iter()
            .find(|server| server.name == name)
            .and_then(|server| server.user_data.clone())
    }

    /// Every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    /// Requests other than reads.
    #[must_use]
    pub fn mutations(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.method != Method::Get)
            .collect()
    }

    /// One session per service, all backed by this cloud.
    #[must_use]
    pub fn sessions(&self) -> SessionMap {
        let mut sessions = SessionMap::new();
        for service in Service::ALL {
            sessions.insert(service, Box::new(self.clone()));
        }
        sessions
    }

    /// Request cache over [`Self::sessions`].
    #[must_use]
    pub fn request_cache(&self) -> RequestCache {
        RequestCache::new(self.sessions())
    }

    fn handle(&self, method: Method, path: &str, body: Option<&Value>) -> RawResponse {
        let mut state = self.state();
        state.requests.push(RecordedRequest {
            method,
            path: path.to_owned(),
            body: body.cloned(),
        });
        let (status, reply) = state.route(method, path, body);
        RawResponse {
            url: format!("{FAKE_BASE_URL}{path}"),
            status,
            body: if reply.is_null() {
                String::new()
            } else {
                reply.to_string()
            },
        }
    }
}

impl Session for FakeCloud {
    fn send<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        body: Option<&'a Value>,
    ) -> SessionFuture<'a> {
        let response = self.handle(method, path, body);
        Box::pin(async move { Ok::<_, OpenstackError>(response) })
    }
}

fn not_found(what: &str) -> Reply {
    (404, json!({"itemNotFound": {"code": 404, "message": format!("{what} could not be found")}}))
}

fn bad_request(message: &str) -> Reply {
    (400, json!({"badRequest": {"code": 400, "message": message}}))
}

fn count_down(counter: &mut u32) -> bool {
    *counter = counter.saturating_sub(1);
    *counter == 0
}

impl CloudState {
    fn route(&mut self, method: Method, path: &str, body: Option<&Value>) -> Reply {
        let (route, query) = path.split_once('?').unwrap_or((path, ""));
        let segments: Vec<&str> = route.trim_start_matches('/').split('/').collect();
        match (method, segments.as_slice()) {
            (Method::Get, ["servers"]) => self.list_servers(),
            (Method::Post, ["servers"]) => self.create_server(body),
            (Method::Get, ["servers", id]) => self.show_server(&ServerId::from(*id)),
            (Method::Delete, ["servers", id]) => self.delete_server(&ServerId::from(*id)),
            (Method::Post, ["servers", id, "action"]) => {
                self.server_action(&ServerId::from(*id), body)
            }
            (Method::Post, ["servers", id, "os-volume_attachments"]) => {
                self.attach(&ServerId::from(*id), body)
            }
            (Method::Delete, ["servers", id, "os-volume_attachments", volume]) => {
                self.detach(&ServerId::from(*id), &VolumeId::from(*volume))
            }
            (Method::Get, ["flavors"]) => (200, self.list_flavors()),
            (Method::Get, ["v2", "images"]) => (200, self.list_images(query)),
            (Method::Get, ["v2.0", "routers"]) => (200, self.list_routers()),
            (Method::Get, ["v2.0", "floatingips"]) => (200, self.list_floating_ips()),
            (Method::Post, ["v2.0", "floatingips"]) => self.create_floating_ip(),
            (Method::Get, ["volumes"]) => self.list_volumes(),
            (Method::Post, ["volumes"]) => self.create_volume(body),
            (Method::Get, ["volumes", id]) => self.show_volume(&VolumeId::from(*id)),
            (Method::Delete, ["volumes", id]) => self.delete_volume(&VolumeId::from(*id)),
            _ => not_found(route),
        }
    }

    fn next_fixed_address(&mut self) -> Option<String> {
        if self.behaviour.without_fixed_addresses {
            return None;
        }
        self.fixed_counter += 1;
        Some(format!("10.0.0.{}", self.fixed_counter))
    }

    fn server_mut(&mut self, id: &ServerId) -> Option<&mut FakeServer> {
        self.servers.iter_mut().find(|server| &server.id == id)
    }

    fn volume_mut(&mut self, id: &VolumeId) -> Option<&mut FakeVolume> {
        self.volumes.iter_mut().find(|volume| &volume.id == id)
    }

    fn network_key(&self) -> String {
        self.routers
            .first()
            .map_or_else(|| DEFAULT_ROUTER.to_owned(), |(name, _)| name.clone())
    }

    fn reap_servers(&mut self) {
        let (gone, kept): (Vec<FakeServer>, Vec<FakeServer>) =
            std::mem::take(&mut self.servers)
                .into_iter()
                .partition(|server| server.deleted);
        self.servers = kept;
        for server in gone {
            for volume in &mut self.volumes {
                volume.attached_to.retain(|id| id != &server.id);
                if volume.attached_to.is_empty() && volume.status == "in-use" {
                    volume.status = String::from("available");
                }
            }
            for address in &mut self.floating_ips {
                if address.server.as_ref() == Some(&server.id) {
                    address.server = None;
                }
            }
        }
    }

    fn reap_volumes(&mut self) {
        self.volumes.retain(|volume| volume.status != "deleting");
    }

    fn list_servers(&mut self) -> Reply {
        self.reap_servers();
        if let Some((name, mut listings)) = self.pending_duplicate.take() {
            if count_down(&mut listings) {
                let fixed = self.next_fixed_address();
                self.servers.push(FakeServer {
                    id: ServerId::new(Uuid::new_v4().to_string()),
                    name,
                    building_for: 0,
                    fixed,
                    floating: None,
                    pending_floating: None,
                    volumes: Vec::new(),
                    user_data: None,
                    deleted: false,
                });
            } else {
                self.pending_duplicate = Some((name, listings));
            }
        }
        let servers: Vec<Value> = self
            .servers
            .iter()
            .map(|server| json!({"id": server.id.as_str(), "name": server.name}))
            .collect();
        (200, json!({"servers": servers}))
    }

    fn create_server(&mut self, body: Option<&Value>) -> Reply {
        let Some(name) = body
            .and_then(|value| value.pointer("/server/name"))
            .and_then(Value::as_str)
        else {
            return bad_request("server name is required");
        };
        let user_data = body
            .and_then(|value| value.pointer("/server/user_data"))
            .and_then(Value::as_str)
            .and_then(|encoded| STANDARD.decode(encoded).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok());
        let id = ServerId::new(Uuid::new_v4().to_string());
        let fixed = self.next_fixed_address();
        self.servers.push(FakeServer {
            id: id.clone(),
            name: name.to_owned(),
            building_for: self.behaviour.active_after,
            fixed,
            floating: None,
            pending_floating: None,
            volumes: Vec::new(),
            user_data,
            deleted: false,
        });
        if let Some(listings) = self.behaviour.duplicate_after {
            self.pending_duplicate = Some((name.to_owned(), listings));
        }
        (202, json!({"server": {"id": id.as_str(), "name": name}}))
    }

    fn show_server(&mut self, id: &ServerId) -> Reply {
        let network = self.network_key();
        let Some(server) = self.server_mut(id) else {
            return not_found(&format!("server {id}"));
        };
        if server.building_for > 0 {
            count_down(&mut server.building_for);
        }
        if let Some((address, mut gets)) = server.pending_floating.take() {
            if count_down(&mut gets) {
                server.floating = Some(address);
            } else {
                server.pending_floating = Some((address, gets));
            }
        }

        let mut interfaces = Vec::new();
        if let Some(address) = &server.fixed {
            interfaces.push(json!({"addr": address, "OS-EXT-IPS:type": "fixed"}));
        }
        if let Some(address) = &server.floating {
            interfaces.push(json!({"addr": address, "OS-EXT-IPS:type": "floating"}));
        }
        let mut addresses = Map::new();
        if !interfaces.is_empty() {
            addresses.insert(network, Value::Array(interfaces));
        }
        let (vm_state, power_state) = if server.deleted {
            ("deleted", Some(0))
        } else if server.building_for > 0 {
            ("building", None::<u8>)
        } else {
            ("active", Some(1))
        };
        let volumes: Vec<Value> = server
            .volumes
            .iter()
            .map(|volume| json!({"id": volume.as_str()}))
            .collect();
        (
            200,
            json!({"server": {
                "id": server.id.as_str(),
                "name": server.name,
                "OS-EXT-STS:vm_state": vm_state,
                "OS-EXT-STS:power_state": power_state,
                "addresses": addresses,
                "os-extended-volumes:volumes_attached": volumes,
            }}),
        )
    }

    fn delete_server(&mut self, id: &ServerId) -> Reply {
        match self.server_mut(id) {
            Some(server) => {
                server.deleted = true;
                (204, Value::Null)
            }
            None => not_found(&format!("server {id}")),
        }
    }

    fn server_action(&mut self, id: &ServerId, body: Option<&Value>) -> Reply {
        let Some(address) = body
            .and_then(|value| value.pointer("/addFloatingIp/address"))
            .and_then(Value::as_str)
            .map(str::to_owned)
        else {
            return bad_request("unsupported server action");
        };
        if self.server_mut(id).is_none() {
            return not_found(&format!("server {id}"));
        }
        if self.behaviour.fail_floating_ip_assign {
            return (409, json!({"conflictingRequest": {"code": 409, "message": "floating ip assignment refused"}}));
        }
        let Some(entry) = self
            .floating_ips
            .iter_mut()
            .find(|entry| entry.address == address)
        else {
            return not_found(&format!("floating ip {address}"));
        };
        if entry.server.as_ref().is_some_and(|owner| owner != id) {
            return (409, json!({"conflictingRequest": {"code": 409, "message": format!("{address} is already associated")}}));
        }
        entry.server = Some(id.clone());
        let gets = self.behaviour.assign_after;
        if let Some(server) = self.server_mut(id) {
            if gets == 0 {
                server.floating = Some(address);
            } else {
                server.pending_floating = Some((address, gets));
            }
        }
        (202, Value::Null)
    }

    fn attach(&mut self, server_id: &ServerId, body: Option<&Value>) -> Reply {
        let Some(volume_id) = body
            .and_then(|value| value.pointer("/volumeAttachment/volumeId"))
            .and_then(Value::as_str)
            .map(VolumeId::from)
        else {
            return bad_request("volumeId is required");
        };
        if self.server_mut(server_id).is_none() {
            return not_found(&format!("server {server_id}"));
        }
        let gets = self.behaviour.attach_after;
        let Some(volume) = self.volume_mut(&volume_id) else {
            return not_found(&format!("volume {volume_id}"));
        };
        if volume.status != "available" {
            return bad_request(&format!("volume {volume_id} is {}", volume.status));
        }
        volume.status = String::from("attaching");
        volume.pending_attach = Some((server_id.clone(), gets));
        if gets == 0 {
            self.complete_attach(&volume_id);
        }
        (
            200,
            json!({"volumeAttachment": {"serverId": server_id.as_str(), "volumeId": volume_id.as_str()}}),
        )
    }

    fn complete_attach(&mut self, volume_id: &VolumeId) {
        let Some(volume) = self.volume_mut(volume_id) else {
            return;
        };
        let Some((server_id, _)) = volume.pending_attach.take() else {
            return;
        };
        volume.status = String::from("in-use");
        volume.attached_to.push(server_id.clone());
        if let Some(server) = self.server_mut(&server_id) {
            server.volumes.push(volume_id.clone());
        }
    }

    fn detach(&mut self, server_id: &ServerId, volume_id: &VolumeId) -> Reply {
        let Some(server) = self.server_mut(server_id) else {
            return not_found(&format!("server {server_id}"));
        };
        if !server.volumes.contains(volume_id) {
            return not_found(&format!("attachment of {volume_id}"));
        }
        server.volumes.retain(|id| id != volume_id);
        if let Some(volume) = self.volume_mut(volume_id) {
            volume.attached_to.retain(|id| id != server_id);
            if volume.attached_to.is_empty() {
                volume.status = String::from("available");
            }
        }
        (202, Value::Null)
    }

    fn list_flavors(&self) -> Value {
        let flavors: Vec<Value> = self
            .flavors
            .iter()
            .map(|name| json!({"id": format!("flavor-{name}"), "name": name}))
            .collect();
        json!({"flavors": flavors})
    }

    fn list_images(&self, query: &str) -> Value {
        let wanted = Url::parse(&format!("http://fake/?{query}"))
            .ok()
            .and_then(|url| {
                url.query_pairs()
                    .find(|(key, _)| key == "name")
                    .map(|(_, value)| value.into_owned())
            });
        let images: Vec<Value> = self
            .images
            .iter()
            .filter(|name| wanted.as_deref().is_none_or(|expected| expected == name.as_str()))
            .map(|name| json!({"id": format!("image-{name}"), "name": name, "status": "active"}))
            .collect();
        json!({"images": images})
    }

    fn list_routers(&self) -> Value {
        let routers: Vec<Value> = self
            .routers
            .iter()
            .map(|(name, network)| {
                let gateway = network
                    .as_ref()
                    .map_or(Value::Null, |id| json!({"network_id": id}));
                json!({"name": name, "external_gateway_info": gateway})
            })
            .collect();
        json!({"routers": routers})
    }

    fn list_floating_ips(&self) -> Value {
        let addresses: Vec<Value> = self
            .floating_ips
            .iter()
            .map(|entry| {
                json!({
                    "floating_ip_address": entry.address,
                    "status": if entry.server.is_some() { "ACTIVE" } else { "DOWN" },
                })
            })
            .collect();
        json!({"floatingips": addresses})
    }

    fn create_floating_ip(&mut self) -> Reply {
        self.floating_counter += 1;
        let address = format!("172.24.4.{}", self.floating_counter);
        self.floating_ips.push(FakeFloatingIp {
            address: address.clone(),
            server: None,
        });
        (
            201,
            json!({"floatingip": {"floating_ip_address": address, "status": "DOWN"}}),
        )
    }

    fn list_volumes(&mut self) -> Reply {
        self.reap_volumes();
        let volumes: Vec<Value> = self
            .volumes
            .iter()
            .map(|volume| json!({"id": volume.id.as_str(), "name": volume.name}))
            .collect();
        (200, json!({"volumes": volumes}))
    }

    fn create_volume(&mut self, body: Option<&Value>) -> Reply {
        if self.behaviour.fail_volume_create {
            return (500, json!({"computeFault": {"code": 500, "message": "volume backend unavailable"}}));
        }
        let name = body
            .and_then(|value| value.pointer("/volume/name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let id = VolumeId::new(Uuid::new_v4().to_string());
        self.volumes.push(FakeVolume {
            id: id.clone(),
            name: name.clone(),
            status: String::from("available"),
            attached_to: Vec::new(),
            pending_attach: None,
            vanish_after: None,
        });
        (
            202,
            json!({"volume": {"id": id.as_str(), "name": name, "status": "available", "attachments": []}}),
        )
    }

    fn show_volume(&mut self, id: &VolumeId) -> Reply {
        self.reap_volumes();
        let pending = self.volume_mut(id).and_then(|volume| {
            let (_, gets) = volume.pending_attach.as_mut()?;
            Some(count_down(gets))
        });
        if pending == Some(true) {
            self.complete_attach(id);
        }
        let Some(volume) = self.volume_mut(id) else {
            return not_found(&format!("volume {id}"));
        };
        let attachments: Vec<Value> = volume
            .attached_to
            .iter()
            .map(|server| json!({"server_id": server.as_str()}))
            .collect();
        let reply = json!({"volume": {
            "id": volume.id.as_str(),
            "name": volume.name,
            "status": volume.status,
            "attachments": attachments,
        }});
        if volume.vanish_after.as_mut().is_some_and(count_down) {
            self.volumes.retain(|entry| &entry.id != id);
        }
        (200, reply)
    }

    fn delete_volume(&mut self, id: &VolumeId) -> Reply {
        let servers = &self.servers;
        let Some(volume) = self.volumes.iter_mut().find(|volume| &volume.id == id) else {
            return not_found(&format!("volume {id}"));
        };
        // Attachments to servers that no longer exist are stale and ignored.
        let attached = volume
            .attached_to
            .iter()
            .any(|server| servers.iter().any(|live| &live.id == server && !live.deleted));
        if attached || volume.pending_attach.is_some() {
            return bad_request(&format!("volume {id} is still attached"));
        }
        volume.status = String::from("deleting");
        (202, Value::Null)
    }
}

#[derive(Debug)]
struct ReplayEntry {
    method: Method,
    url: String,
    status: u16,
    body: String,
    served: bool,
}

/// Session that answers from a recorded API dump.
///
/// Each request is matched to the first unserved entry with the same verb
/// whose URL ends with the requested path.
#[derive(Clone, Debug)]
pub struct ReplaySession {
    entries: Arc<Mutex<Vec<ReplayEntry>>>,
}

impl ReplaySession {
    /// Parses a dump as written by [`RequestCache::dump`].
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::Shape`] for entries without a verb or status.
    pub fn from_dump(dump: &Value) -> Result<Self, OpenstackError> {
        let shape = |message: String| OpenstackError::Shape { message };
        let records = dump
            .as_array()
            .ok_or_else(|| shape(String::from("API dump is not a list")))?;
        let mut entries = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let object = record
                .as_object()
                .ok_or_else(|| shape(format!("dump entry {index} is not an object")))?;
            let (method, url) = object
                .iter()
                .find_map(|(key, value)| Some((Method::parse(key)?, value.as_str()?)))
                .ok_or_else(|| shape(format!("dump entry {index} has no request verb")))?;
            let status = object
                .get("status_code")
                .and_then(Value::as_u64)
                .and_then(|code| u16::try_from(code).ok())
                .ok_or_else(|| shape(format!("dump entry {index} has no status code")))?;
            let body = match object.get("response") {
                None | Some(Value::Null) => String::new(),
                Some(response) => response.to_string(),
            };
            entries.push(ReplayEntry {
                method,
                url: url.to_owned(),
                status,
                body,
                served: false,
            });
        }
        Ok(Self {
            entries: Arc::new(Mutex::new(entries)),
        })
    }

    /// Number of entries not yet served.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| !entry.served)
            .count()
    }

    /// One session per service, all replaying the same dump.
    #[must_use]
    pub fn sessions(&self) -> SessionMap {
        let mut sessions = SessionMap::new();
        for service in Service::ALL {
            sessions.insert(service, Box::new(self.clone()));
        }
        sessions
    }

    fn replay(&self, method: Method, path: &str) -> Result<RawResponse, OpenstackError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .iter_mut()
            .find(|entry| !entry.served && entry.method == method && entry.url.ends_with(path))
            .ok_or_else(|| OpenstackError::Transport {
                message: format!("no recorded response for {method} {path}"),
            })?;
        entry.served = true;
        Ok(RawResponse {
            url: entry.url.clone(),
            status: entry.status,
            body: entry.body.clone(),
        })
    }
}

impl Session for ReplaySession {
    fn send<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        _body: Option<&'a Value>,
    ) -> SessionFuture<'a> {
        let response = self.replay(method, path);
        Box::pin(async move { response })
    }
}
