//! Scenario tests for discovery, creation, and teardown.

use std::time::Duration;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rstest::rstest;
use tempfile::TempDir;

use super::*;
use crate::openstack::Method;
use crate::request::CreateRequestBuilder;
use crate::test_support::FakeCloud;

const PUBLIC_KEY: &str = "ssh-ed25519 AAAAC3Nza ci@builder";

struct Harness {
    _dir: TempDir,
    root: Utf8PathBuf,
    cloud: FakeCloud,
}

impl Harness {
    fn new(cloud: FakeCloud) -> Self {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non UTF-8 temp path: {}", path.display()));
        Dir::open_ambient_dir(&root, ambient_authority())
            .and_then(|handle| handle.write("id.pub", PUBLIC_KEY))
            .unwrap_or_else(|err| panic!("write key: {err}"));
        Self {
            _dir: dir,
            root,
            cloud,
        }
    }

    fn provisioner(&self) -> Provisioner {
        let lock = ProcessLock::in_dir(&self.root, ".adept_global_floatingip")
            .unwrap_or_else(|err| panic!("lock should open: {err}"));
        Provisioner::new(
            self.cloud.request_cache(),
            lock,
            PollSettings::new(Duration::from_secs(60)),
        )
    }

    fn request(&self, name: &str) -> CreateRequestBuilder {
        CreateRequest::builder()
            .name(name)
            .public_key_file(self.root.join("id.pub"))
            .image("img1")
            .flavor("f1")
    }
}

fn build(builder: CreateRequestBuilder) -> CreateRequest {
    builder
        .build()
        .unwrap_or_else(|err| panic!("request should build: {err}"))
}

fn stocked() -> FakeCloud {
    FakeCloud::new().with_flavor("f1").with_image("img1")
}

#[tokio::test(start_paused = true)]
async fn existing_vm_is_reported_without_mutation() {
    let harness = Harness::new(stocked());
    let id = harness.cloud.add_server("web1", Some("9.9.9.9"));
    let request = build(harness.request("web1"));

    let outcome = harness
        .provisioner()
        .execute(&Invocation::DiscoverCreate(request))
        .await
        .unwrap_or_else(|err| panic!("discovery should succeed: {err}"));

    assert_eq!(
        outcome,
        Outcome::Found(HostDescription::new("9.9.9.9", id.as_str(), "web1"))
    );
    assert!(harness.cloud.mutations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn private_discovery_reports_the_fixed_address() {
    let harness = Harness::new(stocked());
    harness.cloud.add_server("web1", Some("9.9.9.9"));
    let mut provisioner = harness.provisioner();

    let host = provisioner
        .discover(&ServerLookup::by_name("web1"), None, true)
        .await
        .unwrap_or_else(|err| panic!("discovery should succeed: {err}"));

    assert_eq!(host.ansible_host, "10.0.0.1");
}

#[tokio::test(start_paused = true)]
async fn missing_vm_is_created_with_volume_and_address() {
    let harness = Harness::new(
        stocked()
            .with_floating_ip("9.9.9.9")
            .server_active_after(2)
            .volume_attach_after(2)
            .address_assign_after(1),
    );
    let request = build(harness.request("web2").volume_size_gb(Some(10)));

    let outcome = harness
        .provisioner()
        .execute(&Invocation::DiscoverCreate(request))
        .await
        .unwrap_or_else(|err| panic!("creation should succeed: {err}"));

    let Outcome::Created(host) = outcome else {
        panic!("expected a created VM, got {outcome:?}");
    };
    assert_eq!(host.ansible_host, "9.9.9.9");
    assert_eq!(host.host_name, "web2");
    assert_eq!(harness.cloud.servers_named("web2"), 1);
    let id = ServerId::from(host.host_uuid.as_str());
    assert_eq!(harness.cloud.volumes_attached_to(&id).len(), 1);
    let user_data = harness
        .cloud
        .user_data("web2")
        .unwrap_or_else(|| panic!("user data should be submitted"));
    assert!(user_data.contains(PUBLIC_KEY));
}

#[tokio::test(start_paused = true)]
async fn exclusive_create_refuses_an_existing_vm() {
    let harness = Harness::new(stocked());
    harness.cloud.add_server("web1", Some("9.9.9.9"));
    let request = build(harness.request("web1"));

    let outcome = harness
        .provisioner()
        .execute(&Invocation::ExclusiveCreate(request))
        .await
        .unwrap_or_else(|err| panic!("refusal is not an error: {err}"));

    assert!(matches!(outcome, Outcome::Refused(_)));
    assert_eq!(outcome.host(), None);
    assert!(harness.cloud.mutations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn duplicate_names_abort_discovery() {
    let harness = Harness::new(stocked());
    harness.cloud.add_server("web1", None);
    harness.cloud.add_server("web1", None);
    let request = build(harness.request("web1"));

    let err = harness
        .provisioner()
        .execute(&Invocation::DiscoverCreate(request))
        .await
        .expect_err("ambiguity must abort");

    assert!(matches!(err, OpenstackError::Ambiguous { count: 2, .. }));
    assert!(harness.cloud.mutations().is_empty());
}

fn is_server_error(err: &OpenstackError) -> bool {
    err.api_status() == Some(500)
}

fn is_timeout(err: &OpenstackError) -> bool {
    matches!(err, OpenstackError::Timeout { .. })
}

fn is_missing_address(err: &OpenstackError) -> bool {
    matches!(err, OpenstackError::MissingAddress { .. })
}

#[rstest]
#[case::volume_create_fails(FakeCloud::new().fail_volume_create(), Some(10), false, is_server_error)]
#[case::address_never_sticks(FakeCloud::new().fail_floating_ip_assign(), None, false, is_timeout)]
#[case::no_fixed_address(FakeCloud::new().without_fixed_addresses(), None, true, is_missing_address)]
#[tokio::test(start_paused = true)]
async fn failed_create_leaves_nothing_behind(
    #[case] cloud: FakeCloud,
    #[case] size: Option<u32>,
    #[case] private: bool,
    #[case] expected: fn(&OpenstackError) -> bool,
) {
    let harness = Harness::new(cloud.with_flavor("f1").with_image("img1"));
    let request = build(harness.request("web2").volume_size_gb(size).private(private));

    let err = harness
        .provisioner()
        .create(&request)
        .await
        .expect_err("create should fail");

    assert!(expected(&err), "unexpected error: {err}");
    assert_eq!(harness.cloud.servers_named("web2"), 0);
    assert!(harness.cloud.volume_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn racing_duplicate_only_removes_own_server() {
    let harness = Harness::new(stocked().duplicate_name_after(1));
    let request = build(harness.request("web2").private(true));

    let err = harness
        .provisioner()
        .create(&request)
        .await
        .expect_err("duplicate must abort");

    assert!(matches!(err, OpenstackError::Ambiguous { .. }), "unexpected error: {err}");
    assert_eq!(harness.cloud.servers_named("web2"), 1);
}

#[tokio::test(start_paused = true)]
async fn destroying_a_missing_vm_only_lists_servers() {
    let harness = Harness::new(FakeCloud::new());

    let outcome = harness
        .provisioner()
        .execute(&Invocation::Destroy(ServerLookup::by_name("web1")))
        .await
        .unwrap_or_else(|err| panic!("destroy should be idempotent: {err}"));

    assert_eq!(outcome, Outcome::Destroyed);
    let requests = harness.cloud.requests();
    assert!(
        requests
            .iter()
            .all(|request| request.method == Method::Get && request.path == "/servers"),
        "unexpected requests: {requests:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn destroy_removes_server_and_owned_volumes() {
    let harness = Harness::new(FakeCloud::new());
    let server = harness.cloud.add_server("web1", Some("9.9.9.9"));
    harness.cloud.add_volume("scratch", Some(&server));
    harness.cloud.add_volume(server.as_str(), None);
    let unrelated = harness.cloud.add_volume("shared-cache", None);

    harness
        .provisioner()
        .destroy(&ServerLookup::by_name("web1"))
        .await
        .unwrap_or_else(|err| panic!("destroy should succeed: {err}"));

    assert_eq!(harness.cloud.servers_named("web1"), 0);
    assert_eq!(harness.cloud.volume_ids(), vec![unrelated]);
}

#[tokio::test(start_paused = true)]
async fn destroy_by_id_sweeps_volumes_of_a_vanished_server() {
    let harness = Harness::new(FakeCloud::new());
    let ghost = ServerId::from("4b1e7c52-0d2f-4d8a-9a61-3f0c2f7d9e10");
    harness.cloud.add_volume(ghost.as_str(), None);
    let unrelated = harness.cloud.add_volume("shared-cache", None);

    harness
        .provisioner()
        .destroy(&ServerLookup::by_id(ghost))
        .await
        .unwrap_or_else(|err| panic!("destroy should succeed: {err}"));

    assert_eq!(harness.cloud.volume_ids(), vec![unrelated]);
}

#[tokio::test(start_paused = true)]
async fn retried_destroy_reclaims_a_volume_still_attached_to_the_gone_server() {
    let harness = Harness::new(FakeCloud::new());
    let ghost = ServerId::from("9d0c5a3e-61b7-4f2a-8c1d-7e5b4a2f6c08");
    harness.cloud.add_volume(ghost.as_str(), Some(&ghost));

    harness
        .provisioner()
        .destroy(&ServerLookup::by_id(ghost.clone()))
        .await
        .unwrap_or_else(|err| panic!("destroy should succeed: {err}"));

    assert!(harness.cloud.volume_ids().is_empty());
    let detach_path = format!("/servers/{ghost}/os-volume_attachments/");
    let detaches = harness
        .cloud
        .mutations()
        .iter()
        .filter(|request| request.path.starts_with(&detach_path))
        .count();
    assert_eq!(detaches, 1);
}

#[tokio::test(start_paused = true)]
async fn destroy_refuses_ambiguous_names() {
    let harness = Harness::new(FakeCloud::new());
    harness.cloud.add_server("web1", None);
    harness.cloud.add_server("web1", None);

    let err = harness
        .provisioner()
        .destroy(&ServerLookup::by_name("web1"))
        .await
        .expect_err("ambiguity must abort");

    assert!(matches!(err, OpenstackError::Ambiguous { count: 2, .. }));
    assert_eq!(harness.cloud.servers_named("web1"), 2);
    assert!(harness.cloud.mutations().is_empty());
}

#[test]
fn operations_are_named_for_dumps() {
    let lookup = ServerLookup::by_name("web1");
    assert_eq!(Invocation::Destroy(lookup).operation(), "destroy");
}
