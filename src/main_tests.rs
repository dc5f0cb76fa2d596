//! Unit tests for the `adept-openstack` CLI binary implementation.

use super::*;
use rstest::rstest;

fn args(values: &[&str]) -> Vec<OsString> {
    values.iter().map(OsString::from).collect()
}

#[rstest]
#[case("openstack_discover_create.py", Some("discover-create"))]
#[case("openstack_exclusive_create", Some("exclusive-create"))]
#[case("openstack_destroy.sh", Some("destroy"))]
#[case("adept-openstack", None)]
fn link_names_imply_subcommands(#[case] program: &str, #[case] expected: Option<&str>) {
    assert_eq!(implied_subcommand(program), expected);
}

#[test]
fn implied_subcommand_is_inserted_once() {
    let rewritten = with_implied_subcommand(args(&["/usr/bin/openstack_destroy", "web1"]));
    assert_eq!(rewritten, args(&["/usr/bin/openstack_destroy", "destroy", "web1"]));

    let explicit = with_implied_subcommand(args(&["openstack_destroy", "destroy", "web1"]));
    assert_eq!(explicit, args(&["openstack_destroy", "destroy", "web1"]));
}

#[test]
fn create_flags_map_onto_the_request() {
    let cli = Cli::parse_from(args(&[
        "adept-openstack",
        "discover-create",
        "--workspace",
        "/tmp",
        "-i",
        "Fedora",
        "-p",
        "-s",
        "10",
        "-r",
        "edge",
        "web2",
        "/tmp/a.pub",
        "/tmp/b.pub",
    ]));
    let config = OpenstackConfig::default();

    let invocation = invocation(&cli, &config).unwrap_or_else(|err| panic!("request should build: {err}"));

    let Invocation::DiscoverCreate(request) = invocation else {
        panic!("expected discover-create");
    };
    assert_eq!(request.name, "web2");
    assert_eq!(request.image, "Fedora");
    assert_eq!(request.flavor, config.default_flavor);
    assert!(request.private);
    assert_eq!(request.volume_size_gb, Some(10));
    assert_eq!(request.router_name.as_deref(), Some("edge"));
    assert_eq!(request.public_key_files.len(), 2);
}

#[test]
fn destroy_takes_only_a_name() {
    let cli = Cli::parse_from(args(&["adept-openstack", "destroy", "--workspace", "/tmp", "web1"]));

    let invocation = invocation(&cli, &OpenstackConfig::default())
        .unwrap_or_else(|err| panic!("destroy should parse: {err}"));

    assert_eq!(invocation, Invocation::Destroy(ServerLookup::by_name("web1")));
    assert_eq!(invocation.operation(), "destroy");
}

#[rstest]
#[case(Some(0), true)]
#[case(Some(30), false)]
#[case(None, false)]
fn zero_timeout_is_a_usage_error(#[case] flag: Option<u64>, #[case] rejected: bool) {
    let result = resolve_timeout(flag, &OpenstackConfig::default());
    assert_eq!(result.is_err(), rejected);
    if let Err(err) = result {
        assert_eq!(err.exit_code(), 2);
    }
}

#[rstest]
#[case(CliError::Workspace(WorkspaceError::Missing { path: String::from("/nope") }), 2)]
#[case(CliError::Config(ConfigError::MissingField(String::from("image"))), 2)]
#[case(CliError::Refused { name: String::from("web1"), address: String::from("9.9.9.9") }, 1)]
#[case(CliError::Openstack(OpenstackError::Ambiguous { name: String::from("web1"), count: 2 }), 4)]
#[case(CliError::Openstack(OpenstackError::not_found("server 'web1'")), 3)]
fn errors_map_to_exit_codes(#[case] err: CliError, #[case] expected: u8) {
    assert_eq!(err.exit_code(), expected);
}

#[test]
fn write_error_appends_newline() {
    let mut buffer = Vec::new();
    write_error(&mut buffer, &CliError::Output(String::from("closed")));
    assert_eq!(
        String::from_utf8_lossy(&buffer),
        "cannot write the host description: closed\n"
    );
}
