//! Unit tests for the outbound allow-list.

use std::net::SocketAddr;

use rstest::{fixture, rstest};
use warden_util::StatusCode;

use super::*;

fn addr(text: &str) -> SocketAddr {
    text.parse().expect("socket address")
}

#[fixture]
fn hosts() -> AllowedHosts {
    let mut hosts = AllowedHosts::new();
    hosts.allow_ipv4("127.0.0.1", Some(80)).expect("loopback");
    hosts
        .allow_ipv4("10.0.0.0/255.0.0.0", None)
        .expect("private network");
    hosts.allow_ipv6("2001:db8::/32", Some(443)).expect("documentation");
    hosts
}

#[rstest]
#[case::exact_port("127.0.0.1:80", true)]
#[case::wrong_port("127.0.0.1:81", false)]
#[case::any_port_in_network("10.20.30.40:9999", true)]
#[case::outside_network("11.0.0.1:80", false)]
#[case::ipv6_inside("[2001:db8:1::7]:443", true)]
#[case::ipv6_wrong_port("[2001:db8:1::7]:80", false)]
#[case::ipv6_outside("[2001:db9::1]:443", false)]
#[case::family_mismatch("[::ffff:127.0.0.1]:80", false)]
fn rules_are_or_combined(hosts: AllowedHosts, #[case] target: &str, #[case] allowed: bool) {
    assert_eq!(hosts.is_host_allowed(&addr(target)), allowed);
}

#[rstest]
fn empty_list_denies_everything() {
    assert!(!AllowedHosts::new().is_host_allowed(&addr("127.0.0.1:80")));
}

#[rstest]
fn network_is_stored_masked() {
    let mut hosts = AllowedHosts::new();
    hosts.allow_ipv4("192.168.7.9/24", None).expect("prefix form");
    assert_eq!(
        hosts.rules(),
        [HostRule::V4 {
            network: 0xC0A8_0700,
            mask: 0xFFFF_FF00,
            port: None,
        }]
    );
    assert!(hosts.is_host_allowed(&addr("192.168.7.200:1")));
}

#[rstest]
fn zero_prefix_matches_every_address_of_the_family() {
    let mut hosts = AllowedHosts::new();
    hosts.allow_ipv6("::/0", None).expect("default route");
    assert!(hosts.is_host_allowed(&addr("[fe80::1]:22")));
    assert!(!hosts.is_host_allowed(&addr("1.2.3.4:22")));
}

#[rstest]
#[case::bad_address("300.1.1.1")]
#[case::non_contiguous_mask("10.0.0.0/255.0.255.0")]
#[case::prefix_too_long("10.0.0.0/33")]
#[case::garbage_mask("10.0.0.0/abc")]
fn malformed_ipv4_rules_are_invalid_arguments(#[case] spec: &str) {
    let error = AllowedHosts::new()
        .allow_ipv4(spec, None)
        .expect_err("rule must be rejected");
    assert_eq!(error.code(), StatusCode::InvalidArgument);
}

#[rstest]
#[case::bad_address("2001:::1")]
#[case::prefix_too_long("::1/129")]
fn malformed_ipv6_rules_are_rejected(#[case] spec: &str) {
    assert!(AllowedHosts::new().allow_ipv6(spec, None).is_err());
}

#[rstest]
fn rules_render_for_logging(hosts: AllowedHosts) {
    let rendered: Vec<String> = hosts.rules().iter().map(ToString::to_string).collect();
    assert_eq!(
        rendered,
        ["127.0.0.1/32:80", "10.0.0.0/8:*", "[2001:db8::]/32:443"]
    );
}
