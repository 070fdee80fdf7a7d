use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use stun::message::{Getter, Message, BINDING_REQUEST};
use stun::textattrs::Username;

use super::*;
use crate::control::{AttrControlled, AttrControlling};

fn remote_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), port)
}

fn binding_request(setters: Vec<Box<dyn stun::message::Setter>>) -> Message {
    let mut m = Message::new();
    let mut all: Vec<Box<dyn stun::message::Setter>> = vec![Box::new(BINDING_REQUEST)];
    all.extend(setters);
    m.build(&all).unwrap();
    m
}

#[test]
fn test_matches_local_ufrag() {
    let creds = Arc::new(CredentialsManager::new());
    let server = ConnCheckServer::new(creds);

    let m = binding_request(vec![Box::new(Username::new(ATTR_USERNAME, "alice:bob".to_owned()))]);
    assert!(server.matches_local_ufrag(&m, "alice"));
    assert!(!server.matches_local_ufrag(&m, "bob"));
}

#[test]
fn test_matches_local_ufrag_missing_username() {
    let creds = Arc::new(CredentialsManager::new());
    let server = ConnCheckServer::new(creds);
    let m = binding_request(vec![]);
    assert!(!server.matches_local_ufrag(&m, "alice"));
}

#[test]
fn test_resolve_role_conflict_no_attribute_is_no_conflict() {
    let creds = Arc::new(CredentialsManager::new());
    let server = ConnCheckServer::new(creds);
    let m = binding_request(vec![]);
    assert!(matches!(
        server.resolve_role_conflict(&m, Role::Controlling, 100),
        RoleResolution::NoConflict
    ));
}

#[test]
fn test_resolve_role_conflict_same_role_is_no_conflict() {
    let creds = Arc::new(CredentialsManager::new());
    let server = ConnCheckServer::new(creds);
    // a controlling peer asserting ICE-CONTROLLING against our own Controlling role isn't a
    // conflict from this peer's perspective -- it only matters when roles actually clash.
    let m = binding_request(vec![Box::new(AttrControlling(5))]);
    assert!(matches!(
        server.resolve_role_conflict(&m, Role::Controlled, 100),
        RoleResolution::NoConflict
    ));
}

#[test]
fn test_resolve_role_conflict_we_win_rejects_peer() {
    let creds = Arc::new(CredentialsManager::new());
    let server = ConnCheckServer::new(creds);
    let m = binding_request(vec![Box::new(AttrControlling(5))]);
    assert!(matches!(
        server.resolve_role_conflict(&m, Role::Controlling, 100),
        RoleResolution::RejectPeer
    ));
}

#[test]
fn test_resolve_role_conflict_peer_wins_switches_role() {
    let creds = Arc::new(CredentialsManager::new());
    let server = ConnCheckServer::new(creds);
    let m = binding_request(vec![Box::new(AttrControlled(500))]);
    match server.resolve_role_conflict(&m, Role::Controlled, 100) {
        RoleResolution::SwitchRole(role) => assert_eq!(role, Role::Controlling),
        _ => panic!("expected a role switch"),
    }
}

#[test]
fn test_parse_request_reads_priority_and_use_candidate() {
    let creds = Arc::new(CredentialsManager::new());
    let server = ConnCheckServer::new(creds);
    let m = binding_request(vec![
        Box::new(PriorityAttr(123_456)),
        Box::new(crate::use_candidate::UseCandidateAttr::new()),
    ]);

    let outcome = server.parse_request(&m, remote_addr(4000), true).unwrap();
    assert_eq!(outcome.priority, 123_456);
    assert!(outcome.use_candidate);
    assert_eq!(outcome.peer_reflexive_from, remote_addr(4000));
}

#[test]
fn test_parse_request_implicit_use_candidate_when_not_controlling() {
    let creds = Arc::new(CredentialsManager::new());
    let server = ConnCheckServer::new(creds);
    let m = binding_request(vec![Box::new(PriorityAttr(1))]);

    let outcome = server.parse_request(&m, remote_addr(4000), false).unwrap();
    assert!(outcome.use_candidate);
}

#[test]
fn test_parse_request_missing_priority_errors() {
    let creds = Arc::new(CredentialsManager::new());
    let server = ConnCheckServer::new(creds);
    let m = binding_request(vec![]);
    assert!(server.parse_request(&m, remote_addr(4000), true).is_err());
}

#[test]
fn test_build_success_response_carries_mapped_address() {
    let creds = Arc::new(CredentialsManager::new());
    creds.set_local_credentials("alice", "alicepwdalicepwdalicepwd");
    let server = ConnCheckServer::new(creds);

    let request = binding_request(vec![Box::new(PriorityAttr(1))]);
    let bytes = server
        .build_success_response(&request, remote_addr(5000), "alice")
        .unwrap();

    let mut resp = Message::new();
    resp.raw = bytes;
    resp.decode().unwrap();
    assert_eq!(resp.typ.class, stun::message::CLASS_SUCCESS_RESPONSE);

    let mut mapped = stun::xoraddr::XorMappedAddress::default();
    mapped.get_from(&resp).unwrap();
    assert_eq!(mapped.port, 5000);
}

#[test]
fn test_build_role_conflict_response_carries_487() {
    let creds = Arc::new(CredentialsManager::new());
    creds.set_local_credentials("alice", "alicepwdalicepwdalicepwd");
    let server = ConnCheckServer::new(creds);

    let request = binding_request(vec![]);
    let bytes = server.build_role_conflict_response(&request, "alice").unwrap();

    let mut resp = Message::new();
    resp.raw = bytes;
    resp.decode().unwrap();
    assert_eq!(resp.typ.class, stun::message::CLASS_ERROR_RESPONSE);

    let mut ec = stun::error_code::ErrorCodeAttribute::default();
    ec.get_from(&resp).unwrap();
    assert_eq!(ec.code, stun::error_code::CODE_ROLE_CONFLICT);
}

#[test]
fn test_build_bad_request_response_carries_400() {
    let creds = Arc::new(CredentialsManager::new());
    creds.set_local_credentials("alice", "alicepwdalicepwdalicepwd");
    let server = ConnCheckServer::new(creds);

    let request = binding_request(vec![]);
    let bytes = server.build_bad_request_response(&request, "alice").unwrap();

    let mut resp = Message::new();
    resp.raw = bytes;
    resp.decode().unwrap();

    let mut ec = stun::error_code::ErrorCodeAttribute::default();
    ec.get_from(&resp).unwrap();
    assert_eq!(ec.code, stun::error_code::CODE_BAD_REQUEST);
}
