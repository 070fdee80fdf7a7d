use std::net::IpAddr;

use super::*;

#[test]
fn test_create_addr_pairs_ip_and_port() {
    let ip: IpAddr = "192.0.2.1".parse().unwrap();
    let addr = create_addr(NetworkType::Udp4, ip, 4000);
    assert_eq!(addr.ip(), ip);
    assert_eq!(addr.port(), 4000);
}
