#[cfg(test)]
mod util_test;

use std::net::{IpAddr, SocketAddr};

use crate::network_type::NetworkType;

/// Builds the socket address a candidate resolves to. Kept as a free function, rather than inlined
/// at each candidate constructor, because every `Candidate` impl needs the identical pairing of an
/// IP and port into a `SocketAddr`, regardless of its `NetworkType`.
pub fn create_addr(_network: NetworkType, ip: IpAddr, port: u16) -> SocketAddr {
    SocketAddr::new(ip, port)
}
