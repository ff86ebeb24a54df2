use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::OnceLock;

use uuid::Uuid;

const UNKNOWN_IP: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Fresh owner token for one acquisition: `"{ipv4}:{uuid}"`.
///
/// The UUID makes the token unique; the address only helps a human find the
/// holder when inspecting the backend.
pub fn owner_token() -> String {
    format!("{}:{}", local_ipv4(), Uuid::new_v4())
}

/// Outbound IPv4 address of this host, resolved once per process.
pub fn local_ipv4() -> Ipv4Addr {
    static IP: OnceLock<Ipv4Addr> = OnceLock::new();
    *IP.get_or_init(|| discover_ipv4().unwrap_or(UNKNOWN_IP))
}

// Connecting a UDP socket sends nothing; it only makes the OS pick the
// interface of the default route.
fn discover_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}
