//! Utility functions shared across the keeper workspace.

use std::net::SocketAddr;

use if_addrs::IfAddr;

use crate::error::{KeeperError, Result};

/// Convert snake_case to CamelCase (`back_rooms` -> `BackRooms`).
pub fn to_camel_case(key: &str) -> String {
    key.split('_').map(to_upper_first).collect()
}

/// Upper-case the first character.
pub fn to_upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Struct name of a configuration file: CamelCase of the basename without
/// its suffix (`/live/global.conf` -> `Global`).
pub fn struct_name(fname: &str) -> String {
    let base = fname.rsplit('/').next().unwrap_or(fname);
    let stem = base.split('.').next().unwrap_or(base);
    to_upper_first(stem)
}

/// Get the first non-loopback IPv4 address of this host, preferring a
/// 10.x interface (internal network) when one exists.
pub fn local_ip() -> Result<String> {
    let addrs = if_addrs::get_if_addrs()
        .map_err(|e| KeeperError::InvalidArgument(format!("list interfaces: {e}")))?;
    let mut ips = Vec::new();
    for iface in addrs {
        if iface.is_loopback() {
            continue;
        }
        if let IfAddr::V4(v4) = iface.addr {
            ips.push(v4.ip);
        }
    }
    if ips.is_empty() {
        return Err(KeeperError::InvalidArgument(
            "can not get listen ip".to_string(),
        ));
    }
    if let Some(ip) = ips.iter().find(|ip| ip.octets()[0] == 10) {
        return Ok(ip.to_string());
    }
    Ok(ips[0].to_string())
}

/// Resolve a listen address (`:7000`, `0.0.0.0:7000`, `10.1.2.3:7000`) into
/// an address other keepers and clients can reach.
pub fn advertise_addr(listen: &str) -> Result<String> {
    let listen = if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    };
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| KeeperError::InvalidArgument(format!("listen addr {listen}: {e}")))?;
    if addr.ip().is_unspecified() {
        return Ok(format!("{}:{}", local_ip()?, addr.port()));
    }
    Ok(addr.to_string())
}

/// Encode the pair of keeper addresses stored under `/keeper/addr/...`.
pub fn encode_keeper_addr(admin: &str, rpc: &str) -> String {
    format!("{admin},{rpc}")
}

/// Decode the stored keeper address pair into `(admin, rpc)`.
pub fn decode_keeper_addr(raw: &str) -> (String, String) {
    if raw.is_empty() {
        return (String::new(), String::new());
    }
    match raw.split_once(',') {
        Some((admin, rpc)) => (admin.to_string(), rpc.to_string()),
        None => (raw.to_string(), String::new()),
    }
}

/// The agent process shares the host with its nodes and registers with the
/// bare ip as its node id, so the agent id of any node is the host part.
pub fn agent_node_id(node_id: &str) -> &str {
    node_id.split(':').next().unwrap_or(node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_camel_case() {
        assert_eq!(to_camel_case("listen"), "Listen");
        assert_eq!(to_camel_case("max_conn_num"), "MaxConnNum");
        assert_eq!(to_camel_case(""), "");
    }

    #[test]
    fn test_struct_name() {
        assert_eq!(struct_name("/global.conf"), "Global");
        assert_eq!(struct_name("/live/session.conf"), "Session");
        assert_eq!(struct_name("back_rooms.conf"), "Back_rooms");
    }

    #[test]
    fn test_keeper_addr_roundtrip() {
        let raw = encode_keeper_addr("10.0.0.1:7300", "10.0.0.1:7000");
        assert_eq!(
            decode_keeper_addr(&raw),
            ("10.0.0.1:7300".to_string(), "10.0.0.1:7000".to_string())
        );
        assert_eq!(decode_keeper_addr(""), (String::new(), String::new()));
        assert_eq!(
            decode_keeper_addr("10.0.0.1:7300"),
            ("10.0.0.1:7300".to_string(), String::new())
        );
    }

    #[test]
    fn test_agent_node_id() {
        assert_eq!(agent_node_id("10.0.0.3:8900"), "10.0.0.3");
        assert_eq!(agent_node_id("10.0.0.3"), "10.0.0.3");
    }
}
