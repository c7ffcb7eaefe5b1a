//! Key layout of the configuration store.
//!
//! ```text
//! /keeper/conf/<domain>/<file-path>/<section>/<key>  -> ConfData blob
//! /keeper/version/current/<domain>                   -> {version, package_version}
//! /keeper/version/all/<domain>/<version>             -> Recode blob
//! /keeper/addr/<domain>/<node-id>                    -> keeper address pair
//! /keeper/lease/node/<keeper-id>                     -> admin address (lease-backed)
//! /keeper/lock/<path>                                -> mutex hold
//! /keeper/cron                                       -> reconciliation leader token
//! ```

use keeper_common::error::{KeeperError, Result};

pub const ROOT_PATH: &str = "keeper";
const CONF_PATH: &str = "conf";
const VERSION_PATH: &str = "version";
const ALL_VERSION_PATH: &str = "all";
const CURRENT_VERSION_PATH: &str = "current";
const ADDR_PATH: &str = "addr";
const LEASE_PATH: &str = "lease";
const NODE_LEASE_PATH: &str = "node";
const LOCK_PATH: &str = "lock";
const CRON_PATH: &str = "cron";

/// Join path segments, collapsing duplicate separators, with a leading `/`.
fn join(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        for seg in part.split('/') {
            if seg.is_empty() {
                continue;
            }
            out.push('/');
            out.push_str(seg);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

pub fn root_path() -> String {
    join(&[ROOT_PATH])
}

pub fn conf_dir_path() -> String {
    join(&[ROOT_PATH, CONF_PATH])
}

// Trailing separator keeps the scan from picking up sibling domains that
// share the name as a prefix.
pub fn conf_domain_path(domain: &str) -> String {
    join(&[ROOT_PATH, CONF_PATH, domain]) + "/"
}

pub fn conf_file_path(domain: &str, file: &str) -> String {
    join(&[ROOT_PATH, CONF_PATH, domain, file])
}

pub fn conf_key_path(domain: &str, file: &str, section: &str, key: &str) -> String {
    join(&[ROOT_PATH, CONF_PATH, domain, file, section, key])
}

pub fn version_key_path(domain: &str, version: i64) -> String {
    join(&[
        ROOT_PATH,
        VERSION_PATH,
        ALL_VERSION_PATH,
        domain,
        &version.to_string(),
    ])
}

pub fn current_version_dir_path() -> String {
    join(&[ROOT_PATH, VERSION_PATH, CURRENT_VERSION_PATH])
}

pub fn current_version_key_path(domain: &str) -> String {
    join(&[ROOT_PATH, VERSION_PATH, CURRENT_VERSION_PATH, domain])
}

pub fn addr_dir_path(domain: &str) -> String {
    join(&[ROOT_PATH, ADDR_PATH, domain])
}

pub fn addr_key_path(domain: &str, node_id: &str) -> String {
    join(&[ROOT_PATH, ADDR_PATH, domain, node_id])
}

pub fn node_lease_dir_path() -> String {
    join(&[ROOT_PATH, LEASE_PATH, NODE_LEASE_PATH])
}

pub fn node_lease_key_path(keeper_id: i64) -> String {
    join(&[
        ROOT_PATH,
        LEASE_PATH,
        NODE_LEASE_PATH,
        &keeper_id.to_string(),
    ])
}

pub fn lock_path(path: &str) -> String {
    join(&[ROOT_PATH, LOCK_PATH, path])
}

pub fn cron_path() -> String {
    join(&[ROOT_PATH, CRON_PATH])
}

/// Split a conf key path into `(domain, file, section, key)`. The file part
/// keeps its directory structure and leading separator.
pub fn parse_conf_key_path(path: &str) -> Result<(String, String, String, String)> {
    let list: Vec<&str> = path.trim_matches('/').split('/').collect();
    if list.len() < 6 || list[0] != ROOT_PATH || list[1] != CONF_PATH {
        return Err(KeeperError::InvalidArgument(format!(
            "conf path is invalid: {path}"
        )));
    }
    let len = list.len();
    let file = format!("/{}", list[3..len - 2].join("/"));
    Ok((
        list[2].to_string(),
        file,
        list[len - 2].to_string(),
        list[len - 1].to_string(),
    ))
}

pub fn parse_current_version_key_path(path: &str) -> Result<String> {
    let list: Vec<&str> = path.trim_matches('/').split('/').collect();
    if list.len() != 4
        || list[0] != ROOT_PATH
        || list[1] != VERSION_PATH
        || list[2] != CURRENT_VERSION_PATH
    {
        return Err(KeeperError::InvalidArgument(format!(
            "current version path is invalid: {path}"
        )));
    }
    Ok(list[3].to_string())
}

pub fn parse_node_lease_key_path(path: &str) -> Result<i64> {
    let list: Vec<&str> = path.trim_matches('/').split('/').collect();
    if list.len() != 4 || list[0] != ROOT_PATH || list[1] != LEASE_PATH || list[2] != NODE_LEASE_PATH
    {
        return Err(KeeperError::InvalidArgument(format!(
            "node lease path is invalid: {path}"
        )));
    }
    list[3]
        .parse()
        .map_err(|e| KeeperError::InvalidArgument(format!("node lease id: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_key_path_roundtrip() {
        let path = conf_key_path("live", "/sr-bjcc/global.conf", "DEFAULT", "listen");
        assert_eq!(path, "/keeper/conf/live/sr-bjcc/global.conf/DEFAULT/listen");
        let (domain, file, section, key) = parse_conf_key_path(&path).unwrap();
        assert_eq!(domain, "live");
        assert_eq!(file, "/sr-bjcc/global.conf");
        assert_eq!(section, "DEFAULT");
        assert_eq!(key, "listen");
    }

    #[test]
    fn test_conf_key_path_flat_file() {
        let path = conf_key_path("live", "global.conf", "node1", "listen");
        let (_, file, section, _) = parse_conf_key_path(&path).unwrap();
        assert_eq!(file, "/global.conf");
        assert_eq!(section, "node1");
    }

    #[test]
    fn test_parse_conf_key_path_rejects_foreign() {
        assert!(parse_conf_key_path("/keeper/version/current/live").is_err());
        assert!(parse_conf_key_path("/other/conf/a/b/c/d").is_err());
    }

    #[test]
    fn test_domain_path_has_trailing_separator() {
        assert_eq!(conf_domain_path("session"), "/keeper/conf/session/");
    }

    #[test]
    fn test_current_version_path_roundtrip() {
        let path = current_version_key_path("live");
        assert_eq!(parse_current_version_key_path(&path).unwrap(), "live");
        assert!(parse_current_version_key_path("/keeper/conf/live").is_err());
    }

    #[test]
    fn test_node_lease_path_roundtrip() {
        let path = node_lease_key_path(7);
        assert_eq!(parse_node_lease_key_path(&path).unwrap(), 7);
    }

    #[test]
    fn test_lock_path_nests() {
        assert_eq!(lock_path("live"), "/keeper/lock/live");
        assert_eq!(
            lock_path("/keeper/addr/live/n1"),
            "/keeper/lock/keeper/addr/live/n1"
        );
    }
}
