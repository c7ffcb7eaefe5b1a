//! Signed-request check for the admin surface.
//!
//! Every admin request outside test mode carries `partner`, `rand`, `time`
//! and `guid` where `guid = md5hex(partner + "_" + rand + "_" + time + secret)`.

use md5::{Digest, Md5};

#[derive(Clone, Debug, Default)]
pub struct GuidParams {
    pub partner: String,
    pub rand: String,
    pub time: String,
}

/// Compute the request guid for the given parameters.
pub fn server_guid(params: &GuidParams, secret: &str) -> String {
    let joined = [
        params.partner.as_str(),
        params.rand.as_str(),
        params.time.as_str(),
    ]
    .join("_");
    let digest = Md5::digest(format!("{joined}{secret}").as_bytes());
    const_hex::encode(digest)
}

/// Check a request guid against the shared secret.
pub fn check_server_guid(params: &GuidParams, guid: &str, secret: &str) -> bool {
    server_guid(params, secret) == guid.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef";

    #[test]
    fn test_guid_roundtrip() {
        let params = GuidParams {
            partner: "server".to_string(),
            rand: "42".to_string(),
            time: "1700000000".to_string(),
        };
        let guid = server_guid(&params, SECRET);
        assert_eq!(guid.len(), 32);
        assert!(check_server_guid(&params, &guid, SECRET));
        assert!(check_server_guid(&params, &guid.to_uppercase(), SECRET));
    }

    #[test]
    fn test_guid_rejects_tampering() {
        let params = GuidParams {
            partner: "server".to_string(),
            rand: "42".to_string(),
            time: "1700000000".to_string(),
        };
        let guid = server_guid(&params, SECRET);
        let tampered = GuidParams {
            rand: "43".to_string(),
            ..params
        };
        assert!(!check_server_guid(&tampered, &guid, SECRET));
        assert!(!check_server_guid(&params, &guid, "other-secret"));
    }
}
