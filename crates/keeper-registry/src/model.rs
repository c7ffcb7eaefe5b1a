//! Registry data model: instances, services, administrative properties.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use keeper_api::grpc;
use keeper_common::error::Result;

/// Metadata keys managed by the admin surface carry this prefix; watch
/// events from instances never overwrite them, and property updates never
/// touch anything else.
pub const BACKEND_METADATA_PREFIX: &str = "backend-metadata-";
/// Zone weight table, stored on service metadata.
pub const BACKEND_METADATA_ZONE_WEIGHT: &str = "backend-metadata-zone_weight";
/// Per-instance weight override.
pub const BACKEND_METADATA_INSTANCE_WEIGHT: &str = "backend-metadata-instance_weight";
/// Instance online flag; only an explicit "N" takes an instance offline.
pub const BACKEND_METADATA_INSTANCE_ONLINE: &str = "backend-metadata-online";
pub const BACKEND_INSTANCE_ONLINE_NO: &str = "N";

pub const SCHEME_HTTP: &str = "http";
pub const SCHEME_RPC: &str = "rpc";

pub type MD = BTreeMap<String, String>;

/// Merge `other` into `md`, overwriting existing keys.
pub fn join_md(md: &mut MD, other: &MD) {
    for (k, v) in other {
        md.insert(k.clone(), v.clone());
    }
}

/// One registered endpoint of a service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Instance {
    pub id: String,
    pub service_name: String,
    pub zone: String,
    pub env: String,
    pub hostname: String,
    /// scheme -> address, e.g. `http -> 10.0.0.3:8080`
    pub addrs: BTreeMap<String, String>,
    pub metadata: MD,
    pub reg_time: i64,
    pub update_time: i64,
}

/// All instances sharing a service name, grouped by zone. `version` is the
/// maximum backend revision observed under the service's key range.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub service_name: String,
    /// zone -> instance id -> instance
    pub instances: BTreeMap<String, BTreeMap<String, Instance>>,
    pub metadata: MD,
    pub update_time: i64,
    pub version: i64,
}

impl Service {
    pub fn new(service_name: &str) -> Service {
        Service {
            service_name: service_name.to_string(),
            ..Default::default()
        }
    }
}

/// Weight of traffic from a source zone towards each destination zone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneWeight {
    pub src: String,
    pub dst: BTreeMap<String, u64>,
}

pub type ZoneWeights = BTreeMap<String, ZoneWeight>;

pub fn encode_zone_weights(zws: &ZoneWeights) -> Result<String> {
    Ok(serde_json::to_string(zws)?)
}

pub fn decode_zone_weights(s: &str) -> Result<ZoneWeights> {
    Ok(serde_json::from_str(s)?)
}

/// Administrative overlay on a service: zone weights plus per-instance
/// metadata keyed by instance id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Property {
    pub service_name: String,
    pub zone_weights: ZoneWeights,
    pub attrs: BTreeMap<String, MD>,
}

pub fn is_instance_offline(instance: &Instance) -> bool {
    instance
        .metadata
        .get(BACKEND_METADATA_INSTANCE_ONLINE)
        .is_some_and(|v| v == BACKEND_INSTANCE_ONLINE_NO)
}

/// Drop instances an operator has taken offline.
pub fn filter_offline_instances(mut service: Service) -> Service {
    for group in service.instances.values_mut() {
        group.retain(|_, instance| !is_instance_offline(instance));
    }
    service
}

// ---------------------------------------------------------------------
// wire conversions
// ---------------------------------------------------------------------

impl From<&grpc::Instance> for Instance {
    fn from(pb: &grpc::Instance) -> Instance {
        Instance {
            id: pb.id.clone(),
            service_name: pb.service_name.clone(),
            zone: pb.zone.clone(),
            env: pb.env.clone(),
            hostname: pb.hostname.clone(),
            addrs: pb.addrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            metadata: pb
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            reg_time: pb.reg_time,
            update_time: pb.update_time,
        }
    }
}

impl From<&Instance> for grpc::Instance {
    fn from(instance: &Instance) -> grpc::Instance {
        grpc::Instance {
            id: instance.id.clone(),
            service_name: instance.service_name.clone(),
            zone: instance.zone.clone(),
            env: instance.env.clone(),
            hostname: instance.hostname.clone(),
            addrs: instance
                .addrs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            metadata: instance
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            reg_time: instance.reg_time,
            update_time: instance.update_time,
        }
    }
}

impl From<&Service> for grpc::Service {
    fn from(service: &Service) -> grpc::Service {
        let mut instances = HashMap::new();
        for (zone, group) in &service.instances {
            let zone_group = grpc::ZoneGroup {
                instances: group
                    .iter()
                    .map(|(id, instance)| (id.clone(), instance.into()))
                    .collect(),
            };
            instances.insert(zone.clone(), zone_group);
        }
        grpc::Service {
            service_name: service.service_name.clone(),
            instances,
            metadata: service
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            update_time: service.update_time,
            version: service.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, online: Option<&str>) -> Instance {
        let mut metadata = MD::new();
        if let Some(v) = online {
            metadata.insert(BACKEND_METADATA_INSTANCE_ONLINE.to_string(), v.to_string());
        }
        Instance {
            id: id.to_string(),
            service_name: "live.session".to_string(),
            zone: "bjcc".to_string(),
            metadata,
            ..Default::default()
        }
    }

    #[test]
    fn test_join_md_overwrites() {
        let mut md = MD::from([("a".to_string(), "1".to_string())]);
        let other = MD::from([
            ("a".to_string(), "2".to_string()),
            ("b".to_string(), "3".to_string()),
        ]);
        join_md(&mut md, &other);
        assert_eq!(md["a"], "2");
        assert_eq!(md["b"], "3");
    }

    #[test]
    fn test_offline_filter_requires_explicit_no() {
        assert!(!is_instance_offline(&instance("a", None)));
        assert!(!is_instance_offline(&instance("b", Some("Y"))));
        assert!(is_instance_offline(&instance("c", Some("N"))));

        let mut service = Service::new("live.session");
        let group = service.instances.entry("bjcc".to_string()).or_default();
        group.insert("a".to_string(), instance("a", None));
        group.insert("c".to_string(), instance("c", Some("N")));
        let filtered = filter_offline_instances(service);
        assert_eq!(filtered.instances["bjcc"].len(), 1);
        assert!(filtered.instances["bjcc"].contains_key("a"));
    }

    #[test]
    fn test_zone_weights_roundtrip() {
        let zws = ZoneWeights::from([(
            "bjcc".to_string(),
            ZoneWeight {
                src: "bjcc".to_string(),
                dst: BTreeMap::from([("bjcc".to_string(), 80), ("bjyt".to_string(), 20)]),
            },
        )]);
        let encoded = encode_zone_weights(&zws).unwrap();
        assert_eq!(decode_zone_weights(&encoded).unwrap(), zws);
    }

    #[test]
    fn test_instance_wire_roundtrip() {
        let mut instance = instance("10.0.0.3:8080", None);
        instance
            .addrs
            .insert(SCHEME_HTTP.to_string(), "10.0.0.3:8080".to_string());
        let pb: grpc::Instance = (&instance).into();
        let back: Instance = (&pb).into();
        assert_eq!(back, instance);
    }

    #[test]
    fn test_service_wire_conversion() {
        let mut service = Service::new("live.session");
        service.version = 9;
        service
            .instances
            .entry("bjcc".to_string())
            .or_default()
            .insert("a".to_string(), instance("a", None));
        let pb: grpc::Service = (&service).into();
        assert_eq!(pb.version, 9);
        assert_eq!(pb.instances["bjcc"].instances.len(), 1);
    }

    #[test]
    fn test_property_serde() {
        let property: Property = serde_json::from_str(
            r#"{"service_name":"live.session","zone_weights":{},"attrs":{"a":{"backend-metadata-online":"N"}}}"#,
        )
        .unwrap();
        assert_eq!(property.service_name, "live.session");
        assert_eq!(property.attrs["a"][BACKEND_METADATA_INSTANCE_ONLINE], "N");
    }
}
