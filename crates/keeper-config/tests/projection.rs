//! End-to-end projection behavior over a freshly loaded domain.

use keeper_api::{ConfData, TypedValue};
use keeper_config::ConfManager;
use keeper_storage::DomainData;

fn blob(raw_key: &str, raw_value: &str) -> String {
    ConfData::new(raw_key, raw_value).unwrap().encode().unwrap()
}

fn insert(data: &mut DomainData, file: &str, section: &str, key: &str, b: String) {
    data.entry(file.to_string())
        .or_default()
        .entry(section.to_string())
        .or_default()
        .insert(key.to_string(), b);
}

/// A client subscribing to `/g.conf/node1` receives struct `G` where the
/// section value overrides the unnamed-section default.
#[test]
fn section_subscription_overrides_defaults() {
    let mut data = DomainData::new();
    insert(&mut data, "/g.conf", "DEFAULT", "listen", blob("listen string", ":80"));
    insert(&mut data, "/g.conf", "node1", "listen", blob("listen", ":81"));
    let manager = ConfManager::from_domain_data(&data).unwrap();

    let resolved = manager.parse_subscribe(&["/g.conf/node1".to_string()]);
    assert_eq!(
        resolved,
        vec!["/g.conf/DEFAULT".to_string(), "/g.conf/node1".to_string()]
    );

    let projection = manager.subscribe(&resolved);
    assert_eq!(projection.len(), 1);
    assert_eq!(projection[0].name, "G");
    assert_eq!(projection[0].data["listen"].raw_value, ":81");
}

/// A node inheriting `/g.conf` through a deeper copy sees parent defaults
/// first and the deeper file's values last.
#[test]
fn inherited_file_layers_shallow_to_deep() {
    let mut data = DomainData::new();
    insert(&mut data, "/g.conf", "DEFAULT", "listen", blob("listen", ":80"));
    insert(&mut data, "/g.conf", "DEFAULT", "debug", blob("debug bool", "false"));
    insert(&mut data, "/zy/g.conf", "DEFAULT", "listen", blob("listen", ":90"));
    let manager = ConfManager::from_domain_data(&data).unwrap();

    let resolved = manager.parse_subscribe(&["/zy/g.conf".to_string()]);
    let projection = manager.subscribe(&resolved);
    assert_eq!(projection.len(), 1);
    // the deeper file wins for the shared key, the parent default survives
    assert_eq!(projection[0].data["listen"].raw_value, ":90");
    assert_eq!(projection[0].data["debug"].value, TypedValue::Bool(false));
}

/// Two files folding into the same struct with conflicting key types must
/// not load.
#[test]
fn conflicting_struct_key_types_fail_load() {
    let mut data = DomainData::new();
    insert(&mut data, "/g.conf", "DEFAULT", "port", blob("port int", "80"));
    insert(&mut data, "/live/g.conf", "DEFAULT", "port", blob("port", "eighty"));

    let err = ConfManager::from_domain_data(&data).unwrap_err();
    assert!(err.to_string().contains("key port type conflict"));
}

/// Typed values survive the full store-blob round trip into a projection.
#[test]
fn typed_values_roundtrip_through_projection() {
    let mut data = DomainData::new();
    insert(&mut data, "/s.conf", "DEFAULT", "hosts", blob("hosts []string", "a,b"));
    insert(&mut data, "/s.conf", "DEFAULT", "ttl", blob("ttl duration", "500ms"));
    insert(
        &mut data,
        "/s.conf",
        "DEFAULT",
        "weights",
        blob("weights map[string]int", "bjcc:80,bjyt:20"),
    );
    let manager = ConfManager::from_domain_data(&data).unwrap();

    let projection = manager.subscribe(&manager.parse_subscribe(&["/s.conf".to_string()]));
    let s = &projection[0];
    assert_eq!(s.name, "S");
    assert_eq!(
        s.data["hosts"].value,
        TypedValue::StrSlice(vec!["a".to_string(), "b".to_string()])
    );
    assert_eq!(
        s.data["ttl"].value,
        TypedValue::Duration(std::time::Duration::from_millis(500))
    );
    match &s.data["weights"].value {
        TypedValue::StrIntMap(map) => assert_eq!(map["bjcc"], 80),
        other => panic!("unexpected value: {other:?}"),
    }
}
