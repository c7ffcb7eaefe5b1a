//! Typed configuration data and its storage encoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use keeper_common::error::Result;
use keeper_common::utils::to_camel_case;

use crate::parser::{self, TypedValue};

/// One typed configuration key. This is what gets stored (as JSON) under a
/// `(domain, file, section, key)` path and what projections are built from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfData {
    #[serde(rename = "type")]
    pub type_name: String,
    pub raw_key: String,
    pub raw_value: String,
    pub key: String,
    /// Recomputed from `(type, raw_value)` on decode, never trusted from
    /// the serialized form.
    #[serde(skip_deserializing)]
    pub value: TypedValue,
    pub struct_key: String,
    pub is_json: bool,
}

impl ConfData {
    pub fn new(raw_key: &str, raw_value: &str) -> Result<ConfData> {
        let parsed = parser::parse_key(raw_key, raw_value)?;
        let type_name = if parsed.is_json {
            to_camel_case(&parsed.type_name)
        } else {
            parsed.type_name
        };
        Ok(ConfData {
            type_name,
            raw_key: raw_key.to_string(),
            raw_value: raw_value.to_string(),
            struct_key: to_camel_case(&parsed.key),
            key: parsed.key,
            value: parsed.value,
            is_json: parsed.is_json,
        })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(blob: &str) -> Result<ConfData> {
        let mut data: ConfData = serde_json::from_str(blob)?;
        data.value = if data.is_json {
            TypedValue::Json(data.raw_value.clone())
        } else {
            parser::parse_typed(&data.type_name, &data.raw_value)?
        };
        Ok(data)
    }
}

/// Rebuild the raw key line from a normalized key and type.
pub fn raw_key(key: &str, type_name: &str) -> String {
    format!("{key} {type_name}").trim().to_string()
}

/// The per-struct slice of a node's projection: every resolved key of one
/// configuration struct at one domain version.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StructData {
    pub name: String,
    pub version: i64,
    pub data: BTreeMap<String, ConfData>,
}

impl StructData {
    pub fn new(name: String, version: i64, data: BTreeMap<String, ConfData>) -> StructData {
        StructData {
            name,
            version,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_data_new() {
        let cd = ConfData::new("max_conn int", "50").unwrap();
        assert_eq!(cd.type_name, "int");
        assert_eq!(cd.key, "max_conn");
        assert_eq!(cd.struct_key, "MaxConn");
        assert_eq!(cd.value, TypedValue::Int(50));
        assert!(!cd.is_json);
    }

    #[test]
    fn test_conf_data_json_key() {
        let cd = ConfData::new("room_setting json", r#"{"cap":10}"#).unwrap();
        assert!(cd.is_json);
        assert_eq!(cd.type_name, "RoomSetting");
        assert_eq!(cd.key, "room_setting");
        assert_eq!(cd.value, TypedValue::Json(r#"{"cap":10}"#.to_string()));
    }

    #[test]
    fn test_conf_data_encode_decode() {
        let cd = ConfData::new("hosts []string", "a,b").unwrap();
        let blob = cd.encode().unwrap();
        let decoded = ConfData::decode(&blob).unwrap();
        assert_eq!(cd, decoded);
    }

    #[test]
    fn test_conf_data_decode_recomputes_value() {
        // a blob with a stale serialized value still decodes from raw_value
        let blob = r#"{"type":"int","raw_key":"n int","raw_value":"7","key":"n","value":999,"struct_key":"N","is_json":false}"#;
        let decoded = ConfData::decode(blob).unwrap();
        assert_eq!(decoded.value, TypedValue::Int(7));
    }

    #[test]
    fn test_raw_key() {
        assert_eq!(raw_key("max_conn", "int"), "max_conn int");
        assert_eq!(raw_key("listen", ""), "listen");
    }
}
