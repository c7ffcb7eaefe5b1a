//! The typed-value parser.
//!
//! Configuration keys declare their type inline (`max_conn int = 50`); this
//! module turns `(raw_key, raw_value)` into a typed value and re-encodes
//! typed values back into raw text. Parsing is total on well-formed input
//! and deterministic; `parse(encode(v)) == v` for every parseable `v`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use keeper_common::error::{KeeperError, Result};

/// A parsed configuration value. Map variants use ordered containers so
/// re-encoding is deterministic.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedValue {
    Bool(bool),
    Int(i64),
    Int64(i64),
    Float(f64),
    Str(String),
    StrSlice(Vec<String>),
    IntSlice(Vec<i64>),
    Int64Slice(Vec<i64>),
    FloatSlice(Vec<f64>),
    BoolSlice(Vec<bool>),
    StrMap(BTreeMap<String, String>),
    StrListMap(BTreeMap<String, Vec<String>>),
    StrIntMap(BTreeMap<String, i64>),
    StrBoolMap(BTreeMap<String, bool>),
    StrSet(BTreeSet<String>),
    IntStrMap(BTreeMap<i64, String>),
    IntIntMap(BTreeMap<i64, i64>),
    IntBoolMap(BTreeMap<i64, bool>),
    IntSet(BTreeSet<i64>),
    Duration(Duration),
    /// Value is an opaque JSON document; the key name is the type name.
    Json(String),
}

impl Default for TypedValue {
    fn default() -> Self {
        TypedValue::Str(String::new())
    }
}

impl Serialize for TypedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            TypedValue::Bool(v) => serializer.serialize_bool(*v),
            TypedValue::Int(v) | TypedValue::Int64(v) => serializer.serialize_i64(*v),
            TypedValue::Float(v) => serializer.serialize_f64(*v),
            TypedValue::Str(v) | TypedValue::Json(v) => serializer.serialize_str(v),
            TypedValue::StrSlice(v) => v.serialize(serializer),
            TypedValue::IntSlice(v) | TypedValue::Int64Slice(v) => v.serialize(serializer),
            TypedValue::FloatSlice(v) => v.serialize(serializer),
            TypedValue::BoolSlice(v) => v.serialize(serializer),
            TypedValue::StrMap(v) => v.serialize(serializer),
            TypedValue::StrListMap(v) => v.serialize(serializer),
            TypedValue::StrIntMap(v) => v.serialize(serializer),
            TypedValue::StrBoolMap(v) => v.serialize(serializer),
            TypedValue::IntStrMap(v) => v.serialize(serializer),
            TypedValue::IntIntMap(v) => v.serialize(serializer),
            TypedValue::IntBoolMap(v) => v.serialize(serializer),
            TypedValue::StrSet(v) => {
                let mut map = serializer.serialize_map(Some(v.len()))?;
                for k in v {
                    map.serialize_entry(k, &serde_json::json!({}))?;
                }
                map.end()
            }
            TypedValue::IntSet(v) => {
                let mut map = serializer.serialize_map(Some(v.len()))?;
                for k in v {
                    map.serialize_entry(k, &serde_json::json!({}))?;
                }
                map.end()
            }
            TypedValue::Duration(d) => {
                serializer.serialize_str(&humantime::format_duration(*d).to_string())
            }
        }
    }
}

/// Result of parsing a raw key line.
pub struct ParsedKey {
    pub type_name: String,
    pub key: String,
    pub value: TypedValue,
    pub is_json: bool,
}

/// Parse a raw key (`name` or `name type`) and its raw value.
///
/// A bare name is a `string` key. The literal type `json` marks the value
/// as an opaque JSON document whose type name is the key name itself.
pub fn parse_key(raw_key: &str, raw_value: &str) -> Result<ParsedKey> {
    let fields: Vec<&str> = raw_key.split_whitespace().collect();
    match fields.len() {
        1 => Ok(ParsedKey {
            type_name: "string".to_string(),
            key: fields[0].to_string(),
            value: TypedValue::Str(raw_value.to_string()),
            is_json: false,
        }),
        2 if fields[1] == "json" => Ok(ParsedKey {
            type_name: fields[0].to_string(),
            key: fields[0].to_string(),
            value: TypedValue::Json(raw_value.to_string()),
            is_json: true,
        }),
        2 => {
            let type_name = fields[1];
            let value = parse_typed(type_name, raw_value).map_err(|e| KeeperError::KeyParse {
                key: raw_key.to_string(),
                value: raw_value.to_string(),
                reason: e.to_string(),
            })?;
            Ok(ParsedKey {
                type_name: type_name.to_string(),
                key: fields[0].to_string(),
                value,
                is_json: false,
            })
        }
        _ => Err(KeeperError::KeyParse {
            key: raw_key.to_string(),
            value: raw_value.to_string(),
            reason: "key invalid".to_string(),
        }),
    }
}

/// Parse a raw value under a declared type.
pub fn parse_typed(type_name: &str, value: &str) -> Result<TypedValue> {
    let parsed = match type_name {
        "string" => TypedValue::Str(value.to_string()),
        "bool" => TypedValue::Bool(parse_bool(value)?),
        "int" => TypedValue::Int(parse_int(value)?),
        "int64" => TypedValue::Int64(parse_int(value)?),
        "float64" => TypedValue::Float(parse_float(value)?),
        "[]string" => TypedValue::StrSlice(if value.is_empty() {
            Vec::new()
        } else {
            value.split(',').map(str::to_string).collect()
        }),
        "[]int" => TypedValue::IntSlice(parse_int_slice(value)?),
        "[]int64" => TypedValue::Int64Slice(parse_int_slice(value)?),
        "[]float64" => TypedValue::FloatSlice(parse_slice(value, parse_float)?),
        "[]bool" => TypedValue::BoolSlice(parse_slice(value, parse_bool)?),
        "map[string]string" => TypedValue::StrMap(parse_map(
            value,
            type_name,
            |k| Ok(k.to_string()),
            |v| Ok(v.to_string()),
        )?),
        "map[string][]string" => TypedValue::StrListMap(parse_str_list_map(value)?),
        "map[string]int" => TypedValue::StrIntMap(parse_map(
            value,
            type_name,
            |k| Ok(k.to_string()),
            parse_int,
        )?),
        "map[string]bool" => {
            TypedValue::StrBoolMap(parse_bool_map(value, |k| Ok(k.to_string()))?)
        }
        "map[string]struct{}" => TypedValue::StrSet(if value.is_empty() {
            BTreeSet::new()
        } else {
            value.split(',').map(str::to_string).collect()
        }),
        "map[int]string" => {
            TypedValue::IntStrMap(parse_map(value, type_name, parse_int, |v| Ok(v.to_string()))?)
        }
        "map[int]int" => TypedValue::IntIntMap(parse_map(value, type_name, parse_int, parse_int)?),
        "map[int]bool" => TypedValue::IntBoolMap(parse_int_bool_map(value)?),
        "map[int]struct{}" => TypedValue::IntSet(parse_int_set(value)?),
        "duration" => TypedValue::Duration(
            humantime::parse_duration(value)
                .map_err(|e| KeeperError::KeyParse {
                    key: String::new(),
                    value: value.to_string(),
                    reason: e.to_string(),
                })?,
        ),
        _ => return Err(KeeperError::TypeUnsupported(type_name.to_string())),
    };
    Ok(parsed)
}

/// Encode a typed value back into raw text. The inverse of [`parse_typed`]
/// up to value equality.
pub fn encode_typed(value: &TypedValue) -> String {
    match value {
        TypedValue::Bool(v) => v.to_string(),
        TypedValue::Int(v) | TypedValue::Int64(v) => v.to_string(),
        TypedValue::Float(v) => format_float(*v),
        TypedValue::Str(v) | TypedValue::Json(v) => v.clone(),
        TypedValue::StrSlice(v) => v.join(","),
        TypedValue::IntSlice(v) | TypedValue::Int64Slice(v) => join(v.iter()),
        TypedValue::FloatSlice(v) => v
            .iter()
            .map(|f| format_float(*f))
            .collect::<Vec<_>>()
            .join(","),
        TypedValue::BoolSlice(v) => join(v.iter()),
        TypedValue::StrMap(m) => join_entries(m.iter()),
        TypedValue::StrIntMap(m) => join_entries(m.iter()),
        TypedValue::IntStrMap(m) => join_entries(m.iter()),
        TypedValue::IntIntMap(m) => join_entries(m.iter()),
        TypedValue::StrListMap(m) => m
            .iter()
            .map(|(k, v)| format!("{k}:{}", v.join(",")))
            .collect::<Vec<_>>()
            .join(";"),
        TypedValue::StrBoolMap(m) => m
            .iter()
            .map(|(k, v)| bool_entry(k, *v))
            .collect::<Vec<_>>()
            .join(","),
        TypedValue::IntBoolMap(m) => m
            .iter()
            .map(|(k, v)| bool_entry(k, *v))
            .collect::<Vec<_>>()
            .join(","),
        TypedValue::StrSet(s) => s.iter().cloned().collect::<Vec<_>>().join(","),
        TypedValue::IntSet(s) => join(s.iter()),
        TypedValue::Duration(d) => humantime::format_duration(*d).to_string(),
    }
}

fn format_float(v: f64) -> String {
    // `{}` prints 2.0 as "2"; keep the shortest text that parses back
    format!("{v}")
}

fn join<T: ToString>(items: impl Iterator<Item = T>) -> String {
    items.map(|v| v.to_string()).collect::<Vec<_>>().join(",")
}

fn join_entries<K: ToString, V: ToString>(entries: impl Iterator<Item = (K, V)>) -> String {
    entries
        .map(|(k, v)| format!("{}:{}", k.to_string(), v.to_string()))
        .collect::<Vec<_>>()
        .join(",")
}

fn bool_entry<K: ToString>(key: &K, value: bool) -> String {
    if value {
        key.to_string()
    } else {
        format!("{}:false", key.to_string())
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(KeeperError::InvalidArgument(format!(
            "invalid bool: {value}"
        ))),
    }
}

fn parse_int(value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|e| KeeperError::InvalidArgument(format!("invalid int {value}: {e}")))
}

fn parse_float(value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|e| KeeperError::InvalidArgument(format!("invalid float {value}: {e}")))
}

fn parse_slice<T>(value: &str, parse: impl Fn(&str) -> Result<T>) -> Result<Vec<T>> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    value.split(',').map(parse).collect()
}

fn parse_int_slice(value: &str) -> Result<Vec<i64>> {
    parse_slice(value, parse_int)
}

fn parse_int_set(value: &str) -> Result<BTreeSet<i64>> {
    if value.is_empty() {
        return Ok(BTreeSet::new());
    }
    value.split(',').map(parse_int).collect()
}

fn parse_map<K: Ord, V>(
    value: &str,
    type_name: &str,
    parse_key: impl Fn(&str) -> Result<K>,
    parse_value: impl Fn(&str) -> Result<V>,
) -> Result<BTreeMap<K, V>> {
    if value.is_empty() {
        return Ok(BTreeMap::new());
    }
    let mut map = BTreeMap::new();
    for entry in value.split(',') {
        let (k, v) = entry.split_once(':').ok_or_else(|| {
            KeeperError::InvalidArgument(format!("key type {type_name} format invalid: {entry}"))
        })?;
        map.insert(parse_key(k)?, parse_value(v)?);
    }
    Ok(map)
}

fn parse_str_list_map(value: &str) -> Result<BTreeMap<String, Vec<String>>> {
    if value.is_empty() {
        return Ok(BTreeMap::new());
    }
    let mut map = BTreeMap::new();
    for entry in value.split(';') {
        let (k, v) = entry.split_once(':').ok_or_else(|| {
            KeeperError::InvalidArgument(format!(
                "key type map[string][]string format invalid: {entry}"
            ))
        })?;
        map.insert(k.to_string(), v.split(',').map(str::to_string).collect());
    }
    Ok(map)
}

/// Bool maps accept a bare key as shorthand for `key:true`.
fn parse_bool_map<K: Ord>(
    value: &str,
    parse_key: impl Fn(&str) -> Result<K>,
) -> Result<BTreeMap<K, bool>> {
    if value.is_empty() {
        return Ok(BTreeMap::new());
    }
    let mut map = BTreeMap::new();
    for entry in value.split(',') {
        let (key, val) = split_bool_entry(entry);
        map.insert(parse_key(key)?, val);
    }
    Ok(map)
}

fn parse_int_bool_map(value: &str) -> Result<BTreeMap<i64, bool>> {
    if value.is_empty() {
        return Ok(BTreeMap::new());
    }
    let mut map = BTreeMap::new();
    for entry in value.split(',') {
        let (key, val) = split_bool_entry(entry);
        // unparseable int keys are skipped
        if let Ok(k) = parse_int(key) {
            map.insert(k, val);
        }
    }
    Ok(map)
}

fn split_bool_entry(entry: &str) -> (&str, bool) {
    if let Some((k, v)) = entry.split_once(':')
        && let Ok(b) = parse_bool(v)
    {
        return (k, b);
    }
    (entry, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_key_is_string() {
        let parsed = parse_key("listen", ":80").unwrap();
        assert_eq!(parsed.type_name, "string");
        assert_eq!(parsed.key, "listen");
        assert_eq!(parsed.value, TypedValue::Str(":80".to_string()));
        assert!(!parsed.is_json);
    }

    #[test]
    fn test_parse_typed_key() {
        let parsed = parse_key("max_conn int", "50").unwrap();
        assert_eq!(parsed.type_name, "int");
        assert_eq!(parsed.key, "max_conn");
        assert_eq!(parsed.value, TypedValue::Int(50));
    }

    #[test]
    fn test_parse_json_key() {
        let parsed = parse_key("room_setting json", r#"{"cap":10}"#).unwrap();
        assert!(parsed.is_json);
        assert_eq!(parsed.key, "room_setting");
        assert_eq!(parsed.type_name, "room_setting");
        assert_eq!(parsed.value, TypedValue::Json(r#"{"cap":10}"#.to_string()));
    }

    #[test]
    fn test_parse_invalid_key_shape() {
        assert!(parse_key("a b c", "1").is_err());
        assert!(parse_key("", "1").is_err());
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = parse_key("x map[bool]bool", "a:b").unwrap_err();
        assert!(err.to_string().contains("type unsupport"));
    }

    #[test]
    fn test_parse_scalars() {
        assert_eq!(parse_typed("bool", "true").unwrap(), TypedValue::Bool(true));
        assert_eq!(parse_typed("int", "-3").unwrap(), TypedValue::Int(-3));
        assert_eq!(
            parse_typed("int64", "9000000000").unwrap(),
            TypedValue::Int64(9000000000)
        );
        assert_eq!(
            parse_typed("float64", "1.5").unwrap(),
            TypedValue::Float(1.5)
        );
        assert!(parse_typed("int", "x").is_err());
    }

    #[test]
    fn test_parse_slices() {
        assert_eq!(
            parse_typed("[]string", "a,b").unwrap(),
            TypedValue::StrSlice(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            parse_typed("[]int", "1,2,3").unwrap(),
            TypedValue::IntSlice(vec![1, 2, 3])
        );
        assert_eq!(
            parse_typed("[]bool", "true,false").unwrap(),
            TypedValue::BoolSlice(vec![true, false])
        );
    }

    #[test]
    fn test_empty_input_parses_to_empty_container() {
        assert_eq!(parse_typed("[]int", "").unwrap(), TypedValue::IntSlice(vec![]));
        assert_eq!(
            parse_typed("map[string]string", "").unwrap(),
            TypedValue::StrMap(BTreeMap::new())
        );
        assert_eq!(
            parse_typed("map[int]struct{}", "").unwrap(),
            TypedValue::IntSet(BTreeSet::new())
        );
    }

    #[test]
    fn test_parse_maps() {
        assert_eq!(
            parse_typed("map[string]string", "a:1,b:2").unwrap(),
            TypedValue::StrMap(BTreeMap::from([
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]))
        );
        assert_eq!(
            parse_typed("map[int]int", "1:10,2:20").unwrap(),
            TypedValue::IntIntMap(BTreeMap::from([(1, 10), (2, 20)]))
        );
        assert!(parse_typed("map[string]string", "nocolon").is_err());
    }

    #[test]
    fn test_parse_str_list_map_uses_semicolons() {
        assert_eq!(
            parse_typed("map[string][]string", "a:1,2;b:3").unwrap(),
            TypedValue::StrListMap(BTreeMap::from([
                ("a".to_string(), vec!["1".to_string(), "2".to_string()]),
                ("b".to_string(), vec!["3".to_string()]),
            ]))
        );
    }

    #[test]
    fn test_parse_bool_map_defaults_true() {
        assert_eq!(
            parse_typed("map[string]bool", "a,b:false").unwrap(),
            TypedValue::StrBoolMap(BTreeMap::from([
                ("a".to_string(), true),
                ("b".to_string(), false),
            ]))
        );
        // bad int keys are skipped, not fatal
        assert_eq!(
            parse_typed("map[int]bool", "1,x,2:false").unwrap(),
            TypedValue::IntBoolMap(BTreeMap::from([(1, true), (2, false)]))
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_typed("duration", "500ms").unwrap(),
            TypedValue::Duration(Duration::from_millis(500))
        );
        assert_eq!(
            parse_typed("duration", "2h45m").unwrap(),
            TypedValue::Duration(Duration::from_secs(2 * 3600 + 45 * 60))
        );
    }

    #[test]
    fn test_roundtrip_all_types() {
        let cases = [
            ("bool", "true"),
            ("int", "42"),
            ("int64", "-7"),
            ("float64", "2.5"),
            ("string", "hello world"),
            ("[]string", "a,b,c"),
            ("[]int", "1,2"),
            ("[]int64", "3,4"),
            ("[]float64", "0.5,1.5"),
            ("[]bool", "true,false"),
            ("map[string]string", "a:1,b:2"),
            ("map[string][]string", "a:1,2;b:3"),
            ("map[string]int", "a:1"),
            ("map[string]bool", "a,b:false"),
            ("map[string]struct{}", "x,y"),
            ("map[int]string", "1:a"),
            ("map[int]int", "1:2"),
            ("map[int]bool", "1,2:false"),
            ("map[int]struct{}", "1,2"),
            ("duration", "1s"),
        ];
        for (type_name, raw) in cases {
            let value = parse_typed(type_name, raw).unwrap();
            let encoded = encode_typed(&value);
            let reparsed = parse_typed(type_name, &encoded)
                .unwrap_or_else(|e| panic!("reparse {type_name} {encoded:?}: {e}"));
            assert_eq!(value, reparsed, "roundtrip failed for {type_name}");
        }
    }

    #[test]
    fn test_roundtrip_empty_containers() {
        for type_name in ["[]int", "map[string]string", "map[int]struct{}"] {
            let value = parse_typed(type_name, "").unwrap();
            let reparsed = parse_typed(type_name, &encode_typed(&value)).unwrap();
            assert_eq!(value, reparsed);
        }
    }
}
