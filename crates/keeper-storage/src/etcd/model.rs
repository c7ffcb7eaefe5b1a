//! Version records and the nested diff used by rollback and reconciliation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use keeper_common::error::Result;

/// `file -> section -> key -> encoded ConfData blob`
pub type DomainData = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

/// The current-version pointer of a domain: its logical version and the
/// backend revision whose snapshot the version names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainVersion {
    pub version: i64,
    pub package_version: i64,
}

impl DomainVersion {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(data: &str) -> Result<DomainVersion> {
        Ok(serde_json::from_str(data)?)
    }
}

/// One append-only version-history entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Recode {
    pub id: i64,
    pub domain: String,
    pub version: i64,
    pub package_version: i64,
    pub note: String,
    pub timestamp: i64,
}

impl Recode {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(data: &str) -> Result<Recode> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Entries of `left` that are missing from `right`; with `need_correction`
/// also entries whose value differs. `rollback` and the janitor compute the
/// put-set as `map_diff(snapshot, latest, true)` and the delete-set as
/// `map_diff(latest, snapshot, false)`.
pub fn map_diff(left: &DomainData, right: &DomainData, need_correction: bool) -> DomainData {
    let mut diff = DomainData::new();
    for (file, left_sections) in left {
        let Some(right_sections) = right.get(file) else {
            diff.insert(file.clone(), left_sections.clone());
            continue;
        };
        let mut section_diff = BTreeMap::new();
        for (section, left_keys) in left_sections {
            let Some(right_keys) = right_sections.get(section) else {
                section_diff.insert(section.clone(), left_keys.clone());
                continue;
            };
            let mut key_diff = BTreeMap::new();
            for (key, left_value) in left_keys {
                match right_keys.get(key) {
                    None => {
                        key_diff.insert(key.clone(), left_value.clone());
                    }
                    Some(right_value) if need_correction && right_value != left_value => {
                        key_diff.insert(key.clone(), left_value.clone());
                    }
                    Some(_) => {}
                }
            }
            if !key_diff.is_empty() {
                section_diff.insert(section.clone(), key_diff);
            }
        }
        if !section_diff.is_empty() {
            diff.insert(file.clone(), section_diff);
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(entries: &[(&str, &str, &str, &str)]) -> DomainData {
        let mut out = DomainData::new();
        for (file, section, key, value) in entries {
            out.entry(file.to_string())
                .or_default()
                .entry(section.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
        out
    }

    #[test]
    fn test_domain_version_roundtrip() {
        let dv = DomainVersion {
            version: 3,
            package_version: 117,
        };
        assert_eq!(DomainVersion::decode(&dv.encode().unwrap()).unwrap(), dv);
    }

    #[test]
    fn test_recode_roundtrip() {
        let recode = Recode {
            id: 4,
            domain: "live".to_string(),
            version: 4,
            package_version: 120,
            note: "rollback to version:2".to_string(),
            timestamp: 1700000000,
        };
        assert_eq!(Recode::decode(&recode.encode().unwrap()).unwrap(), recode);
    }

    #[test]
    fn test_map_diff_identical_is_empty() {
        let snapshot = data(&[("/g.conf", "DEFAULT", "listen", ":80")]);
        assert!(map_diff(&snapshot, &snapshot, true).is_empty());
        assert!(map_diff(&snapshot, &snapshot, false).is_empty());
    }

    #[test]
    fn test_map_diff_detects_changed_value_only_with_correction() {
        let snapshot = data(&[("/g.conf", "DEFAULT", "listen", ":80")]);
        let latest = data(&[("/g.conf", "DEFAULT", "listen", ":81")]);
        let puts = map_diff(&snapshot, &latest, true);
        assert_eq!(puts["/g.conf"]["DEFAULT"]["listen"], ":80");
        // the delete pass only reports keys that vanished entirely
        assert!(map_diff(&latest, &snapshot, false).is_empty());
    }

    #[test]
    fn test_map_diff_missing_levels() {
        let snapshot = data(&[
            ("/g.conf", "DEFAULT", "listen", ":80"),
            ("/s.conf", "node1", "port", "1"),
        ]);
        let latest = data(&[("/g.conf", "DEFAULT", "listen", ":80")]);
        let puts = map_diff(&snapshot, &latest, true);
        assert_eq!(puts.len(), 1);
        assert_eq!(puts["/s.conf"]["node1"]["port"], "1");

        // a key added after the snapshot shows up in the delete pass
        let latest = data(&[
            ("/g.conf", "DEFAULT", "listen", ":80"),
            ("/g.conf", "DEFAULT", "debug", "true"),
        ]);
        let deletes = map_diff(&latest, &snapshot, false);
        assert_eq!(deletes["/g.conf"]["DEFAULT"]["debug"], "true");
    }
}
