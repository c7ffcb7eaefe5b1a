//! The configuration aggregate of one domain.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use keeper_api::conf::StructData;
use keeper_api::{ConfData, DEFAULT_SECTION};
use keeper_common::error::{KeeperError, Result};
use keeper_common::utils::struct_name;
use keeper_storage::DomainData;

use crate::files::{File, Files};
use crate::subscription::{SubscribeKind, Subscription};

/// All typed configuration of one domain. Within a manager the declared
/// type of every struct key is unique across all sections and files; a
/// conflict is fatal at load time.
pub struct ConfManager {
    files: RwLock<Files>,
}

impl ConfManager {
    pub fn new(files: Files) -> Result<ConfManager> {
        check_type_conflicts(&files)?;
        Ok(ConfManager {
            files: RwLock::new(files),
        })
    }

    pub fn from_domain_data(data: &DomainData) -> Result<ConfManager> {
        ConfManager::new(Files::from_domain_data(data))
    }

    pub fn from_event(file: &str, section: &str, blob: &str) -> Result<ConfManager> {
        ConfManager::new(Files::from_event(file, section, blob)?)
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.files.read().get_file(name).is_some()
    }

    pub fn file_list(&self) -> Vec<File> {
        self.files.read().file_list()
    }

    /// Apply a single-key update from the storage watch.
    pub fn update(&self, file: &str, section: &str, blob: &str) -> Result<()> {
        self.files.write().set_key(file, section, blob)
    }

    /// Add a file first seen through a watch event.
    pub fn new_file(&self, file: &str, section: &str, blob: &str) -> Result<()> {
        let data = ConfData::decode(blob)?;
        let mut files = self.files.write();
        if files.get_file(file).is_some() {
            return files.set_key(file, section, blob);
        }
        let mut f = File::new(file);
        f.set_key(section, data);
        files.insert(f);
        Ok(())
    }

    pub fn delete(&self, file: &str, section: &str, key: &str) -> Result<()> {
        self.files.write().del_key(file, section, key)
    }

    /// Resolve raw subscription expressions into the concrete list of
    /// section paths whose keys flow into the projection, in override
    /// order: inherited defaults shallow to deep, explicit section last.
    pub fn parse_subscribe(&self, raw_subscriptions: &[String]) -> Vec<String> {
        let files = self.files.read();
        let mut resolved = Vec::new();
        for raw in raw_subscriptions {
            let subscription = Subscription::new(raw);
            if subscription.kind() == SubscribeKind::Dir {
                continue;
            }
            for path in files.exist_paths(&subscription.involved_files()) {
                resolved.push(format!("{path}/{DEFAULT_SECTION}"));
            }
            if subscription.kind() == SubscribeKind::Section {
                resolved.push(subscription.as_str().to_string());
            }
        }
        resolved
    }

    /// Compute the projection for a resolved subscription list: group by
    /// struct name, flatten keys in order so later entries overwrite
    /// earlier ones.
    pub fn subscribe(&self, subscriptions: &[String]) -> Vec<StructData> {
        let files = self.files.read();
        let mut grouped: BTreeMap<String, BTreeMap<String, ConfData>> = BTreeMap::new();
        for path in subscriptions {
            let subscription = Subscription::new(path);
            if subscription.kind() != SubscribeKind::Section {
                continue;
            }
            let name = struct_name(&subscription.file());
            let keys = files.section_key_list(&subscription.file(), &subscription.section());
            let entry = grouped.entry(name).or_default();
            for (key, data) in keys {
                entry.insert(key, data);
            }
        }
        grouped
            .into_iter()
            .map(|(name, data)| StructData::new(name, 0, data))
            .collect()
    }
}

/// For every struct name, every key must keep one declared type across all
/// files that fold into it.
fn check_type_conflicts(files: &Files) -> Result<()> {
    let mut seen: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for file in files.iter() {
        let name = struct_name(&file.name);
        let struct_keys = seen.entry(name).or_default();
        for data in file.key_list() {
            match struct_keys.get(&data.key) {
                None => {
                    struct_keys.insert(data.key.clone(), data.type_name.clone());
                }
                Some(existing) if *existing != data.type_name => {
                    return Err(KeeperError::TypeConflict {
                        key: data.key.clone(),
                        left: existing.clone(),
                        right: data.type_name.clone(),
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn manager() -> ConfManager {
        let mut data = DomainData::new();
        insert(&mut data, "/g.conf", "DEFAULT", "listen", blob("listen", ":80"));
        insert(&mut data, "/g.conf", "node1", "listen", blob("listen", ":81"));
        insert(
            &mut data,
            "/zy/g.conf",
            "DEFAULT",
            "listen",
            blob("listen", ":90"),
        );
        insert(
            &mut data,
            "/session.conf",
            "DEFAULT",
            "max_conn",
            blob("max_conn int", "50"),
        );
        ConfManager::from_domain_data(&data).unwrap()
    }

    #[test]
    fn test_parse_subscribe_file() {
        let cm = manager();
        assert_eq!(
            cm.parse_subscribe(&["/g.conf".to_string()]),
            vec!["/g.conf/DEFAULT".to_string()]
        );
    }

    #[test]
    fn test_parse_subscribe_section_overrides_last() {
        let cm = manager();
        assert_eq!(
            cm.parse_subscribe(&["/g.conf/node1".to_string()]),
            vec!["/g.conf/DEFAULT".to_string(), "/g.conf/node1".to_string()]
        );
    }

    #[test]
    fn test_parse_subscribe_inherits_parent_files() {
        let cm = manager();
        assert_eq!(
            cm.parse_subscribe(&["/zy/g.conf".to_string()]),
            vec![
                "/g.conf/DEFAULT".to_string(),
                "/zy/g.conf/DEFAULT".to_string()
            ]
        );
    }

    #[test]
    fn test_parse_subscribe_dir_resolves_empty() {
        let cm = manager();
        assert!(cm.parse_subscribe(&["/somewhere".to_string()]).is_empty());
    }

    #[test]
    fn test_parse_subscribe_is_pure() {
        let cm = manager();
        let subs = vec!["/zy/g.conf/n".to_string(), "/session.conf".to_string()];
        assert_eq!(cm.parse_subscribe(&subs), cm.parse_subscribe(&subs));
    }

    #[test]
    fn test_subscribe_section_overrides_default() {
        let cm = manager();
        let resolved = cm.parse_subscribe(&["/g.conf/node1".to_string()]);
        let projection = cm.subscribe(&resolved);
        assert_eq!(projection.len(), 1);
        let g = &projection[0];
        assert_eq!(g.name, "G");
        assert_eq!(g.data["listen"].raw_value, ":81");
    }

    #[test]
    fn test_subscribe_groups_by_struct() {
        let cm = manager();
        let resolved = cm.parse_subscribe(&[
            "/g.conf".to_string(),
            "/session.conf".to_string(),
        ]);
        let projection = cm.subscribe(&resolved);
        let names: Vec<&str> = projection.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["G", "Session"]);
    }

    #[test]
    fn test_type_conflict_is_fatal() {
        let mut data = DomainData::new();
        insert(&mut data, "/g.conf", "DEFAULT", "port", blob("port int", "80"));
        insert(
            &mut data,
            "/zy/g.conf",
            "DEFAULT",
            "port",
            blob("port", "eighty"),
        );
        let err = ConfManager::from_domain_data(&data).unwrap_err();
        assert!(err.to_string().contains("key port type conflict"));
    }

    #[test]
    fn test_update_and_delete() {
        let cm = manager();
        cm.update("/g.conf", "DEFAULT", &blob("debug bool", "true"))
            .unwrap();
        let projection = cm.subscribe(&cm.parse_subscribe(&["/g.conf".to_string()]));
        assert!(projection[0].data.contains_key("debug"));
        cm.delete("/g.conf", "DEFAULT", "debug").unwrap();
        let projection = cm.subscribe(&cm.parse_subscribe(&["/g.conf".to_string()]));
        assert!(!projection[0].data.contains_key("debug"));
    }

    #[test]
    fn test_new_file_via_event() {
        let cm = manager();
        cm.new_file("/fresh.conf", "DEFAULT", &blob("a int", "1"))
            .unwrap();
        assert!(cm.has_file("/fresh.conf"));
    }
}
