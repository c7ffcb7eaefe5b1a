//! Files and sections of typed configuration keys.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use keeper_api::ConfData;
use keeper_common::error::{KeeperError, Result};
use keeper_storage::DomainData;

/// An ordered collection of keys under one `[name]` block.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Section {
    pub name: String,
    pub keys: BTreeMap<String, ConfData>,
}

impl Section {
    pub fn new(name: &str) -> Section {
        Section {
            name: name.to_string(),
            keys: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, data: ConfData) {
        self.keys.insert(data.key.clone(), data);
    }

    pub fn delete_key(&mut self, key: &str) {
        self.keys.remove(key);
    }
}

/// One configuration file: an absolute `.conf` path and its sections.
#[derive(Clone, Debug, Default, Serialize)]
pub struct File {
    pub name: String,
    pub sections: Vec<Section>,
}

impl File {
    pub fn new(name: &str) -> File {
        File {
            name: name.to_string(),
            sections: Vec::new(),
        }
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn key_data(&self, section: &str, key: &str) -> Result<ConfData> {
        let section = self
            .section(section)
            .ok_or_else(|| KeeperError::not_found("section", section))?;
        section
            .keys
            .values()
            .find(|cd| cd.key == key)
            .cloned()
            .ok_or_else(|| KeeperError::not_found("key", key))
    }

    pub fn key_list(&self) -> Vec<&ConfData> {
        self.sections
            .iter()
            .flat_map(|s| s.keys.values())
            .collect()
    }

    pub fn set_key(&mut self, section: &str, data: ConfData) {
        match self.sections.iter_mut().find(|s| s.name == section) {
            Some(s) => s.set(data),
            None => {
                let mut s = Section::new(section);
                s.set(data);
                self.sections.push(s);
            }
        }
    }

    pub fn del_key(&mut self, section: &str, key: &str) {
        if let Some(s) = self.sections.iter_mut().find(|s| s.name == section) {
            s.delete_key(key);
        }
    }
}

/// All files of one domain, indexed by path.
#[derive(Clone, Debug, Default)]
pub struct Files {
    files: BTreeMap<String, File>,
}

impl Files {
    /// Build from a domain snapshot of encoded blobs. Keys that fail to
    /// decode are logged and skipped.
    pub fn from_domain_data(data: &DomainData) -> Files {
        let mut files = Files::default();
        for (file_name, sections) in data {
            let mut file = File::new(file_name);
            for (section_name, keys) in sections {
                let mut section = Section::new(section_name);
                for (key, blob) in keys {
                    match ConfData::decode(blob) {
                        Ok(cd) => section.set(cd),
                        Err(e) => warn!("decode key {} of {}: {}", key, file_name, e),
                    }
                }
                file.sections.push(section);
            }
            files.insert(file);
        }
        files
    }

    /// A single-key view, used when a watch event arrives for a file the
    /// manager has not seen yet.
    pub fn from_event(file: &str, section: &str, blob: &str) -> Result<Files> {
        let data = ConfData::decode(blob)?;
        let mut f = File::new(file);
        f.set_key(section, data);
        let mut files = Files::default();
        files.insert(f);
        Ok(files)
    }

    pub fn insert(&mut self, file: File) {
        self.files.insert(file.name.clone(), file);
    }

    pub fn get_file(&self, name: &str) -> Option<&File> {
        self.files.get(name)
    }

    pub fn set_key(&mut self, file: &str, section: &str, key_blob: &str) -> Result<()> {
        let data = ConfData::decode(key_blob)?;
        let f = self
            .files
            .get_mut(file)
            .ok_or_else(|| KeeperError::not_found("file", file))?;
        f.set_key(section, data);
        Ok(())
    }

    pub fn del_key(&mut self, file: &str, section: &str, key: &str) -> Result<()> {
        let f = self
            .files
            .get_mut(file)
            .ok_or_else(|| KeeperError::not_found("file", file))?;
        f.del_key(section, key);
        Ok(())
    }

    pub fn section_key_list(&self, file: &str, section: &str) -> BTreeMap<String, ConfData> {
        self.get_file(file)
            .and_then(|f| f.section(section))
            .map(|s| s.keys.clone())
            .unwrap_or_default()
    }

    pub fn file_list(&self) -> Vec<File> {
        self.files.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &File> {
        self.files.values()
    }

    /// Filter to the paths that exist in this set, preserving order.
    pub fn exist_paths(&self, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .filter(|p| self.files.contains_key(*p))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(raw_key: &str, raw_value: &str) -> String {
        ConfData::new(raw_key, raw_value).unwrap().encode().unwrap()
    }

    fn sample() -> Files {
        let mut data = DomainData::new();
        data.entry("/g.conf".to_string())
            .or_default()
            .entry("DEFAULT".to_string())
            .or_default()
            .insert("listen".to_string(), blob("listen", ":80"));
        data.entry("/g.conf".to_string())
            .or_default()
            .entry("node1".to_string())
            .or_default()
            .insert("listen".to_string(), blob("listen", ":81"));
        Files::from_domain_data(&data)
    }

    #[test]
    fn test_from_domain_data() {
        let files = sample();
        let file = files.get_file("/g.conf").unwrap();
        assert_eq!(file.sections.len(), 2);
        assert_eq!(
            file.key_data("node1", "listen").unwrap().raw_value,
            ":81"
        );
    }

    #[test]
    fn test_undecodable_blob_is_skipped() {
        let mut data = DomainData::new();
        data.entry("/g.conf".to_string())
            .or_default()
            .entry("DEFAULT".to_string())
            .or_default()
            .insert("bad".to_string(), "not json".to_string());
        data.get_mut("/g.conf")
            .unwrap()
            .get_mut("DEFAULT")
            .unwrap()
            .insert("listen".to_string(), blob("listen", ":80"));
        let files = Files::from_domain_data(&data);
        let keys = files.section_key_list("/g.conf", "DEFAULT");
        assert_eq!(keys.len(), 1);
        assert!(keys.contains_key("listen"));
    }

    #[test]
    fn test_set_and_del_key() {
        let mut files = sample();
        files
            .set_key("/g.conf", "DEFAULT", &blob("debug bool", "true"))
            .unwrap();
        assert!(
            files
                .section_key_list("/g.conf", "DEFAULT")
                .contains_key("debug")
        );
        files.del_key("/g.conf", "DEFAULT", "debug").unwrap();
        assert!(
            !files
                .section_key_list("/g.conf", "DEFAULT")
                .contains_key("debug")
        );
        assert!(files.set_key("/missing.conf", "DEFAULT", &blob("a", "1")).is_err());
    }

    #[test]
    fn test_exist_paths() {
        let files = sample();
        let paths = vec!["/g.conf".to_string(), "/other.conf".to_string()];
        assert_eq!(files.exist_paths(&paths), vec!["/g.conf".to_string()]);
    }
}
