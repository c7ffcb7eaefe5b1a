//! Admin operate records: one entry per add/update/delete of a typed key.

use serde::{Deserialize, Serialize};

pub const DEFAULT_SECTION: &str = "DEFAULT";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
    #[default]
    Get,
    Add,
    Update,
    Delete,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Operate {
    pub opcode: Opcode,
    pub domain: String,
    pub file: String,
    pub section: String,
    pub key: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: String,
    pub note: String,
    pub id: i64,
    pub version: i64,
}

impl Operate {
    /// Normalise: files are absolute paths, the unnamed section is DEFAULT.
    pub fn format(&mut self) {
        if !self.file.starts_with('/') {
            self.file = format!("/{}", self.file);
        }
        if self.section.is_empty() {
            self.section = DEFAULT_SECTION.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_normalises() {
        let mut op = Operate {
            opcode: Opcode::Add,
            file: "global.conf".to_string(),
            ..Default::default()
        };
        op.format();
        assert_eq!(op.file, "/global.conf");
        assert_eq!(op.section, DEFAULT_SECTION);

        let mut op = Operate {
            file: "/a/b.conf".to_string(),
            section: "node1".to_string(),
            ..Default::default()
        };
        op.format();
        assert_eq!(op.file, "/a/b.conf");
        assert_eq!(op.section, "node1");
    }

    #[test]
    fn test_opcode_serde_lowercase() {
        let json = serde_json::to_string(&Opcode::Update).unwrap();
        assert_eq!(json, r#""update""#);
        let op: Operate = serde_json::from_str(
            r#"{"opcode":"add","file":"g.conf","key":"listen","type":"string","value":":80"}"#,
        )
        .unwrap();
        assert_eq!(op.opcode, Opcode::Add);
        assert_eq!(op.type_name, "string");
    }
}
