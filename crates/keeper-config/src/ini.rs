//! Parser for the `.conf` dialect used by configuration uploads.
//!
//! Sections are `[name]` blocks; keys before the first header land in
//! `DEFAULT`. A key line is `name[ type] = raw-value` with `=` or `:` as
//! the delimiter. Comments start with `#` or `;`.

use std::collections::BTreeMap;

use keeper_api::{ConfData, DEFAULT_SECTION};
use keeper_common::error::{KeeperError, Result};

use crate::files::{File, Section};
use crate::subscription::has_conf_suffix;

/// Parse a whole `.conf` document into a [`File`]. Any malformed key line
/// fails the parse; uploads are validated atomically.
pub fn parse_conf_text(content: &str) -> Result<File> {
    let mut file = File::new("");
    let mut section = Section::new(DEFAULT_SECTION);

    for (lineno, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            let name = line
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| {
                    KeeperError::InvalidArgument(format!(
                        "line {}: bad section header: {line}",
                        lineno + 1
                    ))
                })?;
            file.sections.push(section);
            section = Section::new(name);
            continue;
        }
        let (raw_key, raw_value) = split_key_line(line).ok_or_else(|| {
            KeeperError::InvalidArgument(format!("line {}: missing delimiter: {line}", lineno + 1))
        })?;
        section.set(ConfData::new(raw_key, raw_value)?);
    }
    file.sections.push(section);
    Ok(file)
}

/// Split on the first `=` or `:` delimiter. The type token never contains
/// either, so the earliest occurrence separates key from value.
fn split_key_line(line: &str) -> Option<(&str, &str)> {
    let pos = line.find(['=', ':'])?;
    let key = line[..pos].trim();
    let mut value = line[pos + 1..].trim();
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        value = &value[1..value.len() - 1];
    }
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

/// Encode a parsed file into the storage shape: section -> key -> blob.
pub fn to_storage_map(file: &File) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
    let mut out = BTreeMap::new();
    for section in &file.sections {
        let mut keys = BTreeMap::new();
        for (key, data) in &section.keys {
            keys.insert(key.clone(), data.encode()?);
        }
        out.insert(section.name.clone(), keys);
    }
    Ok(out)
}

/// Whether an uploaded file name should be rejected: hidden names and
/// anything without the `.conf` suffix.
pub fn ignore_file(name: &str, is_dir: bool) -> bool {
    if name.is_empty() || name.starts_with('.') {
        return true;
    }
    !is_dir && !has_conf_suffix(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_api::TypedValue;

    #[test]
    fn test_parse_sections_and_default() {
        let file = parse_conf_text(
            "# global\nlisten string = :80\n\n[node1]\nlisten = :81\nmax_conn int = 10\n",
        )
        .unwrap();
        assert_eq!(file.sections.len(), 2);
        assert_eq!(file.sections[0].name, DEFAULT_SECTION);
        assert_eq!(file.sections[0].keys["listen"].raw_value, ":80");
        assert_eq!(file.sections[1].name, "node1");
        assert_eq!(
            file.sections[1].keys["max_conn"].value,
            TypedValue::Int(10)
        );
    }

    #[test]
    fn test_colon_delimiter_and_comments() {
        let file = parse_conf_text("; note\nlisten : :80\n").unwrap();
        assert_eq!(file.sections[0].keys["listen"].raw_value, ":80");
    }

    #[test]
    fn test_quoted_value() {
        let file = parse_conf_text("greeting = \" hello \"\n").unwrap();
        assert_eq!(file.sections[0].keys["greeting"].raw_value, " hello ");
    }

    #[test]
    fn test_typed_keys() {
        let file =
            parse_conf_text("hosts []string = a,b\nttl duration = 5s\nrooms room json = x\n");
        // "rooms room json" has three tokens, invalid
        assert!(file.is_err());

        let file = parse_conf_text("room json = {\"cap\":1}\n").unwrap();
        let cd = &file.sections[0].keys["room"];
        assert!(cd.is_json);
        assert_eq!(cd.type_name, "Room");
    }

    #[test]
    fn test_malformed_lines_fail() {
        assert!(parse_conf_text("no delimiter here\n").is_err());
        assert!(parse_conf_text("[unclosed\n").is_err());
        assert!(parse_conf_text("port int = eighty\n").is_err());
    }

    #[test]
    fn test_to_storage_map_roundtrip() {
        let file = parse_conf_text("listen = :80\n[n1]\nport int = 9\n").unwrap();
        let map = to_storage_map(&file).unwrap();
        assert_eq!(map.len(), 2);
        let decoded = ConfData::decode(&map["n1"]["port"]).unwrap();
        assert_eq!(decoded.value, TypedValue::Int(9));
    }

    #[test]
    fn test_ignore_file() {
        assert!(ignore_file(".hidden.conf", false));
        assert!(ignore_file("notes.txt", false));
        assert!(!ignore_file("global.conf", false));
        assert!(!ignore_file("subdir", true));
    }
}
