//! One-shot import of seed domains at startup.
//!
//! Directories under `<tmp_path>/init/` are domain names; their `.conf`
//! files are uploaded for any domain the store does not know yet.

use std::path::Path;

use tracing::{info, warn};

use keeper_storage::KeeperStore;

use crate::ini;

pub async fn import_init_domains(
    store: &KeeperStore,
    init_path: &Path,
    existing_domains: &[String],
) -> Vec<String> {
    let entries = match std::fs::read_dir(init_path) {
        Ok(entries) => entries,
        Err(_) => {
            info!("find no init domains under {}", init_path.display());
            return Vec::new();
        }
    };

    let mut imported = Vec::new();
    for entry in entries.flatten() {
        let domain = entry.file_name().to_string_lossy().to_string();
        if !entry.path().is_dir() || ini::ignore_file(&domain, true) {
            continue;
        }
        if existing_domains.contains(&domain) {
            continue;
        }
        let mut success = false;
        let files = match std::fs::read_dir(entry.path()) {
            Ok(files) => files,
            Err(e) => {
                warn!("read init domain {}: {}", domain, e);
                continue;
            }
        };
        for file in files.flatten() {
            let name = file.file_name().to_string_lossy().to_string();
            if file.path().is_dir() || ini::ignore_file(&name, false) {
                continue;
            }
            let content = match std::fs::read_to_string(file.path()) {
                Ok(content) => content,
                Err(e) => {
                    warn!("read init file {}/{}: {}", domain, name, e);
                    continue;
                }
            };
            let parsed = match ini::parse_conf_text(&content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("init domain {} file {} failed: {}", domain, name, e);
                    continue;
                }
            };
            let data = match ini::to_storage_map(&parsed) {
                Ok(data) => data,
                Err(e) => {
                    warn!("init domain {} file {} failed: {}", domain, name, e);
                    continue;
                }
            };
            match store
                .add_file(&domain, &format!("/{name}"), data, "keeper booting init")
                .await
            {
                Ok(()) => success = true,
                Err(e) => warn!("init domain {} file {} failed: {}", domain, name, e),
            }
        }
        if success {
            imported.push(domain);
        }
    }
    info!("init domains: {:?}", imported);
    imported
}
