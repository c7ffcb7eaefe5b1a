//! Events emitted by the storage watch.

use std::str::FromStr;

/// What the watch follows: per-key configuration changes, or only the
/// current-version pointer of each domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EventMode {
    Conf,
    #[default]
    Version,
}

impl FromStr for EventMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conf" => Ok(EventMode::Conf),
            "version" => Ok(EventMode::Version),
            other => Err(format!("invalid event mode: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageEvent {
    pub domain: String,
    pub kind: StorageEventKind,
}

#[derive(Clone, Debug)]
pub enum StorageEventKind {
    UpdateKey {
        file: String,
        section: String,
        key: String,
        value: String,
    },
    DeleteKey {
        file: String,
        section: String,
        key: String,
    },
    UpdateDomain {
        version: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_mode_from_str() {
        assert_eq!("conf".parse::<EventMode>().unwrap(), EventMode::Conf);
        assert_eq!("version".parse::<EventMode>().unwrap(), EventMode::Version);
        assert!("both".parse::<EventMode>().is_err());
    }
}
