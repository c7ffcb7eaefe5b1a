//! The diff law behind rollback and reconciliation: the put-set and
//! delete-set computed from (snapshot, latest) turn latest back into the
//! snapshot, and are empty when the two already agree.

use keeper_storage::DomainData;
use keeper_storage::etcd::model::map_diff;

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

fn apply(mut dirty: DomainData, puts: &DomainData, deletes: &DomainData) -> DomainData {
    for (file, sections) in puts {
        for (section, keys) in sections {
            for (key, value) in keys {
                dirty
                    .entry(file.clone())
                    .or_default()
                    .entry(section.clone())
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
        }
    }
    for (file, sections) in deletes {
        for (section, keys) in sections {
            for key in keys.keys() {
                if let Some(s) = dirty.get_mut(file).and_then(|f| f.get_mut(section)) {
                    s.remove(key);
                }
            }
        }
    }
    // drop empty levels so comparisons see shape, not scaffolding
    for sections in dirty.values_mut() {
        sections.retain(|_, keys| !keys.is_empty());
    }
    dirty.retain(|_, sections| !sections.is_empty());
    dirty
}

#[test]
fn applying_the_diff_restores_the_snapshot() {
    let snapshot = data(&[
        ("/g.conf", "DEFAULT", "listen", ":80"),
        ("/g.conf", "node1", "listen", ":81"),
        ("/s.conf", "DEFAULT", "max_conn", "50"),
    ]);
    // three edits later: one changed, one deleted, one added
    let latest = data(&[
        ("/g.conf", "DEFAULT", "listen", ":88"),
        ("/g.conf", "node1", "listen", ":81"),
        ("/g.conf", "node1", "debug", "true"),
    ]);

    let puts = map_diff(&snapshot, &latest, true);
    let deletes = map_diff(&latest, &snapshot, false);
    let restored = apply(latest, &puts, &deletes);
    assert_eq!(restored, snapshot);
}

#[test]
fn identical_states_produce_no_operations() {
    let snapshot = data(&[("/g.conf", "DEFAULT", "listen", ":80")]);
    assert!(map_diff(&snapshot, &snapshot, true).is_empty());
    assert!(map_diff(&snapshot, &snapshot, false).is_empty());
}

#[test]
fn rollback_diff_is_idempotent() {
    let snapshot = data(&[("/g.conf", "DEFAULT", "listen", ":80")]);
    let latest = data(&[("/g.conf", "DEFAULT", "listen", ":88")]);

    let puts = map_diff(&snapshot, &latest, true);
    let deletes = map_diff(&latest, &snapshot, false);
    let once = apply(latest, &puts, &deletes);
    let twice = apply(once.clone(), &puts, &deletes);
    assert_eq!(once, twice);
    assert_eq!(once, snapshot);
}
