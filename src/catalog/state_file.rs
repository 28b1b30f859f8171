//! The authoritative on-disk state: auth tokens, app → depot mappings and
//! depot keys, written atomically on every dirty cycle.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::Catalog;

/// On-disk JSON shape of the state file.
#[derive(Debug, Default, Deserialize)]
pub(super) struct PersistedState {
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub apps: BTreeMap<String, Vec<u32>>,
    #[serde(default)]
    pub depot_keys: BTreeMap<String, String>,
}

pub(super) fn load(path: &Path) -> io::Result<Option<PersistedState>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Serialize and atomically replace the state file, creating its parent
/// directories on first write.
pub(super) fn persist(catalog: &Catalog, path: &Path) -> anyhow::Result<()> {
    let mut apps = Map::new();
    for (app_id, app) in catalog.apps() {
        apps.insert(
            app_id.to_string(),
            Value::from(app.depots.keys().copied().collect::<Vec<u32>>()),
        );
    }
    let mut depot_keys = Map::new();
    for (depot_id, key) in catalog.depot_keys() {
        depot_keys.insert(depot_id.to_string(), Value::from(base64::encode(key)));
    }
    let doc = json!({
        "timestamp": catalog.timestamp as u64,
        "accounts": catalog.persistable_tokens().collect::<Vec<_>>(),
        "apps": apps,
        "depot_keys": depot_keys,
    });
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(&doc)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Default location of the state file: `<state_dir>/tek-s3/state.json`,
/// where the state directory is `$XDG_STATE_HOME` (or `~/.local/state`) on
/// Linux and the per-user local data directory elsewhere, falling back to
/// `/var/lib` when no per-user directory exists.
pub fn default_state_path() -> Option<PathBuf> {
    let base = directories::BaseDirs::new();
    let dir = match &base {
        Some(base) => base
            .state_dir()
            .unwrap_or_else(|| base.data_local_dir())
            .to_path_buf(),
        None => PathBuf::from("/var/lib"),
    };
    Some(dir.join("tek-s3").join("state.json"))
}

/// Per-user configuration directory holding `tek-s3/settings.json`.
pub fn config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|base| base.config_dir().join("tek-s3"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AccountEntry;
    use crate::cm::AuthTokenInfo;

    #[test]
    fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut catalog = Catalog::new(Some(path.clone()));
        catalog.insert_account(AccountEntry::new(
            "tok-a".into(),
            AuthTokenInfo {
                steam_id: 10,
                renewable: true,
                expires: i64::MAX,
            },
        ));
        catalog.admit_depot(440, 441, 10);
        catalog.insert_key(441, [9u8; 32]);
        catalog.timestamp = 1234;
        persist(&catalog, &path).unwrap();

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.timestamp, 1234);
        assert_eq!(loaded.accounts, vec!["tok-a".to_string()]);
        assert_eq!(loaded.apps["440"], vec![441]);
        assert_eq!(loaded.depot_keys["441"], base64::encode([9u8; 32]));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        assert!(load(Path::new("/nonexistent/state.json")).unwrap().is_none());
    }

    #[test]
    fn removed_accounts_are_not_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut catalog = Catalog::new(Some(path.clone()));
        for id in [1u64, 2] {
            catalog.insert_account(AccountEntry::new(
                format!("tok-{id}"),
                AuthTokenInfo {
                    steam_id: id,
                    renewable: false,
                    expires: i64::MAX,
                },
            ));
        }
        catalog.mark_remove(2);
        persist(&catalog, &path).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.accounts, vec!["tok-1".to_string()]);
    }
}
