//! In-memory model of everything the broker serves: accounts, apps,
//! depots, depot decryption keys, and the pre-serialized manifest buffers.
//!
//! The catalog is owned behind one `RwLock`; every mutation path takes the
//! write guard, HTTP readers take a copy-on-write snapshot of the manifest
//! buffers and never hold the guard across a send.

mod manifest;
mod state_file;

pub use manifest::{negotiate, Encoding, ManifestSet, ViewBuf};
pub use state_file::{config_dir, default_state_path};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{error, info};

use crate::cm::{AuthTokenInfo, CmSession};

pub type DepotKey = [u8; 32];
pub type SharedCatalog = Arc<RwLock<Catalog>>;

/// Removal lifecycle of an account. Removal is requested when Steam
/// invalidates the token and performed once the CM connection is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStatus {
    None,
    PendingRemove,
    Remove,
}

/// A federated Steam account. The transient PICS working sets live in the
/// account's lifecycle actor; the catalog holds what other subsystems need.
pub struct AccountEntry {
    pub token: String,
    pub info: AuthTokenInfo,
    pub remove: RemoveStatus,
    pub session: Option<Arc<dyn CmSession>>,
}

impl AccountEntry {
    pub fn new(token: String, info: AuthTokenInfo) -> Self {
        Self {
            token,
            info,
            remove: RemoveStatus::None,
            session: None,
        }
    }
}

/// A Steam application and the depots it is served for.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct App {
    pub name: String,
    /// PICS access token for the app; 0 when none was granted.
    pub pics_at: u64,
    pub depots: BTreeMap<u32, Depot>,
}

/// A depot and the accounts licensed for it. `accs` holds Steam IDs
/// (stable keys, resolved to a session at dispatch time) and `next_acc`
/// the round-robin cursor, which is always a valid index while `accs` is
/// non-empty.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Depot {
    pub accs: Vec<u64>,
    pub next_acc: usize,
}

pub struct Catalog {
    /// Timestamp (unix seconds) of the last manifest update.
    pub timestamp: i64,
    accounts: BTreeMap<u64, AccountEntry>,
    apps: BTreeMap<u32, App>,
    depot_keys: BTreeMap<u32, DepotKey>,
    manifest: Arc<ManifestSet>,
    manifest_dirty: bool,
    state_dirty: bool,
    state_path: Option<PathBuf>,
}

impl Catalog {
    pub fn new(state_path: Option<PathBuf>) -> Self {
        Self {
            timestamp: 0,
            accounts: BTreeMap::new(),
            apps: BTreeMap::new(),
            depot_keys: BTreeMap::new(),
            manifest: Arc::new(ManifestSet::empty()),
            manifest_dirty: false,
            state_dirty: false,
            state_path,
        }
    }

    /// Load the catalog from the state file, skipping tokens that no
    /// longer parse or have already expired.
    pub fn load(state_path: Option<PathBuf>) -> Self {
        let mut catalog = Self::new(state_path.clone());
        let Some(path) = state_path else {
            info!("State directory not found, initializing new state");
            return catalog;
        };
        let persisted = match state_file::load(&path) {
            Ok(Some(persisted)) => persisted,
            Ok(None) => {
                info!("State file not found, initializing new state");
                return catalog;
            }
            Err(err) => {
                error!("Failed to read state file: {err}");
                return catalog;
            }
        };
        catalog.timestamp = persisted.timestamp as i64;
        let now = Utc::now().timestamp();
        for token in persisted.accounts {
            let Some(info) = crate::cm::parse_auth_token(&token) else {
                error!("Auth token \"{token}\" is invalid; skipping it");
                catalog.state_dirty = true;
                continue;
            };
            if info.expires < now {
                error!("Auth token for account {} has expired; skipping it", info.steam_id);
                catalog.state_dirty = true;
                continue;
            }
            catalog
                .accounts
                .entry(info.steam_id)
                .or_insert_with(|| AccountEntry::new(token, info));
        }
        for (app_id, depot_ids) in persisted.apps {
            let Ok(app_id) = app_id.parse::<u32>() else {
                continue;
            };
            let app = catalog.apps.entry(app_id).or_default();
            for depot_id in depot_ids {
                app.depots.entry(depot_id).or_default();
            }
        }
        for (depot_id, b64_key) in persisted.depot_keys {
            let Ok(depot_id) = depot_id.parse::<u32>() else {
                continue;
            };
            if b64_key.len() != 44 {
                continue;
            }
            let Ok(raw) = base64::decode(&b64_key) else {
                continue;
            };
            let Ok(key) = <DepotKey>::try_from(raw.as_slice()) else {
                continue;
            };
            catalog.depot_keys.insert(depot_id, key);
        }
        catalog
    }

    pub fn accounts(&self) -> &BTreeMap<u64, AccountEntry> {
        &self.accounts
    }

    pub fn account(&self, steam_id: u64) -> Option<&AccountEntry> {
        self.accounts.get(&steam_id)
    }

    pub fn account_mut(&mut self, steam_id: u64) -> Option<&mut AccountEntry> {
        self.accounts.get_mut(&steam_id)
    }

    pub fn insert_account(&mut self, entry: AccountEntry) {
        self.accounts.insert(entry.info.steam_id, entry);
        self.state_dirty = true;
    }

    pub fn apps(&self) -> &BTreeMap<u32, App> {
        &self.apps
    }

    pub fn depot_keys(&self) -> &BTreeMap<u32, DepotKey> {
        &self.depot_keys
    }

    pub fn has_key(&self, depot_id: u32) -> bool {
        self.depot_keys.contains_key(&depot_id)
    }

    pub fn insert_key(&mut self, depot_id: u32, key: DepotKey) {
        self.depot_keys.insert(depot_id, key);
        self.manifest_dirty = true;
    }

    pub fn mark_state_dirty(&mut self) {
        self.state_dirty = true;
    }

    pub fn mark_manifest_dirty(&mut self) {
        self.manifest_dirty = true;
    }

    /// Drop every app; used when the state file references apps but no
    /// account survived loading.
    pub fn clear_apps(&mut self) {
        if !self.apps.is_empty() {
            self.apps.clear();
            self.manifest_dirty = true;
        }
    }

    /// Record that `steam_id` serves `depot_id` of `app_id`, creating the
    /// app/depot entries as needed. Admitting an account resets the depot's
    /// round-robin cursor to the start of the list.
    pub fn admit_depot(&mut self, app_id: u32, depot_id: u32, steam_id: u64) {
        let app = match self.apps.entry(app_id) {
            std::collections::btree_map::Entry::Vacant(e) => {
                self.manifest_dirty = true;
                e.insert(App::default())
            }
            std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
        };
        let depot = match app.depots.entry(depot_id) {
            std::collections::btree_map::Entry::Vacant(e) => {
                self.manifest_dirty = true;
                e.insert(Depot::default())
            }
            std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
        };
        if !depot.accs.contains(&steam_id) {
            depot.accs.push(steam_id);
            depot.next_acc = 0;
        }
    }

    /// Update an app's display name and PICS access token.
    pub fn set_app_meta(&mut self, app_id: u32, name: Option<&str>, pics_at: u64) {
        if let Some(app) = self.apps.get_mut(&app_id) {
            if let Some(name) = name {
                if app.name != name {
                    app.name = name.to_owned();
                    self.manifest_dirty = true;
                }
            }
            if app.pics_at != pics_at {
                app.pics_at = pics_at;
                self.manifest_dirty = true;
            }
        }
    }

    /// Select the account to fetch the next manifest request code for
    /// `depot_id` with, and advance the round-robin cursor.
    pub fn rotate(&mut self, app_id: u32, depot_id: u32) -> Option<u64> {
        let depot = self.apps.get_mut(&app_id)?.depots.get_mut(&depot_id)?;
        if depot.accs.is_empty() {
            return None;
        }
        let steam_id = depot.accs[depot.next_acc];
        depot.next_acc = (depot.next_acc + 1) % depot.accs.len();
        Some(steam_id)
    }

    /// Mark an account for removal once its connection closes.
    pub fn mark_remove(&mut self, steam_id: u64) {
        if let Some(acc) = self.accounts.get_mut(&steam_id) {
            if acc.remove == RemoveStatus::None {
                acc.remove = RemoveStatus::PendingRemove;
            }
            self.state_dirty = true;
        }
    }

    pub fn promote_remove(&mut self, steam_id: u64) {
        if let Some(acc) = self.accounts.get_mut(&steam_id) {
            if acc.remove == RemoveStatus::PendingRemove {
                acc.remove = RemoveStatus::Remove;
            }
        }
    }

    /// Attach or detach the live CM session of an account.
    pub fn set_session(&mut self, steam_id: u64, session: Option<Arc<dyn CmSession>>) {
        if let Some(acc) = self.accounts.get_mut(&steam_id) {
            acc.session = session;
        }
    }

    /// Detach the account's session only if it is still `session`; a
    /// replacement session installed in the meantime is left alone.
    pub fn clear_session(&mut self, steam_id: u64, session: &Arc<dyn CmSession>) {
        if let Some(acc) = self.accounts.get_mut(&steam_id) {
            if let Some(current) = &acc.session {
                if Arc::ptr_eq(current, session) {
                    acc.session = None;
                }
            }
        }
    }

    /// Erase an account from every depot's account list (repointing the
    /// cursor to the list start) and prune depots/apps left empty.
    pub fn remove_from_depots(&mut self, steam_id: u64) {
        for app in self.apps.values_mut() {
            for depot in app.depots.values_mut() {
                let before = depot.accs.len();
                depot.accs.retain(|&id| id != steam_id);
                if depot.accs.len() != before {
                    depot.next_acc = 0;
                }
            }
        }
        self.prune();
    }

    /// Drop an account from the catalog entirely: depot references first,
    /// then the entry itself.
    pub fn remove_account(&mut self, steam_id: u64) {
        self.remove_from_depots(steam_id);
        if self.accounts.remove(&steam_id).is_some() {
            self.state_dirty = true;
        }
    }

    /// Remove depots no account serves anymore, then apps with no depots.
    pub fn sync(&mut self) {
        self.prune();
    }

    fn prune(&mut self) {
        let mut removed = false;
        for app in self.apps.values_mut() {
            let before = app.depots.len();
            app.depots.retain(|_, depot| !depot.accs.is_empty());
            removed |= app.depots.len() != before;
        }
        let before = self.apps.len();
        self.apps.retain(|_, app| !app.depots.is_empty());
        removed |= self.apps.len() != before;
        if removed {
            self.manifest_dirty = true;
        }
    }

    /// Copy-on-write snapshot of the serialized manifest buffers.
    pub fn manifest_view(&self) -> Arc<ManifestSet> {
        Arc::clone(&self.manifest)
    }

    /// Regenerate the manifest buffers if they are dirty (or were never
    /// built) and flush the state file if it is dirty. All buffers of a
    /// rebuild are swapped in atomically.
    pub fn update_manifest(&mut self) {
        if self.manifest_dirty || self.manifest.is_empty() {
            if self.manifest_dirty {
                self.manifest_dirty = false;
                self.state_dirty = true;
                self.timestamp = Utc::now().timestamp();
            }
            self.manifest = Arc::new(manifest::build_set(self));
        }
        if self.state_dirty {
            self.state_dirty = false;
            match &self.state_path {
                Some(path) => {
                    if let Err(err) = state_file::persist(self, path) {
                        error!("Cannot save state: {err}");
                    }
                }
                None => error!("Cannot save state: state directory not found"),
            }
        }
    }

    /// Tokens to persist; accounts on their way out are not written back.
    pub(crate) fn persistable_tokens(&self) -> impl Iterator<Item = &str> {
        self.accounts
            .values()
            .filter(|acc| acc.remove == RemoveStatus::None)
            .map(|acc| acc.token.as_str())
    }
}
