//! Scripted in-process stand-in for the Steam CM layer, plus helpers to
//! wire up the engine the way the binary does.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use actix::Actor;
use async_trait::async_trait;
use tokio::sync::mpsc;

use tek_s3::catalog::{Catalog, SharedCatalog};
use tek_s3::cm::{
    AppEntry, AppRequest, AuthEvent, AuthRequest, CmConnector, CmError, CmSession,
    ConfirmationKind, EResult, License, PackageEntry, PackageRequest, TokenEntry,
};
use tek_s3::coordinator::{Bootstrap, Coordinator};
use tek_s3::mrc::MrcDispatcher;
use tek_s3::{AppState, Status, StatusCell};

/// Forge an auth token with the JWT layout the broker parses.
pub fn make_token(steam_id: u64, renewable: bool, expires: i64) -> String {
    let aud: Vec<&str> = if renewable {
        vec!["client", "renew"]
    } else {
        vec!["client"]
    };
    let payload = serde_json::json!({
        "sub": steam_id.to_string(),
        "exp": expires,
        "aud": aud,
    });
    format!(
        "eyJ0eXAiOiJKV1QifQ.{}.sig",
        base64::encode_config(payload.to_string(), base64::URL_SAFE_NO_PAD)
    )
}

/// Binary VDF package-info document listing depot and app IDs.
pub fn package_vdf(depot_ids: &[i32], app_ids: &[i32]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(0x00);
    buf.extend(b"depotids\0");
    for (i, id) in depot_ids.iter().enumerate() {
        buf.push(0x02);
        buf.extend(i.to_string().as_bytes());
        buf.push(0);
        buf.extend(id.to_le_bytes());
    }
    buf.push(0x08);
    buf.push(0x00);
    buf.extend(b"appids\0");
    for (i, id) in app_ids.iter().enumerate() {
        buf.push(0x02);
        buf.extend(i.to_string().as_bytes());
        buf.push(0);
        buf.extend(id.to_le_bytes());
    }
    buf.push(0x08);
    buf
}

/// Text VDF app-info document with the given manifestable depots.
pub fn app_vdf(name: &str, depot_ids: &[u32]) -> String {
    let mut depots = String::new();
    for id in depot_ids {
        depots.push_str(&format!(
            "\"{id}\" {{ \"manifests\" {{ \"public\" \"1\" }} }}\n"
        ));
    }
    format!(
        "\"appinfo\" {{ \"common\" {{ \"name\" \"{name}\" }} \"depots\" {{ {depots} }} }}"
    )
}

/// Scripted behavior of one account on the mock CM network, keyed by its
/// auth token.
#[derive(Default, Clone)]
pub struct Profile {
    pub sign_in_error: Option<CmError>,
    /// `(package_id, access_token)` license pairs.
    pub licenses: Vec<(u32, u64)>,
    /// package_id → binary VDF.
    pub packages: HashMap<u32, Vec<u8>>,
    /// app_id → PICS access token; absent apps are denied one.
    pub access_tokens: HashMap<u32, u64>,
    /// app_id → text VDF.
    pub apps: HashMap<u32, String>,
    pub depot_keys: HashMap<u32, [u8; 32]>,
    /// Distinguishes which account served an MRC: code = base + manifest.
    pub mrc_base: u64,
    /// Simulate a CM server that never answers MRC requests.
    pub mrc_hangs: bool,
}

/// Interactive-auth script: confirmations to demand, then the token to
/// hand out.
pub struct AuthScript {
    pub confirmations: Vec<ConfirmationKind>,
    pub token: String,
}

#[derive(Default)]
pub struct MockNet {
    pub profiles: Mutex<HashMap<String, Profile>>,
    pub auth: Mutex<Option<AuthScript>>,
    pub mrc_calls: AtomicUsize,
}

impl MockNet {
    pub fn add_profile(&self, token: &str, profile: Profile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(token.to_owned(), profile);
    }
}

pub struct MockConnector {
    pub net: Arc<MockNet>,
}

#[async_trait]
impl CmConnector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn CmSession>, CmError> {
        Ok(Arc::new(MockSession {
            net: Arc::clone(&self.net),
            profile: Mutex::new(None),
            auth_tx: Mutex::new(None),
        }))
    }
}

pub struct MockSession {
    net: Arc<MockNet>,
    profile: Mutex<Option<Profile>>,
    auth_tx: Mutex<Option<mpsc::UnboundedSender<AuthEvent>>>,
}

impl MockSession {
    /// A session already signed into `token`, for tests that assemble the
    /// catalog by hand.
    pub fn signed_in(net: &Arc<MockNet>, token: &str) -> Arc<dyn CmSession> {
        let profile = net.profiles.lock().unwrap().get(token).cloned();
        Arc::new(MockSession {
            net: Arc::clone(net),
            profile: Mutex::new(profile),
            auth_tx: Mutex::new(None),
        })
    }

    fn profile(&self) -> Result<Profile, CmError> {
        self.profile
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CmError::Transport("not signed in".into()))
    }
}

#[async_trait]
impl CmSession for MockSession {
    async fn sign_in(&self, token: &str) -> Result<(), CmError> {
        let profile = self
            .net
            .profiles
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or(CmError::Steam(EResult::AccessDenied))?;
        if let Some(err) = &profile.sign_in_error {
            return Err(err.clone());
        }
        *self.profile.lock().unwrap() = Some(profile);
        Ok(())
    }

    async fn renew_token(&self, _token: &str) -> Result<Option<String>, CmError> {
        Ok(None)
    }

    async fn get_licenses(&self) -> Result<Vec<License>, CmError> {
        Ok(self
            .profile()?
            .licenses
            .iter()
            .map(|&(package_id, access_token)| License {
                package_id,
                access_token,
            })
            .collect())
    }

    async fn get_package_info(
        &self,
        packages: &[PackageRequest],
    ) -> Result<Vec<PackageEntry>, CmError> {
        let profile = self.profile()?;
        Ok(packages
            .iter()
            .map(|req| PackageEntry {
                package_id: req.package_id,
                result: profile
                    .packages
                    .get(&req.package_id)
                    .cloned()
                    .ok_or(CmError::Steam(EResult::Fail)),
            })
            .collect())
    }

    async fn get_access_tokens(&self, app_ids: &[u32]) -> Result<Vec<TokenEntry>, CmError> {
        let profile = self.profile()?;
        Ok(app_ids
            .iter()
            .map(|app_id| TokenEntry {
                app_id: *app_id,
                result: profile
                    .access_tokens
                    .get(app_id)
                    .copied()
                    .ok_or(CmError::Steam(EResult::AccessTokenDenied)),
            })
            .collect())
    }

    async fn get_app_info(&self, apps: &[AppRequest]) -> Result<Vec<AppEntry>, CmError> {
        let profile = self.profile()?;
        Ok(apps
            .iter()
            .map(|req| AppEntry {
                app_id: req.app_id,
                access_token: req.access_token,
                result: profile
                    .apps
                    .get(&req.app_id)
                    .cloned()
                    .ok_or(CmError::Steam(EResult::MissingToken)),
            })
            .collect())
    }

    async fn get_depot_key(&self, _app_id: u32, depot_id: u32) -> Result<[u8; 32], CmError> {
        self.profile()?
            .depot_keys
            .get(&depot_id)
            .copied()
            .ok_or(CmError::Steam(EResult::Blocked))
    }

    async fn get_mrc(
        &self,
        _app_id: u32,
        _depot_id: u32,
        manifest_id: u64,
    ) -> Result<u64, CmError> {
        let profile = self.profile()?;
        self.net.mrc_calls.fetch_add(1, Ordering::Relaxed);
        if profile.mrc_hangs {
            futures_util::future::pending::<()>().await;
        }
        Ok(profile.mrc_base + manifest_id)
    }

    async fn begin_auth(
        &self,
        _device_name: &str,
        _request: AuthRequest,
    ) -> Result<mpsc::UnboundedReceiver<AuthEvent>, CmError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let script = self.net.auth.lock().unwrap();
        let Some(script) = script.as_ref() else {
            return Err(CmError::Steam(EResult::ServiceUnavailable));
        };
        if script.confirmations.is_empty() {
            let _ = tx.send(AuthEvent::Completed(Ok(script.token.clone())));
        } else {
            let _ = tx.send(AuthEvent::ConfirmationRequired(script.confirmations.clone()));
            *self.auth_tx.lock().unwrap() = Some(tx);
        }
        Ok(rx)
    }

    async fn submit_confirmation(
        &self,
        _kind: ConfirmationKind,
        _code: &str,
    ) -> Result<(), CmError> {
        let tx = self.auth_tx.lock().unwrap().take();
        let script = self.net.auth.lock().unwrap();
        match (tx, script.as_ref()) {
            (Some(tx), Some(script)) => {
                let _ = tx.send(AuthEvent::Completed(Ok(script.token.clone())));
                Ok(())
            }
            _ => Err(CmError::Transport("no auth session".into())),
        }
    }

    async fn disconnect(&self) {}
}

/// The engine wired the way `run` does it, minus the HTTP listener.
pub struct TestEngine {
    pub state: AppState,
    pub net: Arc<MockNet>,
}

pub async fn start_engine(net: Arc<MockNet>, state_path: Option<PathBuf>) -> TestEngine {
    let catalog: SharedCatalog = Arc::new(RwLock::new(Catalog::load(state_path)));
    start_engine_with_catalog(net, catalog).await
}

pub async fn start_engine_with_catalog(net: Arc<MockNet>, catalog: SharedCatalog) -> TestEngine {
    let status = Arc::new(StatusCell::new(Status::Setup));
    let connector: Arc<dyn CmConnector> = Arc::new(MockConnector {
        net: Arc::clone(&net),
    });
    let (shutdown_tx, _shutdown_rx) = mpsc::unbounded_channel();
    let dispatcher = MrcDispatcher::new(catalog.clone()).start();
    let coordinator = Coordinator::new(
        catalog.clone(),
        status.clone(),
        Arc::clone(&connector),
        shutdown_tx,
    )
    .start();
    coordinator
        .send(Bootstrap)
        .await
        .expect("coordinator unreachable");
    TestEngine {
        state: AppState {
            status,
            catalog,
            coordinator,
            dispatcher,
            connector,
        },
        net,
    }
}

/// Poll until `cond` holds; panics after ~5 seconds.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_running(engine: &TestEngine) {
    let status = engine.state.status.clone();
    wait_for("server to reach RUNNING", move || {
        status.load() == Status::Running
    })
    .await;
}
