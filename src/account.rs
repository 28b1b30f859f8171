//! Per-account lifecycle engine: one actor per federated account drives
//! connect → sign-in → license fetch → PICS → depot-key harvest, schedules
//! token renewals and reports readiness and removal to the coordinator.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use actix::{
    Actor, ActorContext, ActorFutureExt, Addr, AsyncContext, Context, Handler, Message,
    ResponseActFuture, SpawnHandle, WrapFuture,
};
use chrono::Utc;
use futures_util::future::join_all;
use tracing::{error, info};

use crate::builder;
use crate::catalog::SharedCatalog;
use crate::cm::{
    parse_auth_token, with_timeout, AuthTokenInfo, CmConnector, CmError, CmSession, EResult,
    PackageRequest,
};
use crate::coordinator::{AccountReady, Coordinator, Fatal, ReapAccount};
use crate::{Status, StatusCell};

/// Renewals are attempted one week before token expiry.
const RENEW_LEAD_SECS: i64 = 7 * 24 * 3600;
const CONNECT_TIMEOUT_MS: u64 = 5000;
const SIGN_IN_TIMEOUT_MS: u64 = 5000;
const RENEW_TIMEOUT_MS: u64 = 5000;
const PICS_TIMEOUT_MS: u64 = 10_000;
const DEPOT_KEY_TIMEOUT_MS: u64 = 3000;
/// Depot key requests in flight per account at once. Larger batches make
/// the CM server drop or time out requests.
const KEY_BURST: usize = 5;

#[derive(Message)]
#[rtype(result = "()")]
struct Connect;

#[derive(Message)]
#[rtype(result = "()")]
struct Renew;

/// Disconnect and stop the actor; resolves once the session is down.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown;

/// What a finished connection cycle asks the actor to do next.
enum CycleOutcome {
    /// Unrecoverable failure; bring the whole server down.
    Fatal,
    /// The token was invalidated; disconnect and get reaped.
    Removed,
    /// Transient failure; disconnect and reconnect.
    Retry,
    /// Token renewal succeeded; store it, then disconnect and reconnect
    /// so the next cycle signs in with the fresh token.
    Renewed { token: String, info: AuthTokenInfo },
    /// Harvest finished; keep the connection for MRC dispatch.
    Idle,
}

enum AfterDisconnect {
    Reap,
    Reconnect,
}

pub struct AccountActor {
    steam_id: u64,
    token: String,
    info: AuthTokenInfo,
    catalog: SharedCatalog,
    status: Arc<StatusCell>,
    connector: Arc<dyn CmConnector>,
    coordinator: Addr<Coordinator>,
    session: Option<Arc<dyn CmSession>>,
    renew_timer: Option<SpawnHandle>,
}

impl AccountActor {
    pub fn new(
        token: String,
        info: AuthTokenInfo,
        catalog: SharedCatalog,
        status: Arc<StatusCell>,
        connector: Arc<dyn CmConnector>,
        coordinator: Addr<Coordinator>,
    ) -> Self {
        Self {
            steam_id: info.steam_id,
            token,
            info,
            catalog,
            status,
            connector,
            coordinator,
            session: None,
            renew_timer: None,
        }
    }

    fn on_connected(&mut self, session: Arc<dyn CmSession>, ctx: &mut Context<Self>) {
        self.session = Some(Arc::clone(&session));
        self.catalog
            .write()
            .unwrap()
            .set_session(self.steam_id, Some(Arc::clone(&session)));
        if self.info.renewable {
            let renew_at = self.info.expires - RENEW_LEAD_SECS;
            let now = Utc::now().timestamp();
            if now < renew_at {
                self.schedule_renew(ctx, (renew_at - now) as u64);
            }
        }
        let fut = drive(
            session,
            self.steam_id,
            self.token.clone(),
            self.info,
            self.catalog.clone(),
            self.status.clone(),
            self.coordinator.clone(),
        );
        ctx.spawn(
            fut.into_actor(self)
                .map(|outcome, act, ctx| act.on_outcome(outcome, ctx)),
        );
    }

    fn schedule_renew(&mut self, ctx: &mut Context<Self>, delay_secs: u64) {
        if let Some(handle) = self.renew_timer.take() {
            ctx.cancel_future(handle);
        }
        self.renew_timer = Some(ctx.notify_later(Renew, Duration::from_secs(delay_secs)));
    }

    fn on_outcome(&mut self, outcome: CycleOutcome, ctx: &mut Context<Self>) {
        match outcome {
            CycleOutcome::Fatal => {
                self.coordinator.do_send(Fatal);
            }
            CycleOutcome::Removed => self.disconnect_then(ctx, AfterDisconnect::Reap),
            CycleOutcome::Retry => self.disconnect_then(ctx, AfterDisconnect::Reconnect),
            CycleOutcome::Renewed { token, info } => {
                self.token = token.clone();
                self.info = info;
                {
                    let mut catalog = self.catalog.write().unwrap();
                    if let Some(acc) = catalog.account_mut(self.steam_id) {
                        acc.token = token;
                        acc.info = info;
                    }
                    catalog.mark_state_dirty();
                    catalog.update_manifest();
                }
                let renew_at = self.info.expires - RENEW_LEAD_SECS;
                let now = Utc::now().timestamp();
                if now < renew_at {
                    self.schedule_renew(ctx, (renew_at - now) as u64);
                }
                self.disconnect_then(ctx, AfterDisconnect::Reconnect);
            }
            CycleOutcome::Idle => {}
        }
    }

    fn disconnect_then(&mut self, ctx: &mut Context<Self>, after: AfterDisconnect) {
        let session = self.session.take();
        if let Some(session) = &session {
            self.catalog
                .write()
                .unwrap()
                .clear_session(self.steam_id, session);
        }
        let steam_id = self.steam_id;
        ctx.spawn(
            async move {
                if let Some(session) = session {
                    session.disconnect().await;
                }
            }
            .into_actor(self)
            .map(move |_, act, ctx| match after {
                AfterDisconnect::Reap => {
                    act.catalog.write().unwrap().promote_remove(steam_id);
                    act.coordinator.do_send(ReapAccount { steam_id });
                    ctx.stop();
                }
                AfterDisconnect::Reconnect => {
                    if act.status.load() != Status::Stopping {
                        ctx.notify(Connect);
                    }
                }
            }),
        );
    }
}

impl Actor for AccountActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.notify(Connect);
    }
}

impl Handler<Connect> for AccountActor {
    type Result = ();

    fn handle(&mut self, _msg: Connect, ctx: &mut Self::Context) {
        let connector = Arc::clone(&self.connector);
        ctx.spawn(
            async move { with_timeout(CONNECT_TIMEOUT_MS, connector.connect()).await }
                .into_actor(self)
                .map(|res, act, ctx| match res {
                    Ok(session) => act.on_connected(session, ctx),
                    Err(err) => {
                        error!("Failed to connect to a Steam CM server: {err}");
                        act.coordinator.do_send(Fatal);
                    }
                }),
        );
    }
}

impl Handler<Renew> for AccountActor {
    type Result = ();

    fn handle(&mut self, _msg: Renew, ctx: &mut Self::Context) {
        self.renew_timer = None;
        let Some(session) = self.session.clone() else {
            // Disconnected at fire time; the reconnect path notices the
            // imminent expiry on its own.
            return;
        };
        let steam_id = self.steam_id;
        let token = self.token.clone();
        ctx.spawn(
            async move { with_timeout(RENEW_TIMEOUT_MS, session.renew_token(&token)).await }
                .into_actor(self)
                .map(move |res, act, ctx| {
                    let outcome = renew_outcome(steam_id, res);
                    act.on_outcome(outcome, ctx);
                }),
        );
    }
}

impl Handler<Shutdown> for AccountActor {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) -> Self::Result {
        if let Some(handle) = self.renew_timer.take() {
            ctx.cancel_future(handle);
        }
        let session = self.session.take();
        if let Some(session) = &session {
            self.catalog
                .write()
                .unwrap()
                .clear_session(self.steam_id, session);
        }
        Box::pin(
            async move {
                if let Some(session) = session {
                    session.disconnect().await;
                }
            }
            .into_actor(self)
            .map(|_, _, ctx| ctx.stop()),
        )
    }
}

fn renew_outcome(steam_id: u64, res: Result<Option<String>, CmError>) -> CycleOutcome {
    match res {
        Ok(Some(new_token)) => match parse_auth_token(&new_token) {
            Some(info) => {
                info!("Renewed auth token for account {steam_id}");
                CycleOutcome::Renewed {
                    token: new_token,
                    info,
                }
            }
            None => {
                error!("Renewed token for account {steam_id} does not parse; keeping the old one");
                CycleOutcome::Retry
            }
        },
        Ok(None) => CycleOutcome::Retry,
        Err(err) => {
            error!("Failed to renew token for account {steam_id}: {err}");
            CycleOutcome::Retry
        }
    }
}

/// One connected cycle: renew-or-sign-in, pull licenses → packages →
/// access tokens → app info into the catalog, then harvest missing depot
/// keys in bursts.
async fn drive(
    session: Arc<dyn CmSession>,
    steam_id: u64,
    token: String,
    info: AuthTokenInfo,
    catalog: SharedCatalog,
    status: Arc<StatusCell>,
    coordinator: Addr<Coordinator>,
) -> CycleOutcome {
    if info.renewable && Utc::now().timestamp() >= info.expires - RENEW_LEAD_SECS {
        // Less than a week until expiry; renew before anything else.
        let res = with_timeout(RENEW_TIMEOUT_MS, session.renew_token(&token)).await;
        return renew_outcome(steam_id, res);
    }

    if let Err(err) = with_timeout(SIGN_IN_TIMEOUT_MS, session.sign_in(&token)).await {
        if err.invalidates_token() {
            info!("Auth token for account {steam_id} has been invalidated, removing it");
            let mut catalog = catalog.write().unwrap();
            catalog.mark_remove(steam_id);
            if status.load() == Status::Running {
                catalog.remove_from_depots(steam_id);
                catalog.update_manifest();
            }
            return CycleOutcome::Removed;
        }
        if matches!(err, CmError::Steam(EResult::ServiceUnavailable)) {
            return CycleOutcome::Retry;
        }
        error!("Failed to sign into account {steam_id}: {err}");
        return CycleOutcome::Fatal;
    }

    let licenses = match with_timeout(PICS_TIMEOUT_MS, session.get_licenses()).await {
        Ok(licenses) => licenses,
        Err(err) => {
            error!("Failed to get licenses for account {steam_id}: {err}");
            return CycleOutcome::Retry;
        }
    };
    if licenses.is_empty() {
        return CycleOutcome::Idle;
    }

    let package_requests: Vec<PackageRequest> = licenses
        .iter()
        .map(|lic| PackageRequest {
            package_id: lic.package_id,
            access_token: lic.access_token,
        })
        .collect();
    let packages =
        match with_timeout(PICS_TIMEOUT_MS, session.get_package_info(&package_requests)).await {
            Ok(packages) => packages,
            Err(err) => {
                error!("Failed to get PICS info for account {steam_id}'s packages: {err}");
                return CycleOutcome::Retry;
            }
        };
    let scan = match builder::scan_packages(steam_id, &packages) {
        Ok(scan) => scan,
        Err(_) => return CycleOutcome::Retry,
    };

    let app_ids: Vec<u32> = scan.owned_apps.iter().copied().collect();
    let tokens = match with_timeout(PICS_TIMEOUT_MS, session.get_access_tokens(&app_ids)).await {
        Ok(tokens) => tokens,
        Err(err) => {
            error!("Failed to get PICS access tokens for account {steam_id}'s apps: {err}");
            return CycleOutcome::Retry;
        }
    };
    let app_requests = match builder::fold_access_tokens(steam_id, tokens) {
        Ok(requests) => requests,
        Err(_) => return CycleOutcome::Retry,
    };

    let apps = match with_timeout(PICS_TIMEOUT_MS, session.get_app_info(&app_requests)).await {
        Ok(apps) => apps,
        Err(err) => {
            error!("Failed to get PICS info for account {steam_id}'s apps: {err}");
            return CycleOutcome::Retry;
        }
    };
    let mut candidates: BTreeSet<u32> = scan.candidate_depots;
    let missing_keys = {
        let mut catalog = catalog.write().unwrap();
        match builder::apply_app_info(&mut catalog, steam_id, &mut candidates, &apps) {
            Ok(missing) => missing,
            Err(_) => return CycleOutcome::Retry,
        }
    };

    if status.load() == Status::Running {
        let mut catalog = catalog.write().unwrap();
        catalog.sync();
        catalog.update_manifest();
    } else {
        // First full application list for this account; the coordinator
        // flips the server to RUNNING once every account got here.
        coordinator.do_send(AccountReady { steam_id });
    }

    if harvest_keys(&session, &catalog, &status, missing_keys).await.is_err() {
        return CycleOutcome::Retry;
    }
    if status.load() == Status::Running {
        let mut catalog = catalog.write().unwrap();
        catalog.sync();
        catalog.update_manifest();
    }
    CycleOutcome::Idle
}

/// Fetch the missing depot keys in bursts of [`KEY_BURST`]. Timed-out
/// requests are re-sent; `blocked` results (pre-download depots) leave the
/// depot without a key; anything else aborts the cycle.
async fn harvest_keys(
    session: &Arc<dyn CmSession>,
    catalog: &SharedCatalog,
    status: &Arc<StatusCell>,
    mut queue: Vec<(u32, u32)>,
) -> Result<(), CmError> {
    while !queue.is_empty() {
        let burst = queue.split_off(queue.len().saturating_sub(KEY_BURST));
        let results = join_all(burst.into_iter().map(|(app_id, depot_id)| {
            let session = Arc::clone(session);
            let catalog = catalog.clone();
            let status = Arc::clone(status);
            async move {
                loop {
                    if status.load() == Status::Stopping {
                        return Ok(());
                    }
                    match with_timeout(
                        DEPOT_KEY_TIMEOUT_MS,
                        session.get_depot_key(app_id, depot_id),
                    )
                    .await
                    {
                        Ok(key) => {
                            catalog.write().unwrap().insert_key(depot_id, key);
                            return Ok(());
                        }
                        // Timeouts are common for depot key requests, just
                        // re-send it.
                        Err(CmError::Timeout) => continue,
                        // Returned for pre-download depots, ignore it.
                        Err(CmError::Steam(EResult::Blocked)) => return Ok(()),
                        Err(err) => {
                            error!("Failed to get decryption key for depot {depot_id}: {err}");
                            return Err(err);
                        }
                    }
                }
            }
        }))
        .await;
        for res in results {
            res?;
        }
    }
    Ok(())
}
