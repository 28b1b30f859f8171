//! Fleet-level coordination: spawns the per-account lifecycle actors,
//! gates the SETUP → RUNNING transition on every account having reported
//! its applications once, reaps invalidated accounts, merges tokens
//! arriving from interactive sign-ins and orchestrates shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use actix::{
    Actor, ActorFutureExt, Addr, AsyncContext, Context, Handler, Message, ResponseActFuture,
    WrapFuture,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::account::{AccountActor, Shutdown};
use crate::catalog::{AccountEntry, SharedCatalog};
use crate::cm::{AuthTokenInfo, CmConnector};
use crate::{Status, StatusCell};

/// Spawn lifecycle actors for every account loaded from the state file;
/// with no accounts the server goes straight to RUNNING.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Bootstrap;

/// An account finished its first PICS app-info pass.
#[derive(Message)]
#[rtype(result = "()")]
pub struct AccountReady {
    pub steam_id: u64,
}

/// An invalidated account disconnected and can be dropped.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ReapAccount {
    pub steam_id: u64,
}

/// A completed interactive sign-in produced a token to merge in.
#[derive(Message)]
#[rtype(result = "()")]
pub struct TokenAdopted {
    pub token: String,
    pub info: AuthTokenInfo,
}

/// Unrecoverable failure somewhere in the engine; stop with a failure
/// exit code.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Fatal;

/// Wind down every account actor; resolves once all sessions are closed
/// and the final state flush happened.
#[derive(Message)]
#[rtype(result = "()")]
pub struct StopAll;

pub struct Coordinator {
    catalog: SharedCatalog,
    status: Arc<StatusCell>,
    connector: Arc<dyn CmConnector>,
    accounts: HashMap<u64, Addr<AccountActor>>,
    ready: HashSet<u64>,
    shutdown_tx: UnboundedSender<i32>,
    stopping: bool,
}

impl Coordinator {
    pub fn new(
        catalog: SharedCatalog,
        status: Arc<StatusCell>,
        connector: Arc<dyn CmConnector>,
        shutdown_tx: UnboundedSender<i32>,
    ) -> Self {
        Self {
            catalog,
            status,
            connector,
            accounts: HashMap::new(),
            ready: HashSet::new(),
            shutdown_tx,
            stopping: false,
        }
    }

    fn spawn_account(&mut self, ctx: &mut Context<Self>, token: String, info: AuthTokenInfo) {
        let actor = AccountActor::new(
            token,
            info,
            self.catalog.clone(),
            self.status.clone(),
            Arc::clone(&self.connector),
            ctx.address(),
        );
        self.accounts.insert(info.steam_id, actor.start());
    }

    /// Flip to RUNNING once every remaining account is ready.
    fn check_gate(&mut self) {
        if self.status.load() != Status::Setup {
            return;
        }
        let num_accounts = self.catalog.read().unwrap().accounts().len();
        if self.ready.len() >= num_accounts {
            {
                let mut catalog = self.catalog.write().unwrap();
                catalog.sync();
                catalog.update_manifest();
            }
            self.status.store(Status::Running);
            info!("Initial manifest generated, now serving");
        }
    }
}

impl Actor for Coordinator {
    type Context = Context<Self>;
}

impl Handler<Bootstrap> for Coordinator {
    type Result = ();

    fn handle(&mut self, _msg: Bootstrap, ctx: &mut Self::Context) {
        let entries: Vec<(String, AuthTokenInfo)> = {
            let catalog = self.catalog.read().unwrap();
            catalog
                .accounts()
                .values()
                .map(|acc| (acc.token.clone(), acc.info))
                .collect()
        };
        if entries.is_empty() {
            let mut catalog = self.catalog.write().unwrap();
            // Apps listed in the state file are unreachable without any
            // account; drop them before the first manifest build.
            catalog.clear_apps();
            catalog.update_manifest();
            drop(catalog);
            self.status.store(Status::Running);
            return;
        }
        for (token, info) in entries {
            self.spawn_account(ctx, token, info);
        }
    }
}

impl Handler<AccountReady> for Coordinator {
    type Result = ();

    fn handle(&mut self, msg: AccountReady, _ctx: &mut Self::Context) {
        if self.stopping {
            return;
        }
        self.ready.insert(msg.steam_id);
        self.check_gate();
    }
}

impl Handler<ReapAccount> for Coordinator {
    type Result = ();

    fn handle(&mut self, msg: ReapAccount, _ctx: &mut Self::Context) {
        self.accounts.remove(&msg.steam_id);
        self.ready.remove(&msg.steam_id);
        {
            let mut catalog = self.catalog.write().unwrap();
            catalog.remove_account(msg.steam_id);
            catalog.update_manifest();
        }
        // Losing an account may complete the initial readiness set.
        self.check_gate();
    }
}

impl Handler<TokenAdopted> for Coordinator {
    type Result = ();

    fn handle(&mut self, msg: TokenAdopted, ctx: &mut Self::Context) {
        if self.stopping {
            return;
        }
        let steam_id = msg.info.steam_id;
        enum Merge {
            Insert,
            Replace,
            Discard,
        }
        let merge = {
            let catalog = self.catalog.read().unwrap();
            match catalog.account(steam_id) {
                None => Merge::Insert,
                Some(existing) if msg.info.renewable && !existing.info.renewable => Merge::Replace,
                Some(_) => Merge::Discard,
            }
        };
        match merge {
            Merge::Insert => {
                info!("Account {steam_id} added");
                {
                    let mut catalog = self.catalog.write().unwrap();
                    catalog.insert_account(AccountEntry::new(msg.token.clone(), msg.info));
                    catalog.update_manifest();
                }
                self.spawn_account(ctx, msg.token, msg.info);
            }
            Merge::Replace => {
                info!("Account {steam_id} token replaced with a renewable one");
                {
                    let mut catalog = self.catalog.write().unwrap();
                    if let Some(existing) = catalog.account_mut(steam_id) {
                        existing.token = msg.token.clone();
                        existing.info = msg.info;
                    }
                    catalog.mark_state_dirty();
                    catalog.update_manifest();
                }
                if let Some(old) = self.accounts.remove(&steam_id) {
                    old.do_send(Shutdown);
                }
                self.spawn_account(ctx, msg.token, msg.info);
            }
            Merge::Discard => {}
        }
    }
}

impl Handler<Fatal> for Coordinator {
    type Result = ();

    fn handle(&mut self, _msg: Fatal, _ctx: &mut Self::Context) {
        if !self.stopping {
            let _ = self.shutdown_tx.send(1);
        }
    }
}

impl Handler<StopAll> for Coordinator {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, _msg: StopAll, _ctx: &mut Self::Context) -> Self::Result {
        self.stopping = true;
        self.status.store(Status::Stopping);
        let addrs: Vec<Addr<AccountActor>> = self.accounts.drain().map(|(_, addr)| addr).collect();
        Box::pin(
            async move {
                for addr in addrs {
                    let _ = addr.send(Shutdown).await;
                }
            }
            .into_actor(self)
            .map(|_, act, _| {
                // Final flush of whatever is still dirty.
                act.catalog.write().unwrap().update_manifest();
            }),
        )
    }
}
