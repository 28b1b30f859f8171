//! Manifest request code cache and dispatcher: per-manifest codes cached
//! until Steam's next refresh phase, fetched round-robin across the
//! accounts licensed for the depot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use actix::{
    Actor, ActorFutureExt, AsyncContext, Context, Handler, Message, ResponseActFuture,
    SpawnHandle, WrapFuture,
};
use chrono::Utc;

use crate::catalog::SharedCatalog;
use crate::cm::{with_timeout, CmError};

/// Cache bound; the entry with the smallest manifest ID is evicted when a
/// new insertion would exceed it.
const CACHE_CAP: usize = 128;
const MRC_TIMEOUT_MS: u64 = 2000;

/// Steam refreshes manifest request codes at minutes 4 and 9 of the hour,
/// every 5 minutes offset 240 seconds from the 5-minute boundary. The
/// returned deadline is the next such refresh, at most 5 minutes away.
pub fn eviction_deadline(now: i64) -> i64 {
    (now + 60) / 300 * 300 + 240
}

#[derive(Message)]
#[rtype(result = "Result<MrcGrant, MrcFailure>")]
pub struct FetchMrc {
    pub app_id: u32,
    pub depot_id: u32,
    pub manifest_id: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct MrcGrant {
    pub mrc: u64,
    /// Seconds until the code is refreshed server-side.
    pub max_age: i64,
}

#[derive(Debug)]
pub enum MrcFailure {
    /// No account serves this app/depot pair.
    UnknownDepot,
    /// The selected account has no live CM connection right now.
    NoSession,
    Cm(CmError),
}

struct CacheEntry {
    mrc: u64,
    evict_at: i64,
    timer: SpawnHandle,
}

pub struct MrcDispatcher {
    catalog: SharedCatalog,
    cache: BTreeMap<u64, CacheEntry>,
}

impl MrcDispatcher {
    pub fn new(catalog: SharedCatalog) -> Self {
        Self {
            catalog,
            cache: BTreeMap::new(),
        }
    }

    fn insert(&mut self, ctx: &mut Context<Self>, manifest_id: u64, mrc: u64) -> i64 {
        if self.cache.len() >= CACHE_CAP {
            if let Some((_, evicted)) = self.cache.pop_first() {
                ctx.cancel_future(evicted.timer);
            }
        }
        let now = Utc::now().timestamp();
        let evict_at = eviction_deadline(now);
        let timer = ctx.run_later(
            Duration::from_secs((evict_at - now).max(1) as u64),
            move |act, _ctx| {
                act.cache.remove(&manifest_id);
            },
        );
        if let Some(old) = self.cache.insert(
            manifest_id,
            CacheEntry {
                mrc,
                evict_at,
                timer,
            },
        ) {
            ctx.cancel_future(old.timer);
        }
        evict_at - now
    }
}

impl Actor for MrcDispatcher {
    type Context = Context<Self>;
}

impl Handler<FetchMrc> for MrcDispatcher {
    type Result = ResponseActFuture<Self, Result<MrcGrant, MrcFailure>>;

    fn handle(&mut self, msg: FetchMrc, _ctx: &mut Self::Context) -> Self::Result {
        if let Some(entry) = self.cache.get(&msg.manifest_id) {
            let grant = MrcGrant {
                mrc: entry.mrc,
                max_age: (entry.evict_at - Utc::now().timestamp()).max(0),
            };
            return Box::pin(actix::fut::ready(Ok(grant)));
        }
        // Cache miss: pick the depot's next account and rotate the cursor.
        let session = {
            let mut catalog = self.catalog.write().unwrap();
            let Some(steam_id) = catalog.rotate(msg.app_id, msg.depot_id) else {
                return Box::pin(actix::fut::ready(Err(MrcFailure::UnknownDepot)));
            };
            match catalog.account(steam_id).and_then(|acc| acc.session.clone()) {
                Some(session) => session,
                None => return Box::pin(actix::fut::ready(Err(MrcFailure::NoSession))),
            }
        };
        let (app_id, depot_id, manifest_id) = (msg.app_id, msg.depot_id, msg.manifest_id);
        Box::pin(
            async move {
                with_timeout(MRC_TIMEOUT_MS, session.get_mrc(app_id, depot_id, manifest_id)).await
            }
            .into_actor(self)
            .map(move |res, act, ctx| match res {
                Ok(mrc) => {
                    let max_age = act.insert(ctx, manifest_id, mrc);
                    Ok(MrcGrant { mrc, max_age })
                }
                Err(err) => Err(MrcFailure::Cm(err)),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_is_phase_aligned_and_bounded() {
        for now in (0..=600).chain([1_700_000_000, 1_700_000_239, 1_700_000_240]) {
            let deadline = eviction_deadline(now);
            assert!(deadline > now, "deadline must be in the future for {now}");
            assert!(deadline - now <= 300, "ttl exceeds 5 minutes for {now}");
            assert_eq!(deadline % 300, 240, "not phase-aligned for {now}");
        }
    }

    #[test]
    fn deadline_examples() {
        // Just before a refresh boundary the remaining time collapses.
        assert_eq!(eviction_deadline(240), 540);
        assert_eq!(eviction_deadline(239), 240);
        assert_eq!(eviction_deadline(0), 240);
    }
}
