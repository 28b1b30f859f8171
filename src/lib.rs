//! tek-s3: a long-running broker that federates authenticated Steam
//! accounts and serves the depot metadata LAN clients need for downloads:
//! the manifest catalog, depot decryption keys and short-lived manifest
//! request codes. Clients never see credentials; the server proxies the
//! privileged Steam CM operations.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use actix::{Actor, Addr};
use actix_web::{web, App, HttpServer};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod account;
pub mod builder;
pub mod catalog;
pub mod cm;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod mrc;
pub mod protocol;
pub mod server;
pub mod signin;
pub mod vdf;

use catalog::{Catalog, SharedCatalog};
use cm::CmConnector;
use coordinator::{Bootstrap, Coordinator, StopAll};
use env::{ListenEndpoint, Settings};
use mrc::MrcDispatcher;

/// Global server status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// First account sign-ins and initial manifest generation are being
    /// performed; HTTP requests answer 503.
    Setup = 0,
    Running = 1,
    Stopping = 2,
}

/// Lock-free cell holding the global [`Status`].
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> Status {
        match self.0.load(Ordering::Relaxed) {
            0 => Status::Setup,
            1 => Status::Running,
            _ => Status::Stopping,
        }
    }

    pub fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::Relaxed);
    }
}

/// State shared with every HTTP worker.
#[derive(Clone)]
pub struct AppState {
    pub status: Arc<StatusCell>,
    pub catalog: SharedCatalog,
    pub coordinator: Addr<Coordinator>,
    pub dispatcher: Addr<MrcDispatcher>,
    pub connector: Arc<dyn CmConnector>,
}

/// Initialize the global tracing subscriber: console output on stderr,
/// level from `RUST_LOG` with the configured level as the fallback.
pub fn setup_logger(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .try_init();
}

/// Run the broker until SIGINT/SIGTERM or a fatal engine error. Returns
/// the process exit code.
pub async fn run(settings: Settings, connector: Arc<dyn CmConnector>) -> anyhow::Result<i32> {
    let endpoint = settings.endpoint()?;
    let catalog: SharedCatalog = Arc::new(RwLock::new(Catalog::load(settings.state_path())));
    let status = Arc::new(StatusCell::new(Status::Setup));
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<i32>();

    let dispatcher = MrcDispatcher::new(catalog.clone()).start();
    let coordinator = Coordinator::new(
        catalog.clone(),
        status.clone(),
        Arc::clone(&connector),
        shutdown_tx,
    )
    .start();
    coordinator.send(Bootstrap).await?;

    let app_state = AppState {
        status: status.clone(),
        catalog,
        coordinator: coordinator.clone(),
        dispatcher,
        connector,
    };
    let http = HttpServer::new({
        let app_state = app_state.clone();
        move || {
            App::new()
                .app_data(web::Data::new(app_state.clone()))
                .configure(server::configure)
        }
    })
    .workers(1)
    .disable_signals();
    let http = match &endpoint {
        ListenEndpoint::Tcp { host, port } => {
            info!("Listening on {host}:{port}");
            http.bind((host.as_str(), *port))?
        }
        #[cfg(unix)]
        ListenEndpoint::Unix { perms } => {
            use std::os::unix::fs::PermissionsExt;
            let http = http.bind_uds(env::UNIX_SOCKET_PATH)?;
            std::fs::set_permissions(
                env::UNIX_SOCKET_PATH,
                std::fs::Permissions::from_mode(*perms),
            )?;
            info!("Listening on {}", env::UNIX_SOCKET_PATH);
            http
        }
    };
    let http = http.run();
    let http_handle = http.handle();
    let http_task = actix_web::rt::spawn(http);

    let exit_code = tokio::select! {
        _ = shutdown_signal() => {
            info!("Stop requested, shutting down");
            0
        }
        Some(code) = shutdown_rx.recv() => code,
    };

    status.store(Status::Stopping);
    http_handle.stop(true).await;
    let _ = http_task.await;
    coordinator.send(StopAll).await?;
    Ok(exit_code)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
