use std::sync::Arc;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use scheduler::{api, config::Config, tls};
use scheduler_core::engine::{Engine, EngineConfig};
use scheduler_core::store::Store;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::Service;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    if let Err(e) = run().await {
        tracing::error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let config = Config::from_env()?;

    let store = Store::open(&config.db_path).await?;
    let engine = Engine::new(
        store.clone(),
        EngineConfig { task_timeout: config.task_timeout, condition_timeout: config.condition_timeout },
    );
    engine.start().await;

    let auth = match &config.auth_config_path {
        Some(path) => Some(api::auth::AuthConfig::load(path)?),
        None => None,
    };

    let state = Arc::new(api::AppState {
        store: store.clone(),
        engine: engine.clone(),
        auth,
        default_account: config.default_account.clone(),
        base_path: config.base_path.clone(),
    });

    let app = api::build_router(state, &config);
    let addr = std::net::SocketAddr::new(config.host, config.port);
    let listener = TcpListener::bind(addr).await?;
    let shutdown = CancellationToken::new();
    spawn_signal_watcher(shutdown.clone());

    tracing::info!(%addr, ssl = config.enable_ssl, "scheduler listening");

    if config.enable_ssl {
        let cert_path = config.cert_path.as_deref().expect("validated at config load");
        let key_path = config.key_path.as_deref().expect("validated at config load");
        let tls_config = tls::load_server_config(cert_path, key_path)?;
        serve_tls(listener, app, tls_config, shutdown.clone()).await?;
    } else {
        let signal = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await?;
    }

    engine.stop().await;
    store.close().await;
    Ok(())
}

/// Cancels `token` on SIGINT, or on SIGTERM where the platform has one (§6).
fn spawn_signal_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("could not install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received");
        token.cancel();
    });
}

async fn serve_tls(
    listener: TcpListener,
    app: axum::Router,
    tls_config: Arc<rustls::ServerConfig>,
    shutdown: CancellationToken,
) -> eyre::Result<()> {
    let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let acceptor = acceptor.clone();
                let mut app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!(%peer, "tls handshake failed: {e}");
                            return;
                        }
                    };
                    let io = TokioIo::new(tls_stream);
                    let service = TowerToHyperService::new(tower::service_fn(move |req| app.call(req)));
                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        tracing::warn!(%peer, "connection error: {e}");
                    }
                });
            }
        }
    }
}
