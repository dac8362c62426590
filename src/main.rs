use flowline::auth::{challenge::spawn_sweeper, ChallengeStore, TokenManager};
use flowline::config::{self, Config, DEFAULT_DEVICE_TICKET_TTL};
use flowline::gateway::{handle_request, Gateway, GatewayConfig, TrustedProxies};
use flowline::limit::{spawn_janitor, ConnLimiter, IpRateLimiter};
use flowline::realtime::Hub;
use flowline::store::{Store, CONFIG_KEY_SECRET_HASH};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use log::{error, info, warn};
use std::convert::Infallible;
use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::init();

    let cfg = Config::from_env();
    if cfg.app_domain.is_empty() && config::is_prod_env() {
        error!("APP_DOMAIN is required in prod");
        process::exit(1);
    }

    if let Err(e) = run(cfg).await {
        error!("server error: {}", e);
        process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(&cfg.sqlite_path).await?;

    // Secret hash: environment first, registry config table second.
    let secret_hash = match env::var("APP_SECRET_HASH") {
        Ok(hash) if !hash.is_empty() => hash,
        _ => match store.get_config(CONFIG_KEY_SECRET_HASH).await {
            Ok(hash) if !hash.is_empty() => hash,
            _ => return Err("APP_SECRET_HASH is required".into()),
        },
    };

    let session_key = config::resolve_session_key(cfg.secure_cookies)?;
    let token_manager = TokenManager::new(session_key.as_bytes());

    let proxies_raw = env::var("TRUSTED_PROXY_CIDRS")
        .or_else(|_| env::var("TRUSTED_PROXIES"))
        .unwrap_or_default();
    let trusted_proxies = if proxies_raw.is_empty() {
        TrustedProxies::none()
    } else {
        TrustedProxies::parse(&proxies_raw)?
    };

    let conn_limiter = ConnLimiter::new(cfg.max_ws_conn_per_ip, cfg.max_ws_conn_global);
    let login_limiter = IpRateLimiter::new(cfg.rate_limit_rps, 10);
    let request_limiter = IpRateLimiter::new(cfg.rate_limit_rps, 10);
    let janitor = spawn_janitor(vec![
        Arc::clone(&login_limiter),
        Arc::clone(&request_limiter),
    ]);

    let challenge_store = ChallengeStore::new(cfg.challenge_ttl);
    let sweeper = spawn_sweeper(Arc::clone(&challenge_store));

    let hub = Hub::spawn();

    let gateway = Gateway::new(GatewayConfig {
        store,
        token_manager,
        hub: Arc::clone(&hub),
        challenge_store,
        login_limiter,
        request_limiter,
        conn_limiter,
        secret_hash,
        bootstrap_token: cfg.bootstrap_token.clone(),
        secure_cookies: cfg.secure_cookies,
        session_ttl: cfg.session_ttl,
        device_ticket_ttl: DEFAULT_DEVICE_TICKET_TTL,
        max_body_bytes: cfg.max_body_bytes,
        max_ws_msg_bytes: cfg.max_ws_msg_bytes,
        allowed_origin: cfg.app_domain.clone(),
        trusted_proxies,
    });

    let addr = cfg.listen_socket_addr()?;
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let gateway = Arc::clone(&gateway);
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let gateway = Arc::clone(&gateway);
                async move { Ok::<_, Infallible>(handle_request(gateway, remote, req).await) }
            }))
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = Server::bind(&addr)
        .http1_header_read_timeout(Duration::from_secs(15))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .serve(make_svc)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

    info!("server starting on {}", addr);
    let server_task = tokio::spawn(server);

    wait_for_signal().await;
    info!("received shutdown signal");

    // Stop accepting, close the hub (which closes every outbound queue),
    // then let in-flight requests finish under a 30 s cap.
    let _ = shutdown_tx.send(());
    hub.stop().await;
    sweeper.abort();
    janitor.abort();

    match tokio::time::timeout(Duration::from_secs(30), server_task).await {
        Ok(Ok(Ok(()))) => {
            info!("server stopped gracefully");
            Ok(())
        }
        Ok(Ok(Err(e))) => Err(e.into()),
        Ok(Err(join_err)) => Err(join_err.into()),
        Err(_) => {
            warn!("graceful shutdown timed out");
            Ok(())
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
