use std::net::SocketAddr;

use tracing::{info, warn};
use yarn_jobs::{Pod, Scheduler, jobs};
use yarn_types::{Config, SOFTWARE, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yarnd=debug,yarn_cache=info,yarn_jobs=info,tower_http=debug".into()),
        )
        .init();

    // Config
    let conf = Config::from_env()?;
    let addr: SocketAddr = conf.bind.parse()?;
    info!("{} {} starting for {}", SOFTWARE, VERSION, conf.base_url);
    if conf.debug {
        warn!("Debug mode: private peers and short fetch intervals are allowed");
    }

    let pod = Pod::open(conf).await?;

    // Startup jobs run in the background so the listener comes up at once.
    let mut scheduler = Scheduler::new();
    jobs::register(&pod, &mut scheduler)?;
    {
        let pod = pod.clone();
        tokio::spawn(async move { jobs::run_startup(&pod).await });
    }
    scheduler.start().await;

    let app = yarn_server::router(pod.clone());

    info!("{} listening on {}", pod.conf.name, addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                stop_rx.await.ok();
            })
            .await
    });

    shutdown_signal().await;

    // Jobs first, then queued tasks, then HTTP, then the store.
    scheduler.stop().await;
    pod.dispatcher.stop().await;
    let _ = stop_tx.send(());
    server.await??;
    pod.persist().await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("failed to install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
