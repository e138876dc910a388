//! Rota Fetch - Entry Point
//!
//! Dispatches each URL given on the command line through the proxy pool and
//! prints one status line per request.
//!
//! Usage: `rota-fetch [--key KEY] [--direct] URL...`

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rota_fetch::cache::MemoryCacheStore;
use rota_fetch::config::{Config, LogConfig};
use rota_fetch::proxy::{
    BlazingProxiesProvider, DispatchRequest, Dispatcher, ProxyInventory, ProxyProvider,
    ReqwestTransport, StaticProvider,
};
use rota_fetch::services::{InventoryRefresher, InventoryRefresherConfig, InventoryRefresherHandle};
use rota_fetch::telemetry::{HttpCollector, TelemetryCollector, TelemetrySink, TracingCollector};

struct Args {
    key: Option<String>,
    direct: bool,
    urls: Vec<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        key: None,
        direct: false,
        urls: Vec::new(),
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--key" => args.key = Some(iter.next().context("--key needs a value")?),
            "--direct" => args.direct = true,
            flag if flag.starts_with("--") => bail!("unknown flag: {}", flag),
            _ => args.urls.push(arg),
        }
    }

    if args.urls.is_empty() {
        bail!("usage: rota-fetch [--key KEY] [--direct] URL...");
    }
    Ok(args)
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rota_fetch={}", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("pretty") {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(&config.log);

    let args = parse_args()?;
    info!("Starting Rota Fetch");

    let provider: Arc<dyn ProxyProvider> = match &config.provider.static_proxies {
        Some(records) => Arc::new(StaticProvider::from_records(records)),
        None => Arc::new(
            BlazingProxiesProvider::from_config(&config.provider)
                .context("failed to build proxy provider")?,
        ),
    };
    let inventory = ProxyInventory::new(
        Arc::new(MemoryCacheStore::new()),
        provider,
        config.inventory.clone(),
    );

    let collector: Arc<dyn TelemetryCollector> = match &config.telemetry.endpoint {
        Some(endpoint) => Arc::new(
            HttpCollector::new(endpoint).context("failed to build telemetry collector")?,
        ),
        None => Arc::new(TracingCollector),
    };
    let telemetry = TelemetrySink::from_config(collector, &config.telemetry);

    let dispatcher = Arc::new(Dispatcher::new(
        &config,
        inventory.clone(),
        Arc::new(ReqwestTransport::new()),
        telemetry,
    ));

    // Start inventory refresher
    let (refresh_handle, refresh_shutdown) = InventoryRefresherHandle::new();
    let refresh_task = config.inventory.refresh_interval.map(|check_interval| {
        let refresher = InventoryRefresher::new(
            inventory.clone(),
            InventoryRefresherConfig {
                check_interval,
                force: false,
            },
        );
        tokio::spawn(async move { refresher.run(refresh_shutdown).await })
    });

    let requests = args.urls.into_iter().map(|url| {
        let dispatcher = Arc::clone(&dispatcher);
        let mut request = DispatchRequest::get(url.clone());
        if let Some(key) = &args.key {
            request = request.with_key(key.clone());
        }
        if args.direct {
            request = request.direct();
        }
        tokio::spawn(async move { (url, dispatcher.request(request).await) })
    });
    let all = futures::future::join_all(requests);

    let results = tokio::select! {
        results = all => results,
        _ = shutdown_signal() => {
            warn!("Shutdown signal received, abandoning in-flight requests");
            Vec::new()
        }
    };

    let mut failures = 0;
    for joined in results {
        match joined {
            Ok((url, Ok(response))) => {
                let proxy = response
                    .proxy
                    .map(|p| p.address())
                    .unwrap_or_else(|| "direct".to_string());
                println!("{} {} {} bytes via {}", response.status.as_u16(), url, response.body.len(), proxy);
            }
            Ok((url, Err(e))) => {
                failures += 1;
                println!("{} {} {}", e.status_marker(), url, e);
            }
            Err(e) => {
                failures += 1;
                error!("Request task failed: {}", e);
            }
        }
    }

    refresh_handle.shutdown();
    if let Some(task) = refresh_task {
        let _ = task.await;
    }

    let stats = dispatcher.stats();
    info!(
        proxies = stats.proxies,
        rate_buckets = stats.rate_buckets,
        failures,
        "Rota Fetch finished"
    );
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
