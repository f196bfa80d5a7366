use crate::{
    bili_source::BiliSource,
    cli::HarvestArgs,
    config::{validate_harvest_args, HarvestConfig},
    db::SqliteStore,
    fetch_client::{FetchClient, HeaderSpoofer, ProxyPool},
    logging::{format_error_report, init_logging, LoggingContext},
    pipeline::{run_pipeline, HarvestSources},
    server::{register_metrics, setup_server_with_addr},
    state::AppState,
};
use dotenv::dotenv;
use governor::{Quota, RateLimiter};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancels `shutdown` on the first SIGTERM or SIGINT.
pub async fn handle_shutdown_signals(shutdown: CancellationToken) {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(err), _) | (_, Err(err)) => {
            error!(
                event = "signal_handler_failed",
                error = %err,
                "failed to register signal handlers"
            );
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!(event = "shutdown_signal", signal = "SIGTERM", "SIGTERM received, shutting down");
        }
        _ = sigint.recv() => {
            info!(event = "shutdown_signal", signal = "SIGINT", "SIGINT received, shutting down");
        }
        _ = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}

/// Runs one harvest and returns the process exit code.
///
/// `0` for a clean run, `1` for a fatal failure, `2` for invalid configuration.
pub async fn run_harvest(args: HarvestArgs, shutdown: CancellationToken) -> i32 {
    dotenv().ok();

    if let Err(err) = validate_harvest_args(&args) {
        eprintln!("{err}");
        return 2;
    }
    let config = match HarvestConfig::resolve(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };

    let logging_context =
        LoggingContext::for_run(config.endpoints.category_id, &config.database_path);
    init_logging(&logging_context, &args.log_level);
    let run_span = logging_context.run_span();
    let _run_guard = run_span.enter();
    info!(event = "harvest_starting", "starting harvest run");

    let spoofer = match HeaderSpoofer::from_files(
        config.user_agents_file.as_deref(),
        config.ip_prefixes_file.as_deref(),
    ) {
        Ok(spoofer) => spoofer,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };

    let store = match SqliteStore::open(&config.database_path) {
        Ok(store) => store,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "harvest_store_open_failed",
                path = %config.database_path.display(),
                error = %err,
                error_report = %error_report,
                "failed to open store"
            );
            eprintln!(
                "failed to open store at {}: {err}",
                config.database_path.display()
            );
            eprintln!("{error_report}");
            return 1;
        }
    };

    let app_state = Arc::new(AppState::new(store.clone(), shutdown.clone()));
    register_metrics(&app_state).await;
    let metrics_server_handle = match config.metrics_bind {
        Some(addr) => match setup_server_with_addr(app_state.clone(), addr).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                let error_report = format_error_report(&err);
                error!(
                    event = "harvest_metrics_server_start_failed",
                    bind = %addr,
                    error = %err,
                    error_report = %error_report,
                    "failed to start metrics endpoint"
                );
                eprintln!("failed to start metrics endpoint on {addr}: {err}");
                return 1;
            }
        },
        None => None,
    };

    let proxy_pool = match config
        .proxy_url
        .as_deref()
        .filter(|_| config.fetch_policy.use_proxy)
    {
        Some(url) => match ProxyPool::new(url) {
            Ok(pool) => Some(pool),
            Err(err) => {
                error!(
                    event = "harvest_proxy_pool_failed",
                    error = %err,
                    "failed to build proxy pool client"
                );
                eprintln!("failed to build proxy pool client: {err}");
                return 1;
            }
        },
        None => None,
    };

    let client = match FetchClient::new(
        config.fetch_policy,
        proxy_pool,
        spoofer,
        shutdown.clone(),
    ) {
        Ok(client) => client,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "harvest_fetch_client_failed",
                error = %err,
                error_report = %error_report,
                "failed to build fetch client"
            );
            eprintln!("failed to build fetch client: {err}");
            return 1;
        }
    };
    let client = match config.global_rps {
        Some(rps) => {
            info!(
                event = "harvest_rate_limited",
                global_rps = rps.get(),
                "global request budget enabled"
            );
            client.with_rate_limiter(Arc::new(RateLimiter::direct(Quota::per_second(rps))))
        }
        None => client,
    };

    let source = match BiliSource::new(Arc::new(client), config.endpoints.clone()) {
        Ok(source) => Arc::new(source),
        Err(err) => {
            error!(
                event = "harvest_source_failed",
                error = %err,
                "failed to build source adapter"
            );
            eprintln!("failed to build source adapter: {err}");
            return 1;
        }
    };

    let result = run_pipeline(
        config.pipeline,
        HarvestSources::from_source(source),
        store,
        shutdown.clone(),
    )
    .await;

    shutdown.cancel();
    if let Some(handle) = metrics_server_handle {
        if let Err(err) = handle.await {
            warn!(
                event = "harvest_metrics_server_join_failed",
                error = %err,
                "metrics server task failed"
            );
        }
    }

    match result {
        Ok(summary) => {
            for fatal in &summary.fatal_errors {
                error!(
                    event = "harvest_worker_error",
                    error = %fatal,
                    "worker stopped on a fatal error"
                );
            }
            info!(
                event = "harvest_complete",
                outcome = ?summary.outcome,
                pages_enumerated = summary.pages_enumerated,
                items_enqueued = summary.items_enqueued,
                deleted_items = summary.deleted_items,
                exit_code = summary.exit_code(),
                "harvest run finished"
            );
            summary.exit_code()
        }
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "harvest_failed",
                error = %err,
                error_debug = ?err,
                error_report = %error_report,
                "harvest run failed"
            );
            eprintln!("harvest failed: {err}");
            eprintln!("{error_report}");
            1
        }
    }
}
