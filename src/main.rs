use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use updown_engine::application::handlers::control_handler;
use updown_engine::application::market_session::SessionDeps;
use updown_engine::application::session_controller::SessionController;
use updown_engine::config::{EngineConfig, LiveCredentials};
use updown_engine::domain::repositories::broker_adapter::BrokerAdapter;
use updown_engine::domain::repositories::clock::{Clock, SystemClock};
use updown_engine::domain::repositories::session_store::SessionStore;
use updown_engine::domain::services::entry_signal::EntrySignalEvaluator;
use updown_engine::domain::services::order_fill_engine::OrderFillEngine;
use updown_engine::domain::services::position_ledger::{LedgerSnapshot, PositionLedger};
use updown_engine::domain::services::risk_exit_monitor::RiskExitMonitor;
use updown_engine::infrastructure::clob_client::{create_rate_limiter, ApiCredentials, ClobClient};
use updown_engine::infrastructure::gamma_feed::GammaMarketFeed;
use updown_engine::infrastructure::live_broker::LiveBroker;
use updown_engine::infrastructure::order_signing::OrderSigner;
use updown_engine::infrastructure::paper_broker::{PaperBroker, PaperConfig};
use updown_engine::persistence::repository::{BotStateRepository, SqliteSessionStore};
use updown_engine::persistence::{init_database, DatabaseConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "updown_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    info!(
        "Up/down engine starting ({} mode), trigger {} target {} offset {}",
        if config.paper_trading { "paper" } else { "live" },
        config.trigger_price,
        config.target_price,
        config.stoploss_offset
    );

    let pool = init_database(&DatabaseConfig {
        url: config.database_url.clone(),
        ..DatabaseConfig::from_env()
    })
    .await?;
    let stored = BotStateRepository::new(pool.clone())
        .get_or_create(config.paper_trading, config.paper_balance)
        .await?;
    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(pool));

    let snapshot = LedgerSnapshot {
        balance: stored.balance,
        total_pnl: stored.total_pnl,
        trades_count: stored.trades_count.max(0) as u32,
        wins: stored.wins.max(0) as u32,
        losses: stored.losses.max(0) as u32,
    };
    if stored.is_running {
        warn!("Previous run did not stop cleanly; starting idle");
    }

    let limiter = create_rate_limiter(config.clob_requests_per_second);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (broker, ledger): (Arc<dyn BrokerAdapter>, Arc<PositionLedger>) = if config.paper_trading {
        // the paper account carries its balance across restarts
        let prices = Arc::new(ClobClient::public(&config.clob_host, limiter));
        let paper = PaperBroker::new(
            prices,
            PaperConfig {
                starting_balance: snapshot.balance,
                ..config.paper_config()
            },
        );
        (
            Arc::new(paper),
            Arc::new(PositionLedger::restore(config.fee_model(), &snapshot)),
        )
    } else {
        let credentials = LiveCredentials::from_env()?;
        let signer = OrderSigner::new(&credentials.private_key, credentials.funder.as_deref())?;
        let client = ClobClient::authenticated(
            &config.clob_host,
            limiter,
            signer,
            ApiCredentials {
                api_key: credentials.api_key.clone(),
                api_secret: credentials.api_secret.clone(),
                api_passphrase: credentials.api_passphrase.clone(),
            },
        );
        let live = LiveBroker::new(client)?;
        let balance = match live.get_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!("Collateral balance unavailable at startup: {}", e);
                snapshot.balance
            }
        };
        (
            Arc::new(live),
            Arc::new(PositionLedger::restore(
                config.fee_model(),
                &LedgerSnapshot {
                    balance,
                    ..snapshot
                },
            )),
        )
    };
    info!("Ledger restored: {:?}", ledger.snapshot());

    let fill_engine = Arc::new(OrderFillEngine::new(
        broker.clone(),
        ledger.clone(),
        config.fill_config(),
    ));
    let feed = Arc::new(GammaMarketFeed::new(
        &config.gamma_host,
        &config.market_slug_prefix,
        config.market_window_secs,
        clock.clone(),
    ));

    let controller = Arc::new(SessionController::new(
        SessionDeps {
            broker,
            feed,
            clock,
            ledger,
            fill_engine,
            risk: RiskExitMonitor::new(config.risk_config()),
            entry: EntrySignalEvaluator::new(config.entry_config()),
            store,
        },
        config.session_config(),
    ));

    if config.auto_start {
        if let Err(e) = controller.start(None).await {
            error!("Auto start failed: {}", e);
        }
    }

    let app = control_handler::router(controller.clone()).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.control_bind_addr.parse()?;
    info!("Control surface listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Server shutting down, stopping the session...");
    if controller.is_running().await {
        if let Err(e) = controller.stop().await {
            warn!("Stop during shutdown: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}
