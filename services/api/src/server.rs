use crate::cli::ServeArgs;
use crate::infra::{seed_demo_book, AppState};
use crate::routes::with_reconciliation_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use repayment_reconciler::config::{AppConfig, AppEnvironment};
use repayment_reconciler::error::AppError;
use repayment_reconciler::reconciliation::{
    DispatchWorker, Dispatcher, HttpNotifier, InMemoryLedgerStore, QueuedAlertPublisher,
    ReconciliationError, ReconciliationService,
};
use repayment_reconciler::telemetry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let store = Arc::new(InMemoryLedgerStore::new());
    if config.environment != AppEnvironment::Production {
        seed_demo_book(&store).map_err(ReconciliationError::from)?;
        info!("seeded demo obligation book");
    }

    let (dispatcher, queue) = Dispatcher::channel();
    let notifier = HttpNotifier::new(
        config.dispatch.targets.clone(),
        config.dispatch.request_timeout,
    )?;
    let worker = DispatchWorker::new(queue, Arc::new(notifier), config.dispatch.retry)
        .with_max_in_flight(config.dispatch.max_in_flight);
    tokio::spawn(async move {
        let summary = worker.run().await;
        info!(
            delivered = summary.delivered,
            failed = summary.failed,
            "dispatch worker stopped"
        );
    });

    let alerts = Arc::new(QueuedAlertPublisher::new(dispatcher.clone()));
    let reconciliation_service = Arc::new(ReconciliationService::new(
        store,
        alerts,
        dispatcher,
        config.reconciliation.clone(),
    ));

    let app = with_reconciliation_routes(reconciliation_service)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "repayment reconciler ready");

    axum::serve(listener, app).await?;
    Ok(())
}
