use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use http::HeaderValue;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use carebook as app;
use app::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use app::config::AppConfig;
use app::integrations::{GatewayClient, HttpClinicClient, HttpSponsorshipClient};
use app::models::VendorKey;
use app::repositories::{
    CartRepository, InMemoryCartRepository, InMemoryVendorReferenceRepository, RedisCartRepository,
    VendorReferenceRepository,
};
use app::retry::RetryPolicy;
use app::services::booking::{
    BookingOrchestrator, BookingService, Collaborators, LeaseRegistry, SagaSettings,
};
use app::services::cart_store::CartStore;
use app::services::payments::GatewayPaymentCoordinator;
use app::services::reconciliation::ReconciliationQueue;
use app::services::slot_resolver::SlotResolver;
use app::services::vendors::{
    ClinicAdapter, HomeCollectionAdapter, LabNetworkAdapter, PartnerClinicAdapter,
    PhlebotomyAdapter, VendorRegistry,
};

/// How often carts whose remote push failed are retried.
const CART_SYNC_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = app::config::load_config()?;
    app::config::init_tracing(cfg.log_level(), cfg.log_json);
    app::handlers::health::init_start_time();

    let (event_sender, event_rx) = app::events::EventSender::channel(cfg.event_channel_capacity);
    tokio::spawn(app::events::process_events(event_rx));

    let timeout = cfg.http_timeout();
    let offset = cfg.vendor_offset();
    let retry = RetryPolicy::new(cfg.vendor_retry_attempts, cfg.retry_backoff());

    let clinic = Arc::new(
        HttpClinicClient::new(cfg.clinic_base_url.clone(), timeout)
            .context("failed to build clinic client")?,
    );
    let sponsorship = Arc::new(
        HttpSponsorshipClient::new(cfg.sponsorship_base_url.clone(), timeout)
            .context("failed to build sponsorship client")?,
    );
    let gateway = GatewayClient::new(
        cfg.payment_gateway_base_url.clone(),
        cfg.payment_key_id.clone(),
        cfg.payment_key_secret.clone(),
        timeout,
    )
    .context("failed to build payment gateway client")?;
    let payments = Arc::new(GatewayPaymentCoordinator::new(
        gateway,
        cfg.currency.clone(),
        cfg.payment_timeout(),
    ));

    let cart_repository: Arc<dyn CartRepository> =
        match cfg.cart_cache_backend.to_ascii_lowercase().as_str() {
            "redis" => match RedisCartRepository::new(&cfg.redis_url, cfg.cart_cache_namespace.clone()) {
                Ok(repo) => Arc::new(repo),
                Err(err) => {
                    error!(
                        "Failed to initialize Redis cart cache (falling back to in-memory): {}",
                        err
                    );
                    Arc::new(InMemoryCartRepository::new())
                }
            },
            _ => Arc::new(InMemoryCartRepository::new()),
        };
    let carts = Arc::new(CartStore::new(
        cart_repository,
        clinic.clone(),
        event_sender.clone(),
    ));

    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: cfg.circuit_breaker_failure_threshold,
        timeout: cfg.circuit_breaker_timeout(),
        ..Default::default()
    }));
    let references: Arc<dyn VendorReferenceRepository> =
        Arc::new(InMemoryVendorReferenceRepository::new());

    let mut slots = SlotResolver::new(retry, offset).with_source(VendorKey::Clinic, clinic.clone());
    let mut vendors = VendorRegistry::new(breakers.clone())
        .with(Arc::new(ClinicAdapter::new(clinic.clone(), references.clone())));
    for vendor in VendorKey::ALL {
        let Some(endpoint) = cfg.vendors.endpoint(vendor) else {
            continue;
        };
        match vendor {
            VendorKey::Clinic => {}
            VendorKey::PartnerClinic => {
                let adapter = Arc::new(PartnerClinicAdapter::new(endpoint, timeout, references.clone())?);
                slots = slots.with_source(vendor, adapter.clone());
                vendors.register(adapter);
            }
            VendorKey::HomeCollection => {
                vendors.register(Arc::new(HomeCollectionAdapter::new(
                    endpoint,
                    timeout,
                    references.clone(),
                )?));
            }
            VendorKey::Phlebotomy => {
                vendors.register(Arc::new(PhlebotomyAdapter::new(
                    endpoint,
                    timeout,
                    offset,
                    references.clone(),
                )?));
            }
            VendorKey::LabNetwork => {
                vendors.register(Arc::new(LabNetworkAdapter::new(
                    endpoint,
                    timeout,
                    references.clone(),
                )?));
            }
        }
        info!(%vendor, "diagnostics vendor enabled");
    }
    if vendors.vendors().len() == 1 {
        warn!("no diagnostics vendors configured; only consultations can be booked");
    }

    let orchestrator = Arc::new(BookingOrchestrator::new(
        Collaborators {
            carts: carts.clone(),
            clinic: clinic.clone(),
            remote_cart: clinic.clone(),
            sponsorship,
            payments,
            vendors: Arc::new(vendors),
            reconciliation: Arc::new(ReconciliationQueue::new()),
            leases: Arc::new(LeaseRegistry::default()),
            events: event_sender.clone(),
        },
        SagaSettings {
            retry,
            offset,
            currency: cfg.currency.clone(),
            support_contact: cfg.support_contact.clone(),
        },
    ));

    let bookings = Arc::new(BookingService::new(orchestrator).with_retention(cfg.booking_retention()));

    let (sync_carts, prune_bookings) = (carts.clone(), bookings.clone());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CART_SYNC_INTERVAL);
        loop {
            ticker.tick().await;
            let synced = sync_carts.sync_pending().await;
            if synced > 0 {
                info!(synced, "deferred cart pushes completed");
            }
            let pruned = prune_bookings.prune_settled();
            let idle_locks = sync_carts.prune_idle_locks();
            if pruned > 0 || idle_locks > 0 {
                info!(pruned, idle_locks, "settled bookings and idle cart locks dropped");
            }
        }
    });

    let app_state = app::AppState {
        config: Arc::new(cfg.clone()),
        slots: Arc::new(slots),
        carts,
        bookings,
        clinic,
        breakers,
        event_sender,
    };

    let router = app::app_router(app_state, cors_layer(&cfg)?);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;
    info!("carebook listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn cors_layer(cfg: &AppConfig) -> anyhow::Result<CorsLayer> {
    let origins: Vec<HeaderValue> = cfg
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if !origins.is_empty() {
        Ok(CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any))
    } else if cfg.is_production() {
        error!("Missing CORS configuration; set APP__CORS_ALLOWED_ORIGINS");
        anyhow::bail!("missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS")
    } else {
        info!("Using permissive CORS outside production");
        Ok(CorsLayer::permissive())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
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
    info!("shutdown signal received");
}
