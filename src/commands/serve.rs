use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::JwtService;
use crate::booking_store::BookingStore;
use crate::bookings_repo::PgBookingStore;
use crate::checkout::CheckoutInitiator;
use crate::config::AppConfig;
use crate::database::{create_pool, run_migrations};
use crate::memory_store::MemoryBookingStore;
use crate::metrics::{init_metrics, initialize_booking_metrics, process_metrics_task};
use crate::reconciler::{ReconcilerSettings, WebhookReconciler};
use crate::stripe_client::{StripeConfig, StripeGateway};
use crate::users::{NewUser, UserRole};
use crate::web::{AppState, start_web_server};

pub async fn handle_serve(
    config: AppConfig,
    interface: String,
    port: u16,
    in_memory: bool,
) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "serve");
    });

    let jwt = JwtService::new(config.jwt_secret()?);

    let store: Arc<dyn BookingStore> = if in_memory {
        if config.is_production() {
            anyhow::bail!("--in-memory is not allowed in production");
        }
        warn!("Serving from the in-memory store, nothing will be persisted");
        let store: Arc<dyn BookingStore> = Arc::new(MemoryBookingStore::new());
        let admin = store
            .create_user(NewUser {
                email: "admin@studio.local".to_string(),
                role: UserRole::Admin,
            })
            .await?;
        info!(
            "Development admin {} token: {}",
            admin.email,
            jwt.generate_token(&admin)?
        );
        store
    } else {
        let pool = create_pool(config.database_url()?, config.db_pool_size)?;
        let migration_pool = pool.clone();
        let applied =
            tokio::task::spawn_blocking(move || run_migrations(&migration_pool)).await??;
        info!("Database ready ({} migration(s) applied)", applied);
        let store: Arc<dyn BookingStore> = Arc::new(PgBookingStore::new(pool));
        store
    };

    let metrics_handle = init_metrics()?;
    initialize_booking_metrics();
    tokio::spawn(process_metrics_task());

    let mut state = AppState::new(store.clone(), jwt).with_metrics(metrics_handle);

    // Without Stripe the catalog still works; checkout and webhooks answer 503
    match StripeConfig::from_env() {
        Ok(stripe_config) => {
            let gateway = Arc::new(StripeGateway::new(&stripe_config));
            state = state
                .with_checkout(CheckoutInitiator::new(
                    store.clone(),
                    gateway,
                    config.checkout_settings(),
                ))
                .with_reconciler(WebhookReconciler::new(
                    store.clone(),
                    ReconcilerSettings {
                        webhook_secret: stripe_config.webhook_secret.clone(),
                        tolerance_secs: config.webhook_tolerance_secs,
                    },
                ));
            info!("Stripe checkout enabled");
        }
        Err(e) => warn!("Stripe is not configured, checkout disabled: {}", e),
    }

    start_web_server(interface, port, state).await
}
