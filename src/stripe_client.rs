use anyhow::{Context, Result};
use async_trait::async_trait;
use stripe::{
    CheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData, Currency, StripeError,
};
use tracing::{error, info};

use crate::payment_gateway::{
    CheckoutSessionHandle, CheckoutSessionRequest, GatewayError, PaymentGateway,
};

/// Stripe rejects expirations closer than 30 minutes to when it receives the
/// request, so sessions get this much extra time.
const EXPIRY_SLACK_SECS: i64 = 60;

/// Configuration for Stripe integration
#[derive(Clone)]
pub struct StripeConfig {
    pub client: Client,
    pub webhook_secret: String,
}

impl StripeConfig {
    /// Initialize Stripe configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let secret_key =
            std::env::var("STRIPE_SECRET_KEY").context("STRIPE_SECRET_KEY must be set")?;
        let webhook_secret =
            std::env::var("STRIPE_WEBHOOK_SECRET").context("STRIPE_WEBHOOK_SECRET must be set")?;

        let client = Client::new(secret_key);

        Ok(Self {
            client,
            webhook_secret,
        })
    }
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("webhook_secret", &"[REDACTED]")
            .finish()
    }
}

/// Checkout sessions through the Stripe API
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
}

impl StripeGateway {
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            client: config.client.clone(),
        }
    }
}

fn classify(err: StripeError) -> GatewayError {
    match err {
        StripeError::Stripe(request_error) => GatewayError::Rejected(request_error.to_string()),
        other => GatewayError::Unreachable(other.to_string()),
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSessionHandle, GatewayError> {
        let currency: Currency =
            serde_json::from_value(serde_json::Value::String(request.currency.to_lowercase()))
                .map_err(|_| {
                    GatewayError::Rejected(format!("unsupported currency {}", request.currency))
                })?;

        let mut params = CreateCheckoutSession::new();
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.mode = Some(CheckoutSessionMode::Payment);
        params.client_reference_id = Some(&request.client_reference_id);
        params.customer_email = request.customer_email.as_deref();
        params.expires_at = Some(request.expires_at.timestamp() + EXPIRY_SLACK_SECS);
        params.metadata = Some(request.metadata.clone());
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency,
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: request.product_name.clone(),
                    ..Default::default()
                }),
                unit_amount: Some(request.amount_cents),
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        }]);

        let session = CheckoutSession::create(&self.client, params)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to create checkout session");
                metrics::counter!("stripe.api.errors").increment(1);
                classify(e)
            })?;

        let session_id = session.id.to_string();
        let redirect_url = session
            .url
            .ok_or_else(|| GatewayError::Rejected(format!("session {} has no url", session_id)))?;

        info!(session_id = %session_id, "Created Stripe checkout session");

        Ok(CheckoutSessionHandle {
            session_id,
            redirect_url,
        })
    }
}
