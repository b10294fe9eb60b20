use std::fmt;
use std::sync::Arc;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument};

use crate::capabilities::{HttpClient, HttpError, ValidatedUrl};
use crate::config::BillingConfig;
use crate::model::Session;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BillingError {
    #[error("sign in to subscribe")]
    Unauthenticated,

    #[error("payment backend error: {0}")]
    Http(#[from] HttpError),

    #[error("payment backend returned an incomplete sheet: missing {field}")]
    IncompleteSheet { field: &'static str },
}

impl BillingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Http(e) if e.is_retryable())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Basic,
    Premium,
}

impl Plan {
    /// Price in cents.
    pub const fn amount_cents(self) -> u32 {
        match self {
            Plan::Basic => 499,
            Plan::Premium => 999,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Plan::Basic => "basic",
            Plan::Premium => "premium",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the native payment sheet needs to present a checkout.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSheet {
    pub payment_intent: String,
    pub ephemeral_key: String,
    pub customer: String,
}

// Client secrets stay out of logs.
impl fmt::Debug for PaymentSheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentSheet")
            .field("customer", &self.customer)
            .finish_non_exhaustive()
    }
}

pub struct Billing {
    http: Arc<dyn HttpClient>,
    session: Session,
    endpoint: ValidatedUrl,
    currency: String,
    api_key: Option<SecretString>,
}

impl Billing {
    pub fn new(
        http: Arc<dyn HttpClient>,
        session: Session,
        config: &BillingConfig,
        api_key: Option<SecretString>,
    ) -> Result<Self, BillingError> {
        Ok(Self {
            http,
            session,
            endpoint: ValidatedUrl::new(config.payment_endpoint.as_str())?,
            currency: config.currency.clone(),
            api_key,
        })
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Creates a payment intent for `plan` on behalf of the signed-in user.
    #[instrument(skip_all, fields(plan = %plan))]
    pub async fn checkout(&self, plan: Plan) -> Result<PaymentSheet, BillingError> {
        let owner = self.session.owner().ok_or(BillingError::Unauthenticated)?;
        let body = json!({ "plan": plan, "uid": owner.as_str() });

        let reply = self
            .http
            .post_json(&self.endpoint, self.api_key.as_ref(), &body)
            .await?;

        let field = |name: &'static str| {
            reply
                .get(name)
                .and_then(serde_json::Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or(BillingError::IncompleteSheet { field: name })
        };
        let sheet = PaymentSheet {
            payment_intent: field("paymentIntent")?,
            ephemeral_key: field("ephemeralKey")?,
            customer: field("customer")?,
        };

        info!(
            amount = plan.amount_cents(),
            currency = %self.currency,
            "Payment sheet ready"
        );
        Ok(sheet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ScriptedHttpClient;
    use crate::model::OwnerId;

    fn billing(http: Arc<ScriptedHttpClient>, session: Session) -> Billing {
        Billing::new(http, session, &BillingConfig::default(), None).unwrap()
    }

    #[test]
    fn plan_prices() {
        assert_eq!(Plan::Basic.amount_cents(), 499);
        assert_eq!(Plan::Premium.amount_cents(), 999);
        assert_eq!(serde_json::to_value(Plan::Premium).unwrap(), "premium");
    }

    #[tokio::test]
    async fn checkout_requires_sign_in() {
        let http = Arc::new(ScriptedHttpClient::new());
        let err = billing(http.clone(), Session::SignedOut)
            .checkout(Plan::Basic)
            .await
            .unwrap_err();
        assert_eq!(err, BillingError::Unauthenticated);
        assert!(http.requests().is_empty());
    }

    #[tokio::test]
    async fn checkout_posts_plan_and_uid() {
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_response(Ok(json!({
            "paymentIntent": "pi_123_secret",
            "ephemeralKey": "ek_456",
            "customer": "cus_789"
        })));
        let billing = billing(http.clone(), Session::signed_in(OwnerId::new("u1").unwrap()));

        let sheet = billing.checkout(Plan::Basic).await.unwrap();
        assert_eq!(sheet.customer, "cus_789");
        assert_eq!(sheet.payment_intent, "pi_123_secret");
        assert!(!format!("{sheet:?}").contains("pi_123"));

        let requests = http.requests();
        assert_eq!(requests[0].body, json!({"plan": "basic", "uid": "u1"}));
        assert!(requests[0].url.ends_with("/createPaymentIntent"));
    }

    #[tokio::test]
    async fn incomplete_reply_is_an_error() {
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_response(Ok(json!({"paymentIntent": "pi", "customer": "cus"})));
        let billing = billing(http, Session::signed_in(OwnerId::new("u1").unwrap()));

        assert_eq!(
            billing.checkout(Plan::Premium).await.unwrap_err(),
            BillingError::IncompleteSheet {
                field: "ephemeralKey"
            }
        );
    }
}
