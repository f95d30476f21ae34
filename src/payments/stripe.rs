//! Stripe REST client
//!
//! Form-encoded requests against the subset of endpoints the booking core
//! needs. POSTs carry an `Idempotency-Key`; every call goes through the
//! configured [`RetryPolicy`].

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{info, instrument};

use super::errors::StripeErrorEnvelope;
use super::types::{
    Account, CreateIntentParams, PaymentIntent, Refund, RefundParams, Transfer, TransferParams,
};
use super::{PaymentProcessor, ProcessorError, RetryPolicy};
use crate::config::StripeConfig;

#[derive(Clone)]
pub struct StripeClient {
    http: Client,
    api_key: String,
    api_base: String,
    retry: RetryPolicy,
}

impl StripeClient {
    pub fn new(http: Client, api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(config: &StripeConfig) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self::new(http, config.api_key.clone(), config.api_base.clone())
            .with_retry(RetryPolicy::from(&config.retry)))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn apply_common_headers(&self, req: RequestBuilder, idempotency_key: Option<&str>) -> RequestBuilder {
        let req = req.bearer_auth(&self.api_key);
        match idempotency_key {
            Some(k) => req.header("Idempotency-Key", k),
            None => req,
        }
    }

    fn map_error(status: StatusCode, body: &str) -> ProcessorError {
        match serde_json::from_str::<StripeErrorEnvelope>(body) {
            Ok(env) => env.into_error(Some(status.as_u16())),
            Err(_) => ProcessorError::Http(format!("status={} body={}", status.as_u16(), body)),
        }
    }

    async fn send<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, ProcessorError> {
        let resp = req.send().await.map_err(|e| ProcessorError::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| ProcessorError::Decode(e.to_string()))?;
        if status.is_success() {
            serde_json::from_str::<T>(&text).map_err(|e| ProcessorError::Decode(e.to_string()))
        } else {
            Err(Self::map_error(status, &text))
        }
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        desc: &str,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<T, ProcessorError> {
        let url = self.url(path);
        self.retry
            .run(desc, || {
                let req = self.apply_common_headers(self.http.post(&url).form(form), idempotency_key);
                Self::send(req)
            })
            .await
    }

    // Retrieves stay lightweight: at most one retry
    async fn get<T: DeserializeOwned>(&self, desc: &str, path: &str) -> Result<T, ProcessorError> {
        let url = self.url(path);
        self.retry
            .capped(2)
            .run(desc, || {
                let req = self.apply_common_headers(self.http.get(&url), None);
                Self::send(req)
            })
            .await
    }
}

fn push_metadata(form: &mut Vec<(String, String)>, metadata: &std::collections::BTreeMap<String, String>) {
    for (k, v) in metadata {
        form.push((format!("metadata[{}]", k), v.clone()));
    }
}

pub(crate) fn intent_form(params: &CreateIntentParams) -> Result<Vec<(String, String)>, ProcessorError> {
    if !params.amount.is_positive() {
        return Err(ProcessorError::Precondition("amount must be positive minor units"));
    }
    let mut form: Vec<(String, String)> = vec![
        ("amount".into(), params.amount.get().to_string()),
        ("currency".into(), params.currency.to_ascii_lowercase()),
        ("automatic_payment_methods[enabled]".into(), "true".into()),
    ];
    if let Some(description) = &params.description {
        form.push(("description".into(), description.clone()));
    }
    if let Some(destination) = &params.destination {
        form.push(("transfer_data[destination]".into(), destination.clone()));
    }
    if let Some(fee) = params.application_fee {
        form.push(("application_fee_amount".into(), fee.get().to_string()));
    }
    push_metadata(&mut form, &params.metadata);
    Ok(form)
}

pub(crate) fn refund_form(params: &RefundParams) -> Result<Vec<(String, String)>, ProcessorError> {
    if !params.amount.is_positive() {
        return Err(ProcessorError::Precondition("refund amount must be positive"));
    }
    let mut form: Vec<(String, String)> = vec![
        ("payment_intent".into(), params.payment_intent.clone()),
        ("amount".into(), params.amount.get().to_string()),
    ];
    if params.reverse_transfer {
        form.push(("reverse_transfer".into(), "true".into()));
    }
    if params.refund_application_fee {
        form.push(("refund_application_fee".into(), "true".into()));
    }
    push_metadata(&mut form, &params.metadata);
    Ok(form)
}

pub(crate) fn transfer_form(params: &TransferParams) -> Result<Vec<(String, String)>, ProcessorError> {
    if !params.amount.is_positive() {
        return Err(ProcessorError::Precondition("transfer amount must be positive"));
    }
    let mut form: Vec<(String, String)> = vec![
        ("amount".into(), params.amount.get().to_string()),
        ("currency".into(), params.currency.to_ascii_lowercase()),
        ("destination".into(), params.destination.clone()),
    ];
    if let Some(source) = &params.source_transaction {
        form.push(("source_transaction".into(), source.clone()));
    }
    push_metadata(&mut form, &params.metadata);
    Ok(form)
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    // POST /v1/payment_intents
    #[instrument(skip(self, params), fields(method = "POST", path = "/v1/payment_intents", idempotency_key = %params.idempotency_key))]
    async fn create_payment_intent(&self, params: &CreateIntentParams) -> Result<PaymentIntent, ProcessorError> {
        let form = intent_form(params)?;
        info!(
            target: "stripe",
            method = "POST",
            path = "/v1/payment_intents",
            amount_cents = params.amount.get(),
            currency = %params.currency,
            destination = params.destination.as_deref().unwrap_or(""),
            idempotency_key = %params.idempotency_key,
            "stripe request"
        );
        self.post_form("create_payment_intent", "/v1/payment_intents", &form, Some(&params.idempotency_key))
            .await
    }

    // GET /v1/payment_intents/{id}
    #[instrument(skip(self), fields(method = "GET", path = "/v1/payment_intents/{id}"))]
    async fn retrieve_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, ProcessorError> {
        info!(target: "stripe", method = "GET", path = "/v1/payment_intents/{id}", intent_id = %intent_id, "stripe request");
        self.get("retrieve_payment_intent", &format!("/v1/payment_intents/{}", intent_id))
            .await
    }

    // POST /v1/payment_intents/{id}/cancel
    #[instrument(skip(self), fields(method = "POST", path = "/v1/payment_intents/{id}/cancel"))]
    async fn cancel_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, ProcessorError> {
        info!(target: "stripe", method = "POST", path = "/v1/payment_intents/{id}/cancel", intent_id = %intent_id, "stripe request");
        let key = format!("cancel:{}", intent_id);
        self.post_form(
            "cancel_payment_intent",
            &format!("/v1/payment_intents/{}/cancel", intent_id),
            &[],
            Some(&key),
        )
        .await
    }

    // POST /v1/refunds
    #[instrument(skip(self, params), fields(method = "POST", path = "/v1/refunds", idempotency_key = %params.idempotency_key))]
    async fn create_refund(&self, params: &RefundParams) -> Result<Refund, ProcessorError> {
        let form = refund_form(params)?;
        info!(
            target: "stripe",
            method = "POST",
            path = "/v1/refunds",
            amount_cents = params.amount.get(),
            intent_id = %params.payment_intent,
            idempotency_key = %params.idempotency_key,
            "stripe request"
        );
        self.post_form("create_refund", "/v1/refunds", &form, Some(&params.idempotency_key))
            .await
    }

    // POST /v1/transfers
    #[instrument(skip(self, params), fields(method = "POST", path = "/v1/transfers", idempotency_key = %params.idempotency_key))]
    async fn create_transfer(&self, params: &TransferParams) -> Result<Transfer, ProcessorError> {
        let form = transfer_form(params)?;
        info!(
            target: "stripe",
            method = "POST",
            path = "/v1/transfers",
            amount_cents = params.amount.get(),
            currency = %params.currency,
            destination = %params.destination,
            idempotency_key = %params.idempotency_key,
            "stripe request"
        );
        self.post_form("create_transfer", "/v1/transfers", &form, Some(&params.idempotency_key))
            .await
    }

    // GET /v1/transfers/{id}
    #[instrument(skip(self), fields(method = "GET", path = "/v1/transfers/{id}"))]
    async fn retrieve_transfer(&self, transfer_id: &str) -> Result<Transfer, ProcessorError> {
        info!(target: "stripe", method = "GET", path = "/v1/transfers/{id}", transfer_id = %transfer_id, "stripe request");
        self.get("retrieve_transfer", &format!("/v1/transfers/{}", transfer_id))
            .await
    }

    // GET /v1/accounts/{id}
    #[instrument(skip(self), fields(method = "GET", path = "/v1/accounts/{id}"))]
    async fn retrieve_account(&self, account_id: &str) -> Result<Account, ProcessorError> {
        info!(target: "stripe", method = "GET", path = "/v1/accounts/{id}", account_id = %account_id, "stripe request");
        self.get("retrieve_account", &format!("/v1/accounts/{}", account_id))
            .await
    }
}
