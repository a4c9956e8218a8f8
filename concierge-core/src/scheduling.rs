//! Client for the salon's scheduling/CRM HTTP API.
//!
//! `SchedulingApi` is the seam the tool dispatcher talks to;
//! `HttpSchedulingClient` is the production implementation.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::SchedulingConfig;
use crate::error::ConciergeError;
use crate::models::context::value_as_id;

// ============================================================================
// SchedulingApi trait
// ============================================================================

#[async_trait]
pub trait SchedulingApi: Send + Sync {
    async fn search_contacts(&self, query: &str) -> Result<Vec<Contact>, SchedulingError>;

    async fn get_contact(&self, id: &str) -> Result<Contact, SchedulingError>;

    async fn create_contact(&self, contact: &NewContact) -> Result<Contact, SchedulingError>;

    async fn list_services(&self) -> Result<Vec<Service>, SchedulingError>;

    async fn availability(
        &self,
        date: NaiveDate,
        service_id: Option<&str>,
    ) -> Result<Vec<Slot>, SchedulingError>;

    async fn list_appointments(&self, contact_id: &str) -> Result<Vec<Appointment>, SchedulingError>;

    async fn create_appointment(
        &self,
        request: &NewAppointment,
    ) -> Result<Appointment, SchedulingError>;

    async fn update_appointment(
        &self,
        id: &str,
        change: &AppointmentChange,
    ) -> Result<Appointment, SchedulingError>;

    async fn cancel_appointment(&self, id: &str) -> Result<(), SchedulingError>;

    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum SchedulingError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Scheduling API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Missing API key")]
    MissingApiKey,
}

impl SchedulingError {
    /// Transport failures and 5xx responses are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulingError::Http(e) => !e.is_builder() && !e.is_decode(),
            SchedulingError::Api { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

impl From<SchedulingError> for ConciergeError {
    fn from(e: SchedulingError) -> Self {
        match e {
            SchedulingError::NotFound(what) => ConciergeError::NotFound(what),
            SchedulingError::Api { code, message } if (400..500).contains(&code) => {
                ConciergeError::invalid("request", message)
            }
            other => ConciergeError::UpstreamUnavailable(other.to_string()),
        }
    }
}

// ============================================================================
// Domain types
// ============================================================================

fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let raw = Value::deserialize(d)?;
    value_as_id(&raw).ok_or_else(|| serde::de::Error::custom("expected string or numeric id"))
}

fn opt_id_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let raw = Option::<Value>::deserialize(d)?;
    Ok(raw.as_ref().and_then(value_as_id))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewContact {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    /// Start as an ISO 8601 datetime.
    pub start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staff_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "opt_id_string", skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    #[serde(default, deserialize_with = "opt_id_string", skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default)]
    pub start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAppointment {
    pub contact_id: String,
    pub service_id: String,
    /// `YYYY-MM-DDTHH:MM:00` in salon-local time.
    pub start: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppointmentChange {
    pub start: String,
}

// ============================================================================
// HttpSchedulingClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpSchedulingClient {
    client: Client,
    config: SchedulingConfig,
    api_key: String,
    base_url: String,
}

impl HttpSchedulingClient {
    pub fn new(config: SchedulingConfig) -> Result<Self, SchedulingError> {
        let base_url = config.base_url.clone();
        Self::with_base_url(config, base_url)
    }

    /// Create a client against a specific base URL (tests point this at a mock server).
    pub fn with_base_url(config: SchedulingConfig, base_url: String) -> Result<Self, SchedulingError> {
        let api_key = config
            .resolved_api_key()
            .ok_or(SchedulingError::MissingApiKey)?;

        let client = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            config,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T, SchedulingError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms.max(1))
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.max_retries);

        let raw = RetryIf::spawn(
            retry_strategy,
            || self.call_once(method.clone(), path, query, body),
            |e: &SchedulingError| {
                if e.is_transient() {
                    tracing::warn!(path, error = %e, "Scheduling API call failed, retrying");
                }
                e.is_transient()
            },
        )
        .await?;

        serde_json::from_value(raw).map_err(|e| SchedulingError::Decode(e.to_string()))
    }

    async fn call_once(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, SchedulingError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(&self.api_key);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(SchedulingError::NotFound(path.to_string()));
        }

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&error_body)
                .ok()
                .and_then(|v| {
                    v.get("error")
                        .or_else(|| v.get("message"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or(error_body);
            tracing::error!(code = status.as_u16(), %method, path, message = %message, "Scheduling API error");
            return Err(SchedulingError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| SchedulingError::Decode(e.to_string()))
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<Value, SchedulingError> {
    serde_json::to_value(value).map_err(|e| SchedulingError::Decode(e.to_string()))
}

#[async_trait]
impl SchedulingApi for HttpSchedulingClient {
    async fn search_contacts(&self, query: &str) -> Result<Vec<Contact>, SchedulingError> {
        self.call(Method::GET, "/contacts", &[("query", query.to_string())], None)
            .await
    }

    async fn get_contact(&self, id: &str) -> Result<Contact, SchedulingError> {
        self.call(Method::GET, &format!("/contacts/{id}"), &[], None)
            .await
            .map_err(|e| match e {
                SchedulingError::NotFound(_) => SchedulingError::NotFound(format!("Customer {id}")),
                other => other,
            })
    }

    async fn create_contact(&self, contact: &NewContact) -> Result<Contact, SchedulingError> {
        let body = to_body(contact)?;
        self.call(Method::POST, "/contacts", &[], Some(&body)).await
    }

    async fn list_services(&self) -> Result<Vec<Service>, SchedulingError> {
        self.call(Method::GET, "/services", &[], None).await
    }

    async fn availability(
        &self,
        date: NaiveDate,
        service_id: Option<&str>,
    ) -> Result<Vec<Slot>, SchedulingError> {
        let mut query = vec![("date", date.format("%Y-%m-%d").to_string())];
        if let Some(service_id) = service_id {
            query.push(("serviceId", service_id.to_string()));
        }
        self.call(Method::GET, "/availability", &query, None).await
    }

    async fn list_appointments(&self, contact_id: &str) -> Result<Vec<Appointment>, SchedulingError> {
        self.call(
            Method::GET,
            &format!("/contacts/{contact_id}/appointments"),
            &[],
            None,
        )
        .await
    }

    async fn create_appointment(
        &self,
        request: &NewAppointment,
    ) -> Result<Appointment, SchedulingError> {
        let body = to_body(request)?;
        self.call(Method::POST, "/appointments", &[], Some(&body))
            .await
    }

    async fn update_appointment(
        &self,
        id: &str,
        change: &AppointmentChange,
    ) -> Result<Appointment, SchedulingError> {
        let body = to_body(change)?;
        self.call(Method::PUT, &format!("/appointments/{id}"), &[], Some(&body))
            .await
            .map_err(|e| match e {
                SchedulingError::NotFound(_) => SchedulingError::NotFound(format!("Appointment {id}")),
                other => other,
            })
    }

    async fn cancel_appointment(&self, id: &str) -> Result<(), SchedulingError> {
        let _: Value = self
            .call(Method::DELETE, &format!("/appointments/{id}"), &[], None)
            .await
            .map_err(|e| match e {
                SchedulingError::NotFound(_) => SchedulingError::NotFound(format!("Appointment {id}")),
                other => other,
            })?;
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}
