//! Template lookup against the template service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;

use herald_common::error::AppError;
use herald_common::types::Template;

use crate::downstream::{status_error, transport_error};

/// Source of `{subject, body}` templates by code.
///
/// A missing template is [`AppError::NotFound`], distinct from transient unavailability.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn fetch(&self, template_code: &str) -> Result<Template, AppError>;
}

#[derive(Debug, Deserialize)]
struct TemplateEnvelope {
    data: Template,
}

/// Client for `GET {base}/api/v1/templates/by-code/{code}`.
pub struct HttpTemplateClient {
    client: Client,
    base_url: String,
}

impl HttpTemplateClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, template_code: &str) -> String {
        format!(
            "{}/api/v1/templates/by-code/{}",
            self.base_url, template_code
        )
    }
}

#[async_trait]
impl TemplateSource for HttpTemplateClient {
    async fn fetch(&self, template_code: &str) -> Result<Template, AppError> {
        let response = self
            .client
            .get(self.url_for(template_code))
            .send()
            .await
            .map_err(|e| transport_error("template service", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("template service", status, &body));
        }

        let envelope: TemplateEnvelope = response.json().await.map_err(|e| {
            AppError::DownstreamPermanent(format!("Malformed template response: {}", e))
        })?;
        Ok(envelope.data)
    }
}

/// Fixed in-process template set, for local runs and tests.
pub struct StaticTemplates {
    templates: RwLock<HashMap<String, Template>>,
    available: AtomicBool,
    fetches: AtomicU32,
}

impl StaticTemplates {
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            fetches: AtomicU32::new(0),
        }
    }

    pub fn with(self, code: &str, subject: &str, body: &str) -> Self {
        self.templates.write().insert(
            code.to_string(),
            Template {
                subject: subject.to_string(),
                body: body.to_string(),
            },
        );
        self
    }

    /// Simulate the template service being down (transient failures).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of fetches that reached this source.
    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Default for StaticTemplates {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TemplateSource for StaticTemplates {
    async fn fetch(&self, template_code: &str) -> Result<Template, AppError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(AppError::DownstreamTransient(
                "template service unavailable".to_string(),
            ));
        }
        self.templates
            .read()
            .get(template_code)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("template '{}'", template_code)))
    }
}
