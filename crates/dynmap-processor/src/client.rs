//! REST client for the platform APIs.

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;

use dynmap_core::action::{ExternalSource, HttpMethod};
use dynmap_core::mapping::TargetApi;

use crate::api::{ApiError, Attachment, InventoryApi, PlatformApi, PlatformRequest, PlatformResponse};

const PROCESSING_MODE_HEADER: &str = "X-Cumulocity-Processing-Mode";

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Transport(e.to_string())
    }
}

/// Collection path of an API.
fn resource(api: TargetApi) -> &'static str {
    match api {
        TargetApi::Measurement => "/measurement/measurements",
        TargetApi::Event => "/event/events",
        TargetApi::Alarm => "/alarm/alarms",
        TargetApi::Operation => "/devicecontrol/operations",
        TargetApi::Inventory => "/inventory/managedObjects",
    }
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

/// Platform client over HTTP with basic authentication.
#[derive(Debug, Clone)]
pub struct PlatformClient {
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl PlatformClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: None,
            password: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    async fn json(request: RequestBuilder) -> Result<(StatusCode, Value), ApiError> {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, body))
    }

    fn check(status: StatusCode, body: Value) -> Result<Value, ApiError> {
        if status.is_success() {
            Ok(body)
        } else {
            Err(ApiError::Status {
                status: status.as_u16(),
                body: body.to_string(),
            })
        }
    }

    async fn upload(&self, event_id: &str, attachment: &Attachment) -> Result<(), ApiError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(&attachment.data)
            .unwrap_or_else(|_| attachment.data.clone().into_bytes());
        let request = self
            .request(Method::POST, &format!("/event/events/{}/binaries", event_id))
            .header(reqwest::header::CONTENT_TYPE, attachment.content_type.as_str())
            .header(
                reqwest::header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", attachment.name),
            )
            .body(data);
        let (status, body) = Self::json(request).await?;
        Self::check(status, body).map(|_| ())
    }
}

#[async_trait]
impl PlatformApi for PlatformClient {
    async fn send(&self, request: PlatformRequest) -> Result<PlatformResponse, ApiError> {
        let path = match (&request.source_id, request.method) {
            (Some(id), HttpMethod::Put | HttpMethod::Patch | HttpMethod::Delete | HttpMethod::Get) => {
                format!("{}/{}", resource(request.api), id)
            }
            _ => resource(request.api).to_string(),
        };

        let mut builder = self.request(method(request.method), &path);
        if let Some(mode) = &request.processing_mode {
            builder = builder.header(PROCESSING_MODE_HEADER, mode.as_str());
        }
        if !matches!(request.method, HttpMethod::Get | HttpMethod::Delete) {
            builder = builder.json(&request.body);
        }

        debug!(api = %request.api.name(), method = %request.method, path = %path, "Platform request");
        let (status, body) = Self::json(builder).await?;
        let response = PlatformResponse {
            status: status.as_u16(),
            body,
        };

        if let (Some(attachment), true) = (&request.attachment, response.is_success()) {
            if let Some(id) = response.object_id() {
                self.upload(&id, attachment).await?;
            }
        }
        Ok(response)
    }
}

#[async_trait]
impl InventoryApi for PlatformClient {
    async fn get_managed_object(&self, id: &str) -> Result<Option<Value>, ApiError> {
        let (status, body) = Self::json(self.request(Method::GET, &format!("/inventory/managedObjects/{}", id))).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check(status, body).map(Some)
    }

    async fn lookup_external_id(&self, external_id: &str, id_type: &str) -> Result<Option<String>, ApiError> {
        let path = format!("/identity/externalIds/{}/{}", id_type, external_id);
        let (status, body) = Self::json(self.request(Method::GET, &path)).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::check(status, body)?;
        Ok(match body.pointer("/managedObject/id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    async fn reverse_external_ids(&self, global_id: &str) -> Result<Vec<ExternalSource>, ApiError> {
        let path = format!("/identity/globalIds/{}/externalIds", global_id);
        let (status, body) = Self::json(self.request(Method::GET, &path)).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = Self::check(status, body)?;
        Ok(body
            .get("externalIds")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|entry| {
                        let external_id = entry.get("externalId")?.as_str()?;
                        let id_type = entry.get("type")?.as_str()?;
                        Some(ExternalSource::new(external_id, id_type))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_managed_object(&self, body: Value) -> Result<String, ApiError> {
        let (status, body) = Self::json(self.request(Method::POST, "/inventory/managedObjects").json(&body)).await?;
        let body = Self::check(status, body)?;
        PlatformResponse { status: status.as_u16(), body }
            .object_id()
            .ok_or_else(|| ApiError::Serialization("created object has no id".to_string()))
    }

    async fn register_external_id(&self, global_id: &str, external_id: &str, id_type: &str) -> Result<(), ApiError> {
        let path = format!("/identity/globalIds/{}/externalIds", global_id);
        let body = serde_json::json!({ "externalId": external_id, "type": id_type });
        let (status, body) = Self::json(self.request(Method::POST, &path).json(&body)).await?;
        Self::check(status, body).map(|_| ())
    }
}
