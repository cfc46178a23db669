//! Azure Blob Storage adapter.
//!
//! Implements [`BlobStore`] directly against the Blob service REST API:
//!
//! | Operation      | HTTP                                            |
//! |----------------|-------------------------------------------------|
//! | get_properties | `HEAD {blob}`                                   |
//! | upload         | `PUT {blob}` (+ `If-None-Match: *`)             |
//! | download       | `GET {blob}`                                    |
//! | set_metadata   | `PUT {blob}?comp=metadata` (+ `If-Match`)       |
//! | delete         | `DELETE {blob}`                                 |
//!
//! Custom metadata rides as `x-ms-meta-<key>` headers; the service folds
//! key case, which is why [`BlobMetadata`] normalizes to lowercase.
//!
//! Transient failures (connect errors, 429/5xx) are retried here with
//! bounded exponential backoff so the engine never sees them unless the
//! budget is exhausted. 404/409/412 map straight to their protocol
//! outcomes and are never retried.
//!
//! ## Multi-NIC round-robin
//!
//! Hosts with several NICs can spread blob traffic across them: one
//! reqwest client is built per configured source address and requests
//! rotate through the set. Binding is best effort - retries fall back to
//! the default client so a dead interface degrades throughput, not
//! correctness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::blob::{BlobMetadata, BlobProperties, BlobStore, BlobStoreOpener, DownloadedBlob};
use crate::config::TransportConfig;
use crate::error::{Result, StoreError};

const API_VERSION: &str = "2021-08-06";
const META_PREFIX: &str = "x-ms-meta-";

/// How requests authenticate to the blob service.
///
/// Credential acquisition is deliberately simple: a SAS token or a
/// pre-fetched bearer token from the environment. Token refresh flows
/// live outside this service.
#[derive(Debug, Clone, Default)]
pub enum AzureCredentials {
    /// No credential attached (public containers, emulators).
    #[default]
    Anonymous,
    /// Shared-access-signature query string, without the leading `?`.
    SasToken(String),
    /// OAuth bearer token for the storage resource.
    BearerToken(String),
}

impl AzureCredentials {
    /// Pick up credentials from `AZURE_STORAGE_SAS_TOKEN` or
    /// `AZURE_STORAGE_BEARER_TOKEN`, in that order.
    pub fn from_env() -> Self {
        if let Ok(sas) = std::env::var("AZURE_STORAGE_SAS_TOKEN") {
            if !sas.is_empty() {
                return Self::SasToken(sas.trim_start_matches('?').to_string());
            }
        }
        if let Ok(token) = std::env::var("AZURE_STORAGE_BEARER_TOKEN") {
            if !token.is_empty() {
                return Self::BearerToken(token);
            }
        }
        Self::Anonymous
    }
}

/// `BlobStore` bound to one `{account URL}/{container}`.
pub struct AzureBlobStore {
    container_url: String,
    credentials: AzureCredentials,
    config: TransportConfig,
    /// Default client plus one per configured source address.
    default_client: Client,
    bound_clients: Vec<Client>,
    next_client: AtomicUsize,
}

impl AzureBlobStore {
    pub fn new(
        account_url: &str,
        container_name: &str,
        credentials: AzureCredentials,
        config: TransportConfig,
    ) -> Result<Self> {
        let default_client = build_client(&config, None)?;

        let mut bound_clients = Vec::new();
        if config.multi_nic {
            for addr in &config.source_addresses {
                match build_client(&config, Some(*addr)) {
                    Ok(client) => bound_clients.push(client),
                    Err(e) => warn!(address = %addr, error = %e, "Skipping unusable source address"),
                }
            }
            if !bound_clients.is_empty() {
                debug!(
                    interfaces = bound_clients.len(),
                    "Multi-NIC round-robin enabled"
                );
            }
        }

        Ok(Self {
            container_url: format!(
                "{}/{}",
                account_url.trim_end_matches('/'),
                container_name
            ),
            credentials,
            config,
            default_client,
            bound_clients,
            next_client: AtomicUsize::new(0),
        })
    }

    fn blob_url(&self, name: &str, query: Option<&str>) -> String {
        let mut url = format!("{}/{}", self.container_url, name);
        let mut separator = '?';
        if let Some(query) = query {
            url.push(separator);
            url.push_str(query);
            separator = '&';
        }
        if let AzureCredentials::SasToken(sas) = &self.credentials {
            url.push(separator);
            url.push_str(sas);
        }
        url
    }

    /// Client for the first attempt: rotate through bound interfaces when
    /// configured. Retries always use the default client.
    fn pick_client(&self, attempt: u32) -> &Client {
        if attempt == 0 && !self.bound_clients.is_empty() {
            let index = self.next_client.fetch_add(1, Ordering::Relaxed) % self.bound_clients.len();
            &self.bound_clients[index]
        } else {
            &self.default_client
        }
    }

    fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            AzureCredentials::BearerToken(token) => request.bearer_auth(token),
            _ => request,
        }
    }

    /// Issue one request, retrying transient failures with exponential
    /// backoff. The request is rebuilt per attempt so the body is re-sent.
    async fn send(
        &self,
        name: &str,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<Response> {
        let mut backoff = self.config.initial_backoff();
        let mut attempt = 0;
        loop {
            let client = self.pick_client(attempt);
            let mut request = client
                .request(method.clone(), url)
                .headers(headers.clone())
                .header("x-ms-version", API_VERSION);
            if let Some(body) = &body {
                request = request.body(body.clone());
            }
            let request = self.apply_auth(request);

            if self.config.http_logging {
                debug!(method = %method, url, attempt, "Blob request");
            }

            let outcome = request.send().await;
            match outcome {
                Ok(response) if !is_transient_status(response.status()) => return Ok(response),
                Ok(response) => {
                    if attempt >= self.config.max_retries {
                        return Err(StoreError::Transient(format!(
                            "{} {} failed with {} after {} attempts",
                            method,
                            name,
                            response.status(),
                            attempt + 1
                        )));
                    }
                    debug!(blob = name, status = %response.status(), attempt, "Retrying transient status");
                }
                Err(e) => {
                    if attempt >= self.config.max_retries {
                        return Err(StoreError::Transient(format!(
                            "{method} {name} failed: {e}"
                        )));
                    }
                    debug!(blob = name, error = %e, attempt, "Retrying transport error");
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.max_backoff());
            attempt += 1;
        }
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn get_properties(&self, name: &str) -> Result<BlobProperties> {
        let url = self.blob_url(name, None);
        let response = self
            .send(name, Method::HEAD, &url, HeaderMap::new(), None)
            .await?;

        match response.status() {
            StatusCode::OK => Ok(BlobProperties {
                metadata: metadata_from_headers(response.headers()),
                etag: etag_from_headers(response.headers(), name)?,
            }),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(name.to_string())),
            status => Err(fatal_status("HEAD", name, status)),
        }
    }

    async fn upload(
        &self,
        name: &str,
        body: Bytes,
        metadata: &BlobMetadata,
        if_none_match_any: bool,
    ) -> Result<String> {
        let url = self.blob_url(name, None);
        let mut headers = metadata_to_headers(metadata)?;
        headers.insert("x-ms-blob-type", HeaderValue::from_static("BlockBlob"));
        if if_none_match_any {
            headers.insert(reqwest::header::IF_NONE_MATCH, HeaderValue::from_static("*"));
        }

        let response = self
            .send(name, Method::PUT, &url, headers, Some(body))
            .await?;

        match response.status() {
            StatusCode::CREATED => etag_from_headers(response.headers(), name),
            // The service reports a lost conditional create as either 409
            // (BlobAlreadyExists) or 412 depending on the condition used.
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED if if_none_match_any => {
                Err(StoreError::Conflict(name.to_string()))
            }
            status => Err(fatal_status("PUT", name, status)),
        }
    }

    async fn download(&self, name: &str) -> Result<DownloadedBlob> {
        let url = self.blob_url(name, None);
        let response = self
            .send(name, Method::GET, &url, HeaderMap::new(), None)
            .await?;

        match response.status() {
            StatusCode::OK => {
                let metadata = metadata_from_headers(response.headers());
                let body = response.bytes().await.map_err(|e| {
                    StoreError::Transient(format!("GET {name} body read failed: {e}"))
                })?;
                Ok(DownloadedBlob { body, metadata })
            }
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(name.to_string())),
            status => Err(fatal_status("GET", name, status)),
        }
    }

    async fn set_metadata(
        &self,
        name: &str,
        metadata: &BlobMetadata,
        if_match_etag: &str,
    ) -> Result<String> {
        let url = self.blob_url(name, Some("comp=metadata"));
        let mut headers = metadata_to_headers(metadata)?;
        headers.insert(
            reqwest::header::IF_MATCH,
            HeaderValue::from_str(if_match_etag)
                .map_err(|e| StoreError::Fatal(format!("Invalid etag for {name}: {e}")))?,
        );

        let response = self.send(name, Method::PUT, &url, headers, None).await?;

        match response.status() {
            StatusCode::OK => etag_from_headers(response.headers(), name),
            StatusCode::PRECONDITION_FAILED => Err(StoreError::PreconditionFailed(name.to_string())),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(name.to_string())),
            status => Err(fatal_status("PUT?comp=metadata", name, status)),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let url = self.blob_url(name, None);
        let response = self
            .send(name, Method::DELETE, &url, HeaderMap::new(), None)
            .await?;

        match response.status() {
            StatusCode::ACCEPTED | StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(name.to_string())),
            status => Err(fatal_status("DELETE", name, status)),
        }
    }
}

/// Opener producing Azure-backed stores with shared transport settings.
pub struct AzureStoreOpener {
    credentials: AzureCredentials,
    config: TransportConfig,
}

impl AzureStoreOpener {
    pub fn new(credentials: AzureCredentials, config: TransportConfig) -> Self {
        Self {
            credentials,
            config,
        }
    }
}

impl BlobStoreOpener for AzureStoreOpener {
    fn open(&self, account_url: &str, container_name: &str) -> Result<Arc<dyn BlobStore>> {
        Ok(Arc::new(AzureBlobStore::new(
            account_url,
            container_name,
            self.credentials.clone(),
            self.config.clone(),
        )?))
    }
}

fn build_client(config: &TransportConfig, local_address: Option<std::net::IpAddr>) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout())
        .tcp_keepalive(Some(config.tcp_keepalive()))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true);
    if let Some(addr) = local_address {
        builder = builder.local_address(addr);
    }
    builder
        .build()
        .map_err(|e| StoreError::Fatal(format!("Failed to build HTTP client: {e}")))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::INTERNAL_SERVER_ERROR
        || status == StatusCode::BAD_GATEWAY
        || status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::GATEWAY_TIMEOUT
}

fn fatal_status(operation: &str, name: &str, status: StatusCode) -> StoreError {
    StoreError::Fatal(format!("{operation} {name} returned {status}"))
}

fn metadata_from_headers(headers: &HeaderMap) -> BlobMetadata {
    let mut metadata = BlobMetadata::new();
    for (key, value) in headers {
        let key = key.as_str();
        if let Some(meta_key) = key.strip_prefix(META_PREFIX) {
            if let Ok(value) = value.to_str() {
                metadata.insert(meta_key, value);
            }
        }
    }
    metadata
}

fn metadata_to_headers(metadata: &BlobMetadata) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in metadata.iter() {
        let name = HeaderName::try_from(format!("{META_PREFIX}{key}"))
            .map_err(|e| StoreError::Fatal(format!("Invalid metadata key '{key}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| StoreError::Fatal(format!("Invalid metadata value for '{key}': {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn etag_from_headers(headers: &HeaderMap, name: &str) -> Result<String> {
    headers
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| StoreError::Fatal(format!("Response for {name} carried no ETag")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_url_appends_sas_after_query() {
        let store = AzureBlobStore::new(
            "https://acct.blob.core.windows.net",
            "prompts",
            AzureCredentials::SasToken("sv=2021&sig=abc".to_string()),
            TransportConfig::default(),
        )
        .unwrap();

        assert_eq!(
            store.blob_url("blob-a", None),
            "https://acct.blob.core.windows.net/prompts/blob-a?sv=2021&sig=abc"
        );
        assert_eq!(
            store.blob_url("blob-a", Some("comp=metadata")),
            "https://acct.blob.core.windows.net/prompts/blob-a?comp=metadata&sv=2021&sig=abc"
        );
    }

    #[test]
    fn test_metadata_header_round_trip() {
        let metadata: BlobMetadata =
            [("hash", "7"), ("parenthash", "0"), ("location", "blob-a")]
                .into_iter()
                .collect();
        let headers = metadata_to_headers(&metadata).unwrap();
        assert_eq!(headers.get("x-ms-meta-hash").unwrap(), "7");

        let parsed = metadata_from_headers(&headers);
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_transient_status_classification() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::CONFLICT));
        assert!(!is_transient_status(StatusCode::PRECONDITION_FAILED));
    }
}
