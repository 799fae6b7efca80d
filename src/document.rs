use crate::wire::ErrorMessage;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::error;

/// Resource name of the server's document collection.
pub const DOCUMENTS_RESOURCE: &str = "documents";

/// Errors from the document store client.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A failure reported by the store itself; the server's own error code
    /// and message are preserved.
    #[error("document store error: {0}")]
    Store(ErrorMessage),
}

/// Metadata for a stored document, as returned by `select_one`.
#[derive(Debug, Deserialize)]
pub struct DocumentDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "contentSize")]
    pub content_size: i64,
    #[serde(default, rename = "isIncomplete")]
    pub is_incomplete: bool,
    /// Reference used to download the document bytes.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "ars_modifiedAt")]
    pub modified_at: Option<Value>,
    #[serde(default, rename = "ars_createdAt")]
    pub created_at: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StoreError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    params: Vec<Value>,
}

/// HTTP client for the server's document store. One instance is shared by
/// all queries of a source and reused across fetches.
pub struct DocumentClient {
    base_url: String,
    auth_token: String,
    http: HttpClient,
}

impl DocumentClient {
    /// Creates a client for the store at `base_url` (scheme + authority).
    pub fn new(base_url: &str, auth_token: &str, insecure: bool) -> Result<Self, reqwest::Error> {
        let http = HttpClient::builder()
            .danger_accept_invalid_certs(insecure)
            .build()?;

        Ok(DocumentClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
            http,
        })
    }

    /// Fetches the metadata record for one resource instance.
    ///
    /// Endpoint: /api/v1/resources/{resource}/{id}
    pub async fn select_one(
        &self,
        resource: &str,
        id: &str,
    ) -> Result<DocumentDescriptor, DocumentError> {
        let url = format!("{}/api/v1/resources/{}/{}", self.base_url, resource, id);

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.auth_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.store_error(resource, id, response).await);
        }

        Ok(response.json::<DocumentDescriptor>().await?)
    }

    /// Downloads raw document bytes via the content reference from a
    /// previously-selected descriptor.
    pub async fn download(&self, content_ref: &str) -> Result<Vec<u8>, DocumentError> {
        let url = if content_ref.starts_with("http://") || content_ref.starts_with("https://") {
            content_ref.to_string()
        } else {
            format!("{}{}", self.base_url, content_ref)
        };

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.auth_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.store_error("content", content_ref, response).await);
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Turns a non-2xx store reply into a `Store` error, keeping the
    /// server-reported code and message when the body carries them.
    async fn store_error(
        &self,
        resource: &str,
        id: &str,
        response: reqwest::Response,
    ) -> DocumentError {
        let status = response.status();
        let reported = response.json::<Vec<StoreError>>().await.ok();

        if let Some(first) = reported.and_then(|mut errors| {
            if errors.is_empty() {
                None
            } else {
                Some(errors.remove(0))
            }
        }) {
            error!(
                resource,
                id,
                code = %first.code,
                message = %first.message,
                "error fetching {resource} {id} from the document store"
            );
            DocumentError::Store(ErrorMessage::new(first.code, first.message, first.params))
        } else {
            error!(resource, id, %status, "document store request failed");
            DocumentError::Store(ErrorMessage::new(
                format!("io.vantiq.status.{}", status.as_u16()),
                format!("Request for {resource} {id} failed with status {status}"),
                vec![],
            ))
        }
    }
}
