//! Client for the dictionary worker, plus the worker-side media helper.
//!
//! Archives and media cross the boundary as base64 strings inside JSON.
//! While importing, the worker asks the caller to decode images through the
//! `getImageDetails` reverse call; the caller answers through an
//! [`ImageDetailsProvider`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::channel::ChannelFactory;
use crate::config::SessionConfig;
use crate::error::{Result, RpcError, SerializedError};
use crate::peer::{PeerOptions, RequestContext, RequestHandler};
use crate::pending::ProgressSink;
use crate::router::ReverseCallHandler;
use crate::session::Session;
use crate::transport::worker::WorkerFactory;

pub const DICTIONARY_WORKER: &str = "dictionary-worker";

/// Imports of large archives routinely take minutes.
pub const DICTIONARY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub const IMPORT_DICTIONARY: &str = "importDictionary";
pub const DELETE_DICTIONARY: &str = "deleteDictionary";
pub const GET_DICTIONARY_COUNTS: &str = "getDictionaryCounts";
pub const GET_IMAGE_DETAILS: &str = "getImageDetails";

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportDictionaryRequest {
    #[serde(with = "base64_bytes")]
    pub archive_content: Vec<u8>,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDictionaryRequest {
    pub dictionary_title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DictionaryCountsRequest {
    pub dictionary_names: Vec<String>,
    pub get_total: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDetailsRequest {
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub media_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDetails {
    pub width: u32,
    pub height: u32,
}

/// Decodes image content on the caller's side of the worker boundary.
#[async_trait]
pub trait ImageDetailsProvider: Send + Sync + 'static {
    async fn image_details(
        &self,
        content: &[u8],
        media_type: &str,
    ) -> std::result::Result<ImageDetails, SerializedError>;
}

/// `getImageDetails` reverse-call handler backed by a provider.
pub struct ImageDetailsHandler {
    provider: Arc<dyn ImageDetailsProvider>,
}

impl ImageDetailsHandler {
    pub fn new(provider: Arc<dyn ImageDetailsProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ReverseCallHandler for ImageDetailsHandler {
    async fn call(&self, payload: Value) -> std::result::Result<Value, SerializedError> {
        let request: ImageDetailsRequest = serde_json::from_value(payload)
            .map_err(|e| SerializedError::new("TypeError", format!("invalid image payload: {e}")))?;
        let details = self
            .provider
            .image_details(&request.content, &request.media_type)
            .await?;
        serde_json::to_value(details).map_err(|e| SerializedError::from_error(&e))
    }
}

pub struct DictionaryWorkerClient {
    session: Session,
    timeout: Duration,
}

impl DictionaryWorkerClient {
    pub fn new(factory: Arc<dyn ChannelFactory>, images: Arc<dyn ImageDetailsProvider>) -> Self {
        let session = Session::new(SessionConfig::new(DICTIONARY_WORKER), factory);
        session.register_reverse_handler(GET_IMAGE_DETAILS, Arc::new(ImageDetailsHandler::new(images)));
        Self {
            session,
            timeout: DICTIONARY_TIMEOUT,
        }
    }

    /// Client whose worker runs `handler` on a dedicated thread.
    pub fn spawn<H: RequestHandler>(handler: Arc<H>, images: Arc<dyn ImageDetailsProvider>) -> Self {
        Self::new(
            Arc::new(WorkerFactory::new(handler).with_options(PeerOptions::default())),
            images,
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn import_dictionary(
        &self,
        archive: &[u8],
        details: Value,
        progress: ProgressSink,
    ) -> Result<Value> {
        let request = ImportDictionaryRequest {
            archive_content: archive.to_vec(),
            details,
        };
        tracing::info!(archive_bytes = archive.len(), "Importing dictionary");
        self.call_with_progress(IMPORT_DICTIONARY, to_params(&request)?, progress)
            .await
    }

    pub async fn delete_dictionary(&self, title: &str, progress: ProgressSink) -> Result<()> {
        let request = DeleteDictionaryRequest {
            dictionary_title: title.to_string(),
        };
        tracing::info!(%title, "Deleting dictionary");
        self.call_with_progress(DELETE_DICTIONARY, to_params(&request)?, progress)
            .await
            .map(|_| ())
    }

    pub async fn get_dictionary_counts(&self, names: &[String], get_total: bool) -> Result<Value> {
        let request = DictionaryCountsRequest {
            dictionary_names: names.to_vec(),
            get_total,
        };
        self.session.ensure_ready().await?;
        self.session
            .invoke(GET_DICTIONARY_COUNTS, to_params(&request)?, Some(self.timeout))
            .await
    }

    async fn call_with_progress(
        &self,
        action: &str,
        params: Value,
        progress: ProgressSink,
    ) -> Result<Value> {
        self.session.ensure_ready().await?;
        self.session
            .invoke_with_progress(action, params, Some(self.timeout), progress)
            .await
    }
}

fn to_params<T: Serialize>(request: &T) -> Result<Value> {
    serde_json::to_value(request).map_err(|e| RpcError::protocol(format!("unencodable params: {e}")))
}

/// Worker-side access to media decoding on the caller's side.
pub struct MediaLoader<'a> {
    ctx: &'a RequestContext,
}

impl<'a> MediaLoader<'a> {
    pub fn new(ctx: &'a RequestContext) -> Self {
        Self { ctx }
    }

    pub async fn get_image_details(&self, content: &[u8], media_type: &str) -> Result<ImageDetails> {
        let request = ImageDetailsRequest {
            content: content.to_vec(),
            media_type: media_type.to_string(),
        };
        let result = self
            .ctx
            .reverse_call(GET_IMAGE_DETAILS, to_params(&request)?)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| RpcError::protocol(format!("invalid image details: {e}")))
    }
}
