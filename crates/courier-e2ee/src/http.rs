//! REST client for the messaging backend's key and upload endpoints.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::ETAG;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use courier_core::config::BackendConfig;
use courier_core::{ConversationId, CourierError, CourierResult, UserId};
use courier_crypto::KeyMaterial;

use crate::backend::{
    FinalizeRequest, FinalizeResponse, InitUploadRequest, InitUploadResponse, KeyDirectory,
    Thumbnail, UploadService,
};

/// Reuse or clone to share the connection pool.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
    token: Option<SecretString>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyBody {
    public_key: String,
}

#[derive(Deserialize)]
struct ParticipantsBody {
    participants: Vec<Participant>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Participant {
    user_id: UserId,
}

#[derive(Deserialize)]
struct ThumbnailResponse {
    url: String,
}

fn transport(e: reqwest::Error) -> CourierError {
    CourierError::Transport(e.to_string())
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration, token: Option<SecretString>) -> CourierResult<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| CourierError::Config(format!("invalid backend url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(CourierError::Config(format!(
                "backend url {base_url} cannot be a base"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(transport)?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    /// Build from config; the bearer token comes from `access_token_env`.
    pub fn from_config(config: &BackendConfig) -> CourierResult<Self> {
        let token = std::env::var(&config.access_token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .map(SecretString::from);
        if token.is_none() {
            debug!(var = %config.access_token_env, "no backend token set; requests are unauthenticated");
        }
        Self::new(
            &config.base_url,
            Duration::from_secs(config.request_timeout_secs),
            token,
        )
    }

    /// Base URL with `segments` appended, each percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> CourierResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| CourierError::Config(format!("backend url {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    async fn send(builder: RequestBuilder) -> CourierResult<Response> {
        let response = builder.send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let url = response.url().clone();
            return Err(CourierError::Transport(format!("{status} from {url}")));
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(builder: RequestBuilder) -> CourierResult<T> {
        Self::send(builder).await?.json().await.map_err(transport)
    }
}

impl KeyDirectory for HttpBackend {
    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn fetch_public_key(&self, user_id: &UserId) -> CourierResult<KeyMaterial> {
        let url = self.endpoint(&["keys", user_id.as_str()])?;
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(CourierError::PeerKeyUnavailable {
                user_id: user_id.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(CourierError::Transport(format!(
                "{} fetching key for {user_id}",
                response.status()
            )));
        }
        let body: PublicKeyBody = response.json().await.map_err(transport)?;
        Ok(KeyMaterial::new(body.public_key))
    }

    #[instrument(skip_all)]
    async fn publish_public_key(&self, material: &KeyMaterial) -> CourierResult<()> {
        let url = self.endpoint(&["keys"])?;
        let body = PublicKeyBody {
            public_key: material.as_str().to_string(),
        };
        Self::send(self.request(Method::POST, url).json(&body)).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(conversation = %conversation))]
    async fn conversation_participants(&self, conversation: &ConversationId) -> CourierResult<Vec<UserId>> {
        let url = self.endpoint(&["conversations", conversation.as_str(), "participants"])?;
        let body: ParticipantsBody = Self::json(self.request(Method::GET, url)).await?;
        Ok(body.participants.into_iter().map(|p| p.user_id).collect())
    }
}

impl UploadService for HttpBackend {
    #[instrument(skip_all, fields(file = %request.file_name, chunks = request.total_chunks))]
    async fn init_upload(&self, request: &InitUploadRequest) -> CourierResult<InitUploadResponse> {
        let url = self.endpoint(&["uploads", "init"])?;
        Self::json(self.request(Method::POST, url).json(request)).await
    }

    /// Presigned URLs carry their own authorization; no bearer token is sent.
    async fn put_chunk(&self, url: &str, data: Bytes) -> CourierResult<Option<String>> {
        let url = Url::parse(url).map_err(|e| CourierError::Upload(format!("bad chunk url: {e}")))?;
        let response = Self::send(self.client.put(url).body(data)).await?;
        Ok(response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }

    #[instrument(skip_all, fields(upload_id = %request.upload_id))]
    async fn finalize_upload(&self, request: &FinalizeRequest) -> CourierResult<FinalizeResponse> {
        let url = self.endpoint(&["uploads", "finalize"])?;
        Self::json(self.request(Method::POST, url).json(request)).await
    }

    async fn upload_thumbnail(&self, thumbnail: &Thumbnail) -> CourierResult<String> {
        let url = self.endpoint(&["uploads", "thumbnail"])?;
        let builder = self
            .request(Method::POST, url)
            .header(reqwest::header::CONTENT_TYPE, thumbnail.content_type.as_str())
            .body(thumbnail.bytes.clone());
        let body: ThumbnailResponse = Self::json(builder).await?;
        Ok(body.url)
    }
}
