//! REST collaborator: channel snapshots, message history pages, file upload.
//!
//! Every response arrives in the envelope `{resultCode, resultMsg, data, totalCount?}`;
//! a non-zero `resultCode` becomes [`ChatError::Api`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use carelink_common::config::ApiConfig;
use carelink_common::models::{ChannelSnapshot, MessageResponse, MessageType};

use crate::error::{ChatError, Result};

const CHANNEL_INFO_PATH: &str = "/api/1/message/getChannelInfo";
const MESSAGE_LIST_PATH: &str = "/api/1/message/getMessageList";
const SAVE_MESSAGE_FILE_PATH: &str = "/api/1/message/saveMessageFile";

/// One page of older history, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<MessageResponse>,
    pub total_count: u64,
}

/// A file message waiting to be uploaded.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub channel_id: String,
    pub message_type: MessageType,
    pub temp_uuid: String,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Server receipt for an uploaded file message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedFile {
    #[serde(default)]
    pub attach_file_idx: Option<String>,
    pub message_seq: u64,
}

/// Calls the chat core makes against the REST backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Roster, newest message page, and total count for one channel.
    async fn channel_info(&self, channel_id: &str) -> Result<ChannelSnapshot>;

    /// Older history page `paging_key` (0-based) of `page_size` messages.
    async fn message_page(
        &self,
        channel_id: &str,
        paging_key: u32,
        page_size: u32,
    ) -> Result<MessagePage>;

    async fn save_message_file(&self, upload: FileUpload) -> Result<SavedFile>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    result_code: i64,
    #[serde(default)]
    result_msg: String,
    data: Option<T>,
    #[serde(default)]
    total_count: Option<u64>,
}

impl<T> Envelope<T> {
    fn into_checked(self) -> Result<Self> {
        if self.result_code != 0 {
            return Err(ChatError::Api {
                code: self.result_code,
                message: self.result_msg,
            });
        }
        Ok(self)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageListRequest<'a> {
    message_channel_idx: &'a str,
    paging_row: u32,
    page: u32,
}

/// `reqwest` implementation of [`ChatApi`].
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
}

impl RestClient {
    pub fn new(config: &ApiConfig, access_token: Option<&str>) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = access_token {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| ChatError::Other(e.to_string()))?,
            );
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ── Internal ──────────────────────────────────────────────────────────────

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<Envelope<T>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).json(body).send().await?;
        let envelope = resp.error_for_status()?.json::<Envelope<T>>().await?;
        envelope.into_checked().inspect_err(|e| {
            tracing::warn!(path, error = %e, "REST call rejected");
        })
    }
}

#[async_trait]
impl ChatApi for RestClient {
    async fn channel_info(&self, channel_id: &str) -> Result<ChannelSnapshot> {
        let envelope: Envelope<ChannelSnapshot> = self
            .post(CHANNEL_INFO_PATH, &json!({ "messageChannelIdx": channel_id }))
            .await?;
        Ok(envelope.data.unwrap_or_default())
    }

    async fn message_page(
        &self,
        channel_id: &str,
        paging_key: u32,
        page_size: u32,
    ) -> Result<MessagePage> {
        let body = serde_json::to_value(MessageListRequest {
            message_channel_idx: channel_id,
            paging_row: page_size,
            page: paging_key,
        })?;
        let envelope: Envelope<Vec<MessageResponse>> = self.post(MESSAGE_LIST_PATH, &body).await?;
        Ok(MessagePage {
            messages: envelope.data.unwrap_or_default(),
            total_count: envelope.total_count.unwrap_or_default(),
        })
    }

    async fn save_message_file(&self, upload: FileUpload) -> Result<SavedFile> {
        let mut part = Part::bytes(upload.bytes).file_name(upload.file_name);
        if let Some(mime) = upload.mime_type.as_deref() {
            part = part.mime_str(mime)?;
        }
        let form = Form::new()
            .part("messageFile", part)
            .text("channelIdx", upload.channel_id)
            .text("messageType", upload.message_type.as_str())
            .text("tempUuid", upload.temp_uuid);

        let url = format!("{}{}", self.base_url, SAVE_MESSAGE_FILE_PATH);
        let resp = self.client.post(&url).multipart(form).send().await?;
        let envelope = resp
            .error_for_status()?
            .json::<Envelope<SavedFile>>()
            .await?
            .into_checked()?;
        envelope
            .data
            .ok_or_else(|| ChatError::protocol(SAVE_MESSAGE_FILE_PATH, "missing data"))
    }
}
