//! Telegram Bot API client and command poller.
//!
//! `TelegramClient` is the production `Notifier`. `BotPoller` long-polls
//! `getUpdates` and answers commands through a `CommandProcessor`.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::alert::{MediaArtifact, Notifier};
use crate::cancel::CancellationToken;
use crate::commands::{CommandProcessor, IncomingMessage, Reply};
use crate::error::DeliveryError;
use crate::store::Subscriber;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub first_name: String,
}

impl Message {
    fn is_group(&self) -> bool {
        matches!(self.chat.kind.as_str(), "group" | "supergroup")
    }

    /// `None` for messages without text.
    pub fn to_incoming(&self) -> Option<IncomingMessage> {
        let text = self.text.clone()?;
        let group_sender = if self.is_group() {
            self.from.as_ref().map(|user| user.first_name.clone())
        } else {
            None
        };
        Some(IncomingMessage {
            chat: Subscriber::new(self.chat.id.to_string()),
            group_sender,
            text,
        })
    }
}

pub struct TelegramClient {
    agent: ureq::Agent,
    /// `{api_base}/bot{token}`. Never logged.
    endpoint: String,
}

impl TelegramClient {
    pub fn new(token: &str, api_base: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .build();
        Self {
            agent,
            endpoint: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.endpoint, method)
    }

    fn post_json<T>(&self, method: &str, body: Value, timeout: Duration) -> Result<T, DeliveryError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .agent
            .post(&self.url(method))
            .timeout(timeout)
            .send_json(body)?;
        parse_response(response)
    }

    fn post_multipart(
        &self,
        method: &str,
        fields: &[(&str, &str)],
        file: FilePart<'_>,
    ) -> Result<(), DeliveryError> {
        let boundary = format!("----sentinela{:016x}", rand::random::<u64>());
        let body = multipart_body(&boundary, fields, &file);
        let response = self
            .agent
            .post(&self.url(method))
            .timeout(UPLOAD_TIMEOUT)
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", boundary),
            )
            .send_bytes(&body)?;
        parse_response::<Value>(response).map(|_| ())
    }

    /// Long-poll for updates after `offset`.
    pub fn get_updates(&self, offset: i64, poll_timeout: Duration) -> Result<Vec<Update>, DeliveryError> {
        self.post_json(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": poll_timeout.as_secs(),
                "allowed_updates": ["message"],
            }),
            poll_timeout + REQUEST_TIMEOUT,
        )
    }
}

fn parse_response<T>(response: ureq::Response) -> Result<T, DeliveryError>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    let parsed: ApiResponse<T> = response
        .into_json()
        .map_err(|e| DeliveryError::Transport(format!("invalid bot api response: {}", e)))?;
    if !parsed.ok {
        return Err(DeliveryError::Rejected {
            status: parsed.error_code.unwrap_or(status),
            description: parsed.description.unwrap_or_default(),
        });
    }
    parsed.result.ok_or_else(|| DeliveryError::Rejected {
        status,
        description: "response without result".to_string(),
    })
}

struct FilePart<'a> {
    field: &'a str,
    file_name: &'a str,
    content_type: &'a str,
    bytes: &'a [u8],
}

fn multipart_body(boundary: &str, fields: &[(&str, &str)], file: &FilePart<'_>) -> Vec<u8> {
    let mut body = Vec::with_capacity(file.bytes.len() + 512);
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                boundary, name, value
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
            boundary, file.field, file.file_name, file.content_type
        )
        .as_bytes(),
    );
    body.extend_from_slice(file.bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

impl Notifier for TelegramClient {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn send_text(&self, subscriber: &Subscriber, text: &str) -> Result<(), DeliveryError> {
        self.post_json::<Value>(
            "sendMessage",
            json!({ "chat_id": subscriber.as_str(), "text": text }),
            REQUEST_TIMEOUT,
        )
        .map(|_| ())
    }

    fn send_photo(
        &self,
        subscriber: &Subscriber,
        jpeg: &[u8],
        caption: &str,
    ) -> Result<(), DeliveryError> {
        self.post_multipart(
            "sendPhoto",
            &[("chat_id", subscriber.as_str()), ("caption", caption)],
            FilePart {
                field: "photo",
                file_name: "alert.jpg",
                content_type: "image/jpeg",
                bytes: jpeg,
            },
        )
    }

    fn send_video(
        &self,
        subscriber: &Subscriber,
        video: &MediaArtifact,
        caption: &str,
    ) -> Result<(), DeliveryError> {
        let bytes = video.read_bytes()?;
        let file_name = video.file_name();
        self.post_multipart(
            "sendVideo",
            &[
                ("chat_id", subscriber.as_str()),
                ("caption", caption),
                ("supports_streaming", "true"),
            ],
            FilePart {
                field: "video",
                file_name: &file_name,
                content_type: video.content_type(),
                bytes: &bytes,
            },
        )
    }
}

// ----------------------------------------------------------------------------
// Command poller
// ----------------------------------------------------------------------------

pub struct BotPoller {
    client: Arc<TelegramClient>,
    processor: CommandProcessor,
    poll_timeout: Duration,
}

impl BotPoller {
    pub fn new(
        client: Arc<TelegramClient>,
        processor: CommandProcessor,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            client,
            processor,
            poll_timeout,
        }
    }

    /// Poll until cancelled. A cancel is noticed once the current long poll
    /// returns.
    pub fn run(&self, cancel: CancellationToken) {
        log::info!("bot: polling for commands");
        let mut offset = 0i64;
        while !cancel.is_cancelled() {
            let updates = match self.client.get_updates(offset, self.poll_timeout) {
                Ok(updates) => updates,
                Err(e) => {
                    log::warn!("bot: getUpdates failed: {}", e);
                    cancel.wait_timeout(POLL_ERROR_BACKOFF);
                    continue;
                }
            };
            for update in updates {
                offset = offset.max(update.update_id + 1);
                if let Some(incoming) = update.message.as_ref().and_then(Message::to_incoming) {
                    self.answer(&incoming);
                }
            }
        }
        log::info!("bot: poller stopped");
    }

    fn answer(&self, incoming: &IncomingMessage) {
        let result = match self.processor.handle(incoming) {
            Some(Reply::Text(text)) => self.client.send_text(&incoming.chat, &text),
            Some(Reply::Photo { jpeg, caption }) => {
                self.client.send_photo(&incoming.chat, &jpeg, &caption)
            }
            None => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("bot: reply to {} failed: {}", incoming.chat, e);
        }
    }
}
