//! Chat command handling.
//!
//! `CommandProcessor` turns one incoming chat message into at most one reply.
//! It holds no transport; the bot poller feeds it and delivers the reply.

use std::sync::Arc;

use crate::camera::CameraRegistry;
use crate::detect::InferenceSettings;
use crate::store::{JsonStore, Subscriber};
use crate::CameraId;

const NOT_AUTHORIZED: &str = "You are not authorized to use this bot.";

const HELP_TEXT: &str = "Available commands:\n\
/activate - Enable person detection\n\
/deactivate - Disable person detection\n\
/set <serial> - Subscribe using your device serial\n\
/snapshot <camera> - Current picture from a camera\n\
/active_cams - List active cameras\n\
/inference_status - Show whether detection is enabled\n\
/remove - Unsubscribe from alerts\n\
/subscribers - List current subscribers\n\
/set_criteria <0..1> - Set the detection confidence threshold\n\
/help - Show this message";

/// A chat message as the processor sees it.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    /// Where the reply goes, and who is checked for membership.
    pub chat: Subscriber,
    /// Display name of the sender, set for group chats.
    pub group_sender: Option<String>,
    pub text: String,
}

impl IncomingMessage {
    pub fn private(chat: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat: Subscriber::new(chat),
            group_sender: None,
            text: text.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Text(String),
    Photo { jpeg: Vec<u8>, caption: String },
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }
}

pub struct CommandProcessor {
    store: Arc<JsonStore>,
    inference: Arc<InferenceSettings>,
    cameras: CameraRegistry,
}

impl CommandProcessor {
    pub fn new(
        store: Arc<JsonStore>,
        inference: Arc<InferenceSettings>,
        cameras: CameraRegistry,
    ) -> Self {
        Self {
            store,
            inference,
            cameras,
        }
    }

    /// `None` for messages that are not commands, and for commands that
    /// are silently ignored.
    pub fn handle(&self, message: &IncomingMessage) -> Option<Reply> {
        let mut parts = message.text.split_whitespace();
        let head = parts.next()?;
        let command = head.strip_prefix('/')?;
        // Group chats address commands as `/cmd@BotName`.
        let command = command.split('@').next().unwrap_or(command);
        let args: Vec<&str> = parts.collect();

        if command == "set" {
            return self.subscribe(message, args.first().copied());
        }
        if !self.store.is_subscriber(&message.chat) {
            log::info!(
                "bot: rejected /{} from non-subscriber {}",
                command,
                message.chat
            );
            return Some(Reply::text(NOT_AUTHORIZED));
        }

        let reply = match command {
            "remove" => self.unsubscribe(message),
            "activate" => self.set_activated(message, true),
            "deactivate" => self.set_activated(message, false),
            "subscribers" => self.list_subscribers(),
            "inference_status" => self.inference_status(),
            "snapshot" => self.snapshot(&args),
            "active_cams" => self.active_cameras(),
            "set_criteria" => self.set_criteria(&args),
            "help" => Reply::text(HELP_TEXT),
            other => Reply::text(format!("Unknown command /{}. Try /help.", other)),
        };
        Some(reply)
    }

    fn subscribe(&self, message: &IncomingMessage, serial: Option<&str>) -> Option<Reply> {
        let serial = serial?;
        if !self.store.serials().iter().any(|known| known == serial) {
            log::warn!("bot: /set with unknown serial from {}", message.chat);
            return Some(Reply::text(NOT_AUTHORIZED));
        }
        let reply = match self.store.add_subscriber(&message.chat) {
            Ok(true) => {
                log::info!("bot: {} subscribed", message.chat);
                Reply::text(format!("Subscribed to Sentinela {}.", serial))
            }
            Ok(false) => Reply::text("You are already subscribed."),
            Err(e) => store_failure("subscribe", e),
        };
        Some(reply)
    }

    fn unsubscribe(&self, message: &IncomingMessage) -> Reply {
        match self.store.remove_subscriber(&message.chat) {
            Ok(_) => {
                log::info!("bot: {} unsubscribed", message.chat);
                match &message.group_sender {
                    Some(name) => Reply::text(format!("Unsubscribed. {} removed this chat.", name)),
                    None => Reply::text("Unsubscribed from Sentinela."),
                }
            }
            Err(e) => store_failure("unsubscribe", e),
        }
    }

    fn set_activated(&self, message: &IncomingMessage, activated: bool) -> Reply {
        if let Err(e) = self.store.set_inference_activated(activated) {
            return store_failure("update inference status", e);
        }
        self.inference.set_activated(activated);
        let verb = if activated { "enabled" } else { "disabled" };
        log::info!("bot: detection {} by {}", verb, message.chat);
        match &message.group_sender {
            Some(name) => Reply::text(format!("{} {} detection.", name, verb)),
            None => Reply::text(format!("Detection {}.", verb)),
        }
    }

    fn list_subscribers(&self) -> Reply {
        let list = self
            .store
            .subscriber_list()
            .iter()
            .map(Subscriber::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Reply::text(format!("Subscribers: {}", list))
    }

    fn inference_status(&self) -> Reply {
        let status = if self.inference.is_activated() {
            "enabled"
        } else {
            "disabled"
        };
        Reply::text(format!(
            "Detection is {} (threshold {:.2}).",
            status,
            self.inference.threshold()
        ))
    }

    fn snapshot(&self, args: &[&str]) -> Reply {
        let id = match args {
            [raw] => match raw.parse::<u16>() {
                Ok(id) => CameraId(id),
                Err(_) => return Reply::text("Usage: /snapshot <camera>"),
            },
            _ => return Reply::text("Usage: /snapshot <camera>"),
        };
        let frame = match self.cameras.get(id).and_then(|slot| slot.latest()) {
            Some(frame) => frame,
            None => return Reply::text(format!("No frame available from camera {}.", id)),
        };
        match frame.to_jpeg() {
            Ok(jpeg) => Reply::Photo {
                jpeg,
                caption: format!(
                    "Snapshot from camera {} at {}",
                    id,
                    frame.captured_wall().format("%H:%M:%S")
                ),
            },
            Err(e) => {
                log::warn!("bot: snapshot encode failed for camera {}: {}", id, e);
                Reply::text(format!("Could not encode a snapshot from camera {}.", id))
            }
        }
    }

    fn active_cameras(&self) -> Reply {
        let active = self.cameras.active_ids();
        if active.is_empty() {
            return Reply::text("No cameras are active right now.");
        }
        let list = active
            .iter()
            .map(CameraId::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Reply::text(format!("Active cameras: {}", list))
    }

    fn set_criteria(&self, args: &[&str]) -> Reply {
        let threshold = match args.first().map(|raw| raw.parse::<f32>()) {
            Some(Ok(value)) if value.is_finite() => value,
            _ => return Reply::text("Please provide a numeric threshold, e.g. /set_criteria 0.6"),
        };
        if !(0.0..=1.0).contains(&threshold) {
            return Reply::text("The threshold must be between 0 and 1.");
        }
        if let Err(e) = self.store.set_inference_threshold(threshold) {
            return store_failure("update threshold", e);
        }
        self.inference.set_threshold(threshold);
        log::info!("bot: detection threshold set to {:.2}", threshold);
        Reply::text(format!("Detection threshold updated to {}", threshold))
    }
}

fn store_failure(action: &str, err: anyhow::Error) -> Reply {
    log::error!("bot: failed to {}: {:#}", action, err);
    Reply::text(format!("Failed to {}, please try again.", action))
}
