use std::time::Duration;

use thiserror::Error;

use crate::CameraId;

/// Failure to bring a feed online.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("feed unreachable: {0}")]
    Unreachable(String),

    /// The probe frame was mostly near-black (obstructed or broken camera).
    #[error("feed is blank ({dark_percent:.0}% near-black pixels)")]
    BlankFeed { dark_percent: f32 },

    #[error("unsupported feed: {0}")]
    Unsupported(String),
}

/// Transient frame read failure.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("source is not open")]
    NotOpen,
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("detector backend failed: {0}")]
    Backend(String),

    #[error("inference cancelled")]
    Cancelled,
}

impl From<anyhow::Error> for InferenceError {
    fn from(error: anyhow::Error) -> Self {
        InferenceError::Backend(format!("{:#}", error))
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no frames to encode for camera {0}")]
    Empty(CameraId),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("video io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcoder failed: {0}")]
    Transcode(String),
}

/// Per-subscriber delivery failure.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected by channel ({status}): {description}")]
    Rejected { status: u16, description: String },

    #[error("media unavailable: {0}")]
    Media(String),
}

impl From<ureq::Error> for DeliveryError {
    fn from(error: ureq::Error) -> Self {
        match error {
            ureq::Error::Status(status, response) => DeliveryError::Rejected {
                status,
                description: response
                    .into_string()
                    .unwrap_or_else(|_| "unreadable response body".to_string()),
            },
            ureq::Error::Transport(transport) => DeliveryError::Transport(transport.to_string()),
        }
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(error: std::io::Error) -> Self {
        DeliveryError::Media(error.to_string())
    }
}
