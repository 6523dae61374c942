//! RTSP frame source.
//!
//! GStreamer pipeline: `rtspsrc ! decodebin ! videoconvert ! appsink`, with
//! the appsink keeping only the newest RGB sample.

use std::time::Duration;

use anyhow::Context;
use gstreamer::prelude::*;
use image::RgbImage;

use super::{redact_url, FrameSource, SourceConfig, SourceStats};
use crate::error::{ConnectError, ReadError};
use crate::frame::Frame;
use crate::CameraId;

pub struct RtspSource {
    config: SourceConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    playing: bool,
    frame_count: u64,
    last_error: Option<String>,
}

impl RtspSource {
    pub fn new(config: SourceConfig) -> Result<Self, ConnectError> {
        Self::build(config).map_err(|e| ConnectError::Unsupported(format!("{:#}", e)))
    }

    fn build(config: SourceConfig) -> anyhow::Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            playing: false,
            frame_count: 0,
            last_error: None,
        })
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let timeout = self.config.read_timeout.max(Duration::from_millis(500));
        gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64)
    }
}

impl FrameSource for RtspSource {
    fn camera_id(&self) -> CameraId {
        self.config.camera
    }

    fn describe(&self) -> String {
        redact_url(&self.config.url)
    }

    fn open(&mut self) -> Result<(), ConnectError> {
        self.last_error = None;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| ConnectError::Unreachable(format!("{}: {}", self.describe(), e)))?;
        self.playing = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, ReadError> {
        if !self.playing {
            return Err(ReadError::NotOpen);
        }
        self.poll_bus();
        if let Some(error) = self.last_error.take() {
            return Err(ReadError::Stream(error));
        }

        let sample = self
            .appsink
            .try_pull_sample(self.frame_timeout())
            .ok_or(ReadError::Timeout(self.config.read_timeout))?;
        let image = sample_to_image(&sample).map_err(|e| ReadError::Decode(format!("{:#}", e)))?;

        self.frame_count += 1;
        Ok(Frame::captured_now(image, self.frame_count))
    }

    fn close(&mut self) {
        if self.playing {
            if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
                log::warn!("camera {}: failed to stop pipeline: {}", self.config.camera, e);
            }
            self.playing = false;
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.describe(),
        }
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn sample_to_image(sample: &gstreamer::Sample) -> anyhow::Result<RgbImage> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("RTSP buffer shorter than frame")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("RTSP buffer row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels).context("RTSP frame size mismatch")
}
