//! Synthetic frame source (`stub://name[?mode=...]`).
//!
//! Generates a static backdrop with an "intruder" block that walks across
//! the scene for part of every cycle. Query parameters:
//! - `mode`: `live` (default), `blank`, `offline`, `flaky`
//! - `width`, `height`: frame size (default 640x480)
//! - `fail_rate`: read failure probability in `flaky` mode (default 0.1)

use std::time::Instant;

use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use url::Url;

use super::{FrameSource, SourceConfig, SourceStats};
use crate::error::{ConnectError, ReadError};
use crate::frame::Frame;
use crate::CameraId;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FAIL_RATE: f64 = 0.1;

/// Frames per scene cycle, and the part of it the intruder is visible.
const CYCLE_FRAMES: u64 = 100;
const INTRUDER_FROM: u64 = 30;
const INTRUDER_UNTIL: u64 = 70;
const INTRUDER_STEP_PX: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SyntheticMode {
    Live,
    /// Near-black frames; rejected by the blank probe.
    Blank,
    /// `open` always fails.
    Offline,
    /// Reads fail at random.
    Flaky { fail_rate: f64 },
}

pub struct SyntheticSource {
    config: SourceConfig,
    mode: SyntheticMode,
    width: u32,
    height: u32,
    open: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig, mode: SyntheticMode, width: u32, height: u32) -> Self {
        Self {
            config,
            mode,
            width: width.max(2),
            height: height.max(2),
            open: false,
            frame_count: 0,
            last_frame_at: None,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn from_url(config: SourceConfig, url: &Url) -> Result<Self, ConnectError> {
        let mut mode = SyntheticMode::Live;
        let mut width = DEFAULT_WIDTH;
        let mut height = DEFAULT_HEIGHT;
        let mut fail_rate = DEFAULT_FAIL_RATE;
        let mut flaky = false;

        let invalid = |key: &str, value: &str| {
            ConnectError::Unsupported(format!("invalid stub parameter {}={}", key, value))
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "mode" => match value.as_ref() {
                    "live" => mode = SyntheticMode::Live,
                    "blank" => mode = SyntheticMode::Blank,
                    "offline" => mode = SyntheticMode::Offline,
                    "flaky" => flaky = true,
                    _ => return Err(invalid(&key, &value)),
                },
                "width" => width = value.parse().map_err(|_| invalid(&key, &value))?,
                "height" => height = value.parse().map_err(|_| invalid(&key, &value))?,
                "fail_rate" => {
                    fail_rate = value
                        .parse::<f64>()
                        .ok()
                        .filter(|rate| (0.0..=1.0).contains(rate))
                        .ok_or_else(|| invalid(&key, &value))?
                }
                _ => return Err(invalid(&key, &value)),
            }
        }
        if flaky {
            mode = SyntheticMode::Flaky { fail_rate };
        }

        Ok(Self::new(config, mode, width, height))
    }

    pub fn mode(&self) -> SyntheticMode {
        self.mode
    }

    fn pace(&mut self) {
        let interval = self.config.frame_interval();
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    fn render(&mut self) -> RgbImage {
        if self.mode == SyntheticMode::Blank {
            let rng = &mut self.rng;
            return RgbImage::from_fn(self.width, self.height, |_, _| {
                Rgb([rng.gen_range(0..=6); 3])
            });
        }

        let height = self.height;
        let mut image = RgbImage::from_fn(self.width, self.height, |x, y| {
            let shade = 70 + (y * 50 / height) as u8;
            Rgb([shade, shade.saturating_add((x % 7) as u8), shade])
        });

        let phase = self.frame_count % CYCLE_FRAMES;
        if (INTRUDER_FROM..INTRUDER_UNTIL).contains(&phase) {
            let block_w = (self.width / 8).max(1);
            let block_h = (self.height / 3).max(1);
            let travel = self.width.saturating_sub(block_w).max(1);
            let x0 = ((phase - INTRUDER_FROM) as u32 * INTRUDER_STEP_PX) % travel;
            let y0 = self.height - block_h - self.height / 10;
            for y in y0..(y0 + block_h).min(self.height) {
                for x in x0..(x0 + block_w).min(self.width) {
                    image.put_pixel(x, y, Rgb([210, 180, 150]));
                }
            }
        }
        image
    }
}

impl FrameSource for SyntheticSource {
    fn camera_id(&self) -> CameraId {
        self.config.camera
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }

    fn open(&mut self) -> Result<(), ConnectError> {
        if self.mode == SyntheticMode::Offline {
            return Err(ConnectError::Unreachable(format!(
                "{} is offline",
                self.config.url
            )));
        }
        self.open = true;
        log::debug!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, ReadError> {
        if !self.open {
            return Err(ReadError::NotOpen);
        }
        self.pace();

        if let SyntheticMode::Flaky { fail_rate } = self.mode {
            if self.rng.gen_bool(fail_rate) {
                return Err(ReadError::Stream("synthetic dropout".to_string()));
            }
        }

        let image = self.render();
        self.frame_count += 1;
        Ok(Frame::captured_now(image, self.frame_count))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.url.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn source(url: &str) -> SyntheticSource {
        let mut config = SourceConfig::new(CameraId(1), url);
        config.target_fps = 0;
        let parsed = Url::parse(url).unwrap();
        SyntheticSource::from_url(config, &parsed).unwrap()
    }

    #[test]
    fn synthetic_source_produces_frames() {
        let mut source = source("stub://test?width=320&height=240");
        source.open().unwrap();

        let frame = source.read_frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (320, 240));
        assert_eq!(frame.sequence(), 1);
        assert!(!frame.is_blank());
        assert_eq!(source.stats().frames_captured, 1);
    }

    #[test]
    fn intruder_appears_mid_cycle() {
        let mut source = source("stub://test?width=160&height=120");
        source.open().unwrap();

        let frames: Vec<Frame> = (0..40).map(|_| source.read_frame().unwrap()).collect();
        // Background frames are identical; the intruder changes the scene.
        assert_eq!(frames[0].image(), frames[10].image());
        assert_ne!(frames[0].image(), frames[35].image());
    }

    #[test]
    fn parses_modes() {
        assert_eq!(source("stub://a?mode=blank").mode(), SyntheticMode::Blank);
        assert_eq!(
            source("stub://a?mode=flaky&fail_rate=1").mode(),
            SyntheticMode::Flaky { fail_rate: 1.0 }
        );

        let config = SourceConfig::new(CameraId(1), "stub://a?mode=sideways");
        let url = Url::parse(&config.url).unwrap();
        assert!(SyntheticSource::from_url(config, &url).is_err());
    }

    #[test]
    fn flaky_source_fails_reads() {
        let mut source = source("stub://a?mode=flaky&fail_rate=1");
        source.open().unwrap();
        assert!(matches!(source.read_frame(), Err(ReadError::Stream(_))));
    }

    #[test]
    fn read_before_open_fails() {
        let mut source = source("stub://a");
        assert!(matches!(source.read_frame(), Err(ReadError::NotOpen)));
    }
}
