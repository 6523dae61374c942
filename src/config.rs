use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::AlertKind;
use crate::frame::FlushPolicy;
use crate::ingest::SourceConfig;
use crate::orchestrator::PipelineSettings;
use crate::worker::WorkerSettings;
use crate::CameraId;

const DEFAULT_STORE_PATH: &str = "memory.json";
const DEFAULT_MEDIA_DIR: &str = "media";
const DEFAULT_CAMERA_URL: &str = "stub://front_camera";
const DEFAULT_BOT_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_BOT_POLL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TARGET_FPS: u32 = crate::ingest::DEFAULT_TARGET_FPS;
const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DEBOUNCE_INTERVAL_MS: u64 = 2_000;
const DEFAULT_VIDEO_FPS: u32 = crate::alert::DEFAULT_VIDEO_FPS;
const DEFAULT_MODEL_INPUT: u32 = 640;

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    store_path: Option<String>,
    bot: Option<BotConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
    capture: Option<CaptureConfigFile>,
    debounce: Option<DebounceConfigFile>,
    buffer: Option<BufferConfigFile>,
    rate: Option<RateConfigFile>,
    video: Option<VideoConfigFile>,
    model: Option<ModelConfigFile>,
    alert_kind: Option<AlertKind>,
}

#[derive(Debug, Deserialize, Default)]
struct BotConfigFile {
    token: Option<String>,
    api_base: Option<String>,
    poll_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: Option<u16>,
    url: String,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    target_fps: Option<u32>,
    read_timeout_ms: Option<u64>,
    working_width: Option<u32>,
    working_height: Option<u32>,
    decimation: Option<u32>,
    reconnect_backoff_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DebounceConfigFile {
    threshold: Option<u32>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BufferConfigFile {
    capacity: Option<usize>,
    video_threshold: Option<usize>,
    max_wait_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RateConfigFile {
    max_per_minute: Option<u32>,
    min_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    output_dir: Option<PathBuf>,
    fps: Option<u32>,
    ffmpeg: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    backend: Option<BackendKind>,
    path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    confidence_threshold: Option<f32>,
    activated: Option<bool>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Stub,
    Tract,
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub store_path: PathBuf,
    pub bot: BotSettings,
    pub cameras: Vec<CameraSettings>,
    pub capture: CaptureSettings,
    pub debounce: DebounceSettings,
    pub buffer: BufferSettings,
    pub rate: RateSettings,
    pub video: VideoSettings,
    pub model: ModelSettings,
    pub alert_kind: AlertKind,
}

#[derive(Debug, Clone)]
pub struct BotSettings {
    pub token: Option<String>,
    pub api_base: String,
    pub poll_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub id: CameraId,
    pub url: String,
    pub target_fps: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub target_fps: u32,
    pub read_timeout: Duration,
    pub working_width: u32,
    pub working_height: u32,
    pub decimation: u32,
    pub reconnect_backoff: Duration,
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DebounceSettings {
    pub threshold: u32,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub capacity: usize,
    pub video_threshold: usize,
    pub max_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct RateSettings {
    pub max_per_minute: u32,
    pub min_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub output_dir: PathBuf,
    pub fps: u32,
    pub ffmpeg: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub backend: BackendKind,
    pub path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
    pub activated: bool,
}

impl SentinelConfig {
    /// Load from `path`, or from `SENTINEL_CONFIG` when no path is given,
    /// then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("SENTINEL_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let config_path = path.map(Path::to_path_buf).or(env_path);
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Result<Self> {
        let store_path = PathBuf::from(
            file.store_path
                .unwrap_or_else(|| DEFAULT_STORE_PATH.to_string()),
        );

        let bot_file = file.bot.unwrap_or_default();
        let bot = BotSettings {
            token: bot_file.token.filter(|t| !t.trim().is_empty()),
            api_base: bot_file
                .api_base
                .unwrap_or_else(|| DEFAULT_BOT_API_BASE.to_string()),
            poll_timeout: Duration::from_secs(
                bot_file
                    .poll_timeout_secs
                    .unwrap_or(DEFAULT_BOT_POLL_TIMEOUT_SECS),
            ),
        };

        let cameras = match file.cameras {
            Some(cameras) => cameras
                .into_iter()
                .enumerate()
                .map(|(index, camera)| CameraSettings {
                    id: CameraId(camera.id.unwrap_or(index as u16 + 1)),
                    url: camera.url,
                    target_fps: camera.target_fps,
                })
                .collect(),
            None => vec![CameraSettings {
                id: CameraId(1),
                url: DEFAULT_CAMERA_URL.to_string(),
                target_fps: None,
            }],
        };

        let capture_file = file.capture.unwrap_or_default();
        let capture = CaptureSettings {
            target_fps: capture_file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            read_timeout: Duration::from_millis(
                capture_file
                    .read_timeout_ms
                    .unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
            working_width: capture_file
                .working_width
                .unwrap_or(crate::worker::DEFAULT_WORKING_WIDTH),
            working_height: capture_file
                .working_height
                .unwrap_or(crate::worker::DEFAULT_WORKING_HEIGHT),
            decimation: capture_file
                .decimation
                .unwrap_or(crate::worker::DEFAULT_DECIMATION),
            reconnect_backoff: capture_file
                .reconnect_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(crate::worker::DEFAULT_RECONNECT_BACKOFF),
            max_reconnect_attempts: capture_file.max_reconnect_attempts,
        };

        let debounce_file = file.debounce.unwrap_or_default();
        let debounce = DebounceSettings {
            threshold: debounce_file
                .threshold
                .unwrap_or(crate::debounce::DEFAULT_DETECTION_THRESHOLD),
            interval: Duration::from_millis(
                debounce_file
                    .interval_ms
                    .unwrap_or(DEFAULT_DEBOUNCE_INTERVAL_MS),
            ),
        };

        let buffer_file = file.buffer.unwrap_or_default();
        let buffer = BufferSettings {
            capacity: buffer_file
                .capacity
                .unwrap_or(crate::frame::DEFAULT_BUFFER_CAPACITY),
            video_threshold: buffer_file
                .video_threshold
                .unwrap_or(crate::frame::DEFAULT_VIDEO_THRESHOLD),
            max_wait: buffer_file
                .max_wait_secs
                .map(Duration::from_secs)
                .unwrap_or(crate::frame::DEFAULT_MAX_WAIT),
        };

        let rate_file = file.rate.unwrap_or_default();
        let rate = RateSettings {
            max_per_minute: rate_file
                .max_per_minute
                .unwrap_or(crate::alert::DEFAULT_MAX_PER_MINUTE),
            min_interval: rate_file
                .min_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(crate::alert::DEFAULT_MIN_INTERVAL),
        };

        let video_file = file.video.unwrap_or_default();
        let video = VideoSettings {
            output_dir: video_file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_DIR)),
            fps: video_file.fps.unwrap_or(DEFAULT_VIDEO_FPS),
            ffmpeg: video_file.ffmpeg,
        };

        let model_file = file.model.unwrap_or_default();
        let model = ModelSettings {
            backend: model_file.backend.unwrap_or_default(),
            path: model_file.path,
            input_width: model_file.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
            input_height: model_file.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
            confidence_threshold: model_file
                .confidence_threshold
                .unwrap_or(crate::detect::DEFAULT_CONFIDENCE_THRESHOLD),
            activated: model_file.activated.unwrap_or(true),
        };

        Ok(Self {
            store_path,
            bot,
            cameras,
            capture,
            debounce,
            buffer,
            rate,
            video,
            model,
            alert_kind: file.alert_kind.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SENTINEL_STORE_PATH") {
            if !path.trim().is_empty() {
                self.store_path = PathBuf::from(path);
            }
        }
        if let Ok(token) = std::env::var("SENTINEL_BOT_TOKEN") {
            if !token.trim().is_empty() {
                self.bot.token = Some(token.trim().to_string());
            }
        }
        if let Ok(cameras) = std::env::var("SENTINEL_CAMERAS") {
            let parsed = split_csv(&cameras)
                .into_iter()
                .enumerate()
                .map(|(index, entry)| parse_camera_entry(index, &entry))
                .collect::<Result<Vec<_>>>()?;
            if !parsed.is_empty() {
                self.cameras = parsed;
            }
        }
        if let Ok(path) = std::env::var("SENTINEL_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.model.path = Some(PathBuf::from(path));
                self.model.backend = BackendKind::Tract;
            }
        }
        if let Ok(dir) = std::env::var("SENTINEL_MEDIA_DIR") {
            if !dir.trim().is_empty() {
                self.video.output_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.id.get() == 0 {
                return Err(anyhow!("camera ids must be positive ({})", camera.url));
            }
            if !seen.insert(camera.id) {
                return Err(anyhow!("duplicate camera id {}", camera.id));
            }
            if camera.url.trim().is_empty() {
                return Err(anyhow!("camera {} has an empty url", camera.id));
            }
        }
        if self.capture.decimation == 0 {
            return Err(anyhow!("capture.decimation must be at least 1"));
        }
        if self.capture.working_width == 0 || self.capture.working_height == 0 {
            return Err(anyhow!("capture working resolution must be non-zero"));
        }
        if self.debounce.threshold == 0 {
            return Err(anyhow!("debounce.threshold must be at least 1"));
        }
        if self.buffer.capacity == 0 || self.buffer.video_threshold == 0 {
            return Err(anyhow!("buffer capacity and video_threshold must be non-zero"));
        }
        if self.buffer.video_threshold > self.buffer.capacity {
            return Err(anyhow!(
                "buffer.video_threshold ({}) exceeds buffer.capacity ({}); the buffer could never fill",
                self.buffer.video_threshold,
                self.buffer.capacity
            ));
        }
        if self.rate.max_per_minute == 0 {
            return Err(anyhow!("rate.max_per_minute must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.model.confidence_threshold) {
            return Err(anyhow!("model.confidence_threshold must be within 0..=1"));
        }
        if self.model.backend == BackendKind::Tract && self.model.path.is_none() {
            return Err(anyhow!("model.path is required for the tract backend"));
        }
        Ok(())
    }

    pub fn source_configs(&self) -> Vec<SourceConfig> {
        self.cameras
            .iter()
            .map(|camera| SourceConfig {
                camera: camera.id,
                url: camera.url.clone(),
                target_fps: camera.target_fps.unwrap_or(self.capture.target_fps),
                read_timeout: self.capture.read_timeout,
            })
            .collect()
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            decimation: self.capture.decimation,
            working_width: self.capture.working_width,
            working_height: self.capture.working_height,
            reconnect_backoff: self.capture.reconnect_backoff,
            max_reconnect_attempts: self.capture.max_reconnect_attempts,
            alert_kind: self.alert_kind,
        }
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            video_threshold: self.buffer.video_threshold,
            max_wait: self.buffer.max_wait,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            worker: self.worker_settings(),
            debounce_threshold: self.debounce.threshold,
            debounce_interval: self.debounce.interval,
            buffer_capacity: self.buffer.capacity,
            flush: self.flush_policy(),
        }
    }
}

/// `url` or `id=url`.
fn parse_camera_entry(index: usize, entry: &str) -> Result<CameraSettings> {
    let (id, url) = match entry.split_once('=') {
        Some((id, url)) if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) => {
            let id: u16 = id
                .parse()
                .map_err(|_| anyhow!("SENTINEL_CAMERAS: invalid camera id '{}'", id))?;
            (id, url.to_string())
        }
        _ => (index as u16 + 1, entry.to_string()),
    };
    Ok(CameraSettings {
        id: CameraId(id),
        url,
        target_fps: None,
    })
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
