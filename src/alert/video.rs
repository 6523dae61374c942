//! Alert clip assembly.
//!
//! With the `video-ffmpeg` feature clips are encoded in process to MP4 (see
//! `video_ffmpeg`). Without it, frames are written as a Motion-JPEG AVI that
//! needs nothing beyond the JPEG encoder, optionally transcoded to MP4 by an
//! external `ffmpeg` binary. A failed transcode sends the AVI.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::error::EncodeError;
use crate::frame::{encode_jpeg, BufferedFrame};
use crate::CameraId;

pub const DEFAULT_VIDEO_FPS: u32 = 10;
const CLIP_JPEG_QUALITY: u8 = 80;

/// Assembles buffered frames into a clip file.
pub trait VideoAssembler: Send + Sync {
    fn assemble(
        &self,
        camera: CameraId,
        frames: &[BufferedFrame],
    ) -> Result<MediaArtifact, EncodeError>;
}

/// A media file on disk. The file is removed when the artifact is dropped.
#[derive(Debug)]
pub struct MediaArtifact {
    path: PathBuf,
    content_type: &'static str,
}

impl MediaArtifact {
    pub fn new(path: PathBuf, content_type: &'static str) -> Self {
        Self { path, content_type }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "alert".to_string())
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    pub fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        fs::read(&self.path)
    }
}

impl Drop for MediaArtifact {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// `alert_cam{camera}_{last capture time}_{n}`.
pub(crate) fn clip_stem(camera: CameraId, frames: &[BufferedFrame], n: u64) -> String {
    let stamp = frames
        .last()
        .map(|last| last.frame.captured_wall().format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_default();
    format!("alert_cam{}_{}_{}", camera, stamp, n)
}

/// Every clip frame shares the first frame's size.
pub(crate) fn uniform_image(image: &RgbImage, width: u32, height: u32) -> Cow<'_, RgbImage> {
    if image.dimensions() == (width, height) {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(imageops::resize(image, width, height, FilterType::Triangle))
    }
}

/// Motion-JPEG AVI writer with optional ffmpeg transcode.
#[derive(Debug)]
pub struct MjpegAviAssembler {
    output_dir: PathBuf,
    fps: u32,
    ffmpeg: Option<PathBuf>,
    counter: AtomicU64,
}

impl MjpegAviAssembler {
    pub fn new(output_dir: impl Into<PathBuf>, fps: u32) -> Self {
        Self {
            output_dir: output_dir.into(),
            fps: fps.max(1),
            ffmpeg: None,
            counter: AtomicU64::new(0),
        }
    }

    /// Transcode every clip to MP4 with this ffmpeg binary.
    pub fn with_ffmpeg(mut self, ffmpeg: impl Into<PathBuf>) -> Self {
        self.ffmpeg = Some(ffmpeg.into());
        self
    }

    fn transcode(&self, ffmpeg: &Path, avi: &Path) -> Result<PathBuf, EncodeError> {
        let mp4 = avi.with_extension("mp4");
        let output = Command::new(ffmpeg)
            .arg("-y")
            .args(["-loglevel", "error"])
            .arg("-i")
            .arg(avi)
            .args(["-c:v", "libx264", "-preset", "ultrafast", "-pix_fmt", "yuv420p"])
            .arg(&mp4)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            let _ = fs::remove_file(&mp4);
            return Err(EncodeError::Transcode(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(mp4)
    }
}

impl VideoAssembler for MjpegAviAssembler {
    fn assemble(
        &self,
        camera: CameraId,
        frames: &[BufferedFrame],
    ) -> Result<MediaArtifact, EncodeError> {
        let first = frames.first().ok_or(EncodeError::Empty(camera))?;
        let (width, height) = (first.frame.width(), first.frame.height());

        let mut jpegs = Vec::with_capacity(frames.len());
        for buffered in frames {
            let image = uniform_image(buffered.frame.image(), width, height);
            jpegs.push(encode_jpeg(&image, CLIP_JPEG_QUALITY)?);
        }

        fs::create_dir_all(&self.output_dir)?;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let avi_path = self
            .output_dir
            .join(format!("{}.avi", clip_stem(camera, frames, n)));
        fs::write(&avi_path, write_mjpeg_avi(&jpegs, width, height, self.fps))?;
        let avi = MediaArtifact::new(avi_path, "video/x-msvideo");

        let Some(ffmpeg) = self.ffmpeg.as_deref() else {
            return Ok(avi);
        };
        match self.transcode(ffmpeg, avi.path()) {
            // Dropping the AVI artifact deletes the intermediate file.
            Ok(mp4) => Ok(MediaArtifact::new(mp4, "video/mp4")),
            Err(e) => {
                log::warn!("camera {}: {}; sending MJPEG AVI instead", camera, e);
                Ok(avi)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// AVI container
// ----------------------------------------------------------------------------

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;

fn chunk(fourcc: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len() + 1);
    out.extend_from_slice(fourcc);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(0);
    }
    out
}

fn list(kind: &[u8; 4], form: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + body.len());
    data.extend_from_slice(form);
    data.extend_from_slice(body);
    chunk(kind, &data)
}

fn u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Serialize JPEG frames into a single-stream MJPEG AVI.
pub(crate) fn write_mjpeg_avi(jpegs: &[Vec<u8>], width: u32, height: u32, fps: u32) -> Vec<u8> {
    let frames = jpegs.len() as u32;
    let largest = jpegs.iter().map(|j| j.len()).max().unwrap_or(0) as u32;

    let avih = u32s(&[
        1_000_000 / fps,
        largest.saturating_mul(fps),
        0,
        AVIF_HASINDEX,
        frames,
        0,
        1,
        largest,
        width,
        height,
        0,
        0,
        0,
        0,
    ]);

    let mut strh = Vec::with_capacity(56);
    strh.extend_from_slice(b"vids");
    strh.extend_from_slice(b"MJPG");
    strh.extend_from_slice(&0u32.to_le_bytes()); // flags
    strh.extend_from_slice(&0u16.to_le_bytes()); // priority
    strh.extend_from_slice(&0u16.to_le_bytes()); // language
    strh.extend_from_slice(&u32s(&[0, 1, fps, 0, frames, largest, u32::MAX, 0]));
    for edge in [0u16, 0, width as u16, height as u16] {
        strh.extend_from_slice(&edge.to_le_bytes());
    }

    let mut strf = Vec::with_capacity(40);
    strf.extend_from_slice(&40u32.to_le_bytes());
    strf.extend_from_slice(&(width as i32).to_le_bytes());
    strf.extend_from_slice(&(height as i32).to_le_bytes());
    strf.extend_from_slice(&1u16.to_le_bytes());
    strf.extend_from_slice(&24u16.to_le_bytes());
    strf.extend_from_slice(b"MJPG");
    strf.extend_from_slice(&u32s(&[width * height * 3, 0, 0, 0, 0]));

    let strl = list(
        b"LIST",
        b"strl",
        &[chunk(b"strh", &strh), chunk(b"strf", &strf)].concat(),
    );
    let hdrl = list(b"LIST", b"hdrl", &[chunk(b"avih", &avih), strl].concat());

    let mut movi_body = Vec::new();
    let mut index = Vec::with_capacity(jpegs.len() * 16);
    for jpeg in jpegs {
        // Offsets are relative to the 'movi' form type.
        let offset = 4 + movi_body.len() as u32;
        movi_body.extend_from_slice(&chunk(b"00dc", jpeg));
        index.extend_from_slice(b"00dc");
        index.extend_from_slice(&u32s(&[AVIIF_KEYFRAME, offset, jpeg.len() as u32]));
    }
    let movi = list(b"LIST", b"movi", &movi_body);
    let idx1 = chunk(b"idx1", &index);

    list(b"RIFF", b"AVI ", &[hdrl, movi, idx1].concat())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use image::{Rgb, RgbImage};
    use std::time::Instant;

    fn frames(n: u64) -> Vec<BufferedFrame> {
        let now = Instant::now();
        (0..n)
            .map(|seq| {
                let image = RgbImage::from_pixel(32, 24, Rgb([(seq * 40) as u8, 90, 10]));
                BufferedFrame::new(Frame::captured_now(image, seq), now)
            })
            .collect()
    }

    fn count(haystack: &[u8], needle: &[u8]) -> usize {
        haystack.windows(needle.len()).filter(|w| *w == needle).count()
    }

    #[test]
    fn writes_playable_avi_layout() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = MjpegAviAssembler::new(dir.path(), 10);
        let artifact = assembler.assemble(CameraId(3), &frames(4)).unwrap();

        assert_eq!(artifact.content_type(), "video/x-msvideo");
        assert!(artifact.file_name().starts_with("alert_cam3_"));
        let bytes = artifact.read_bytes().unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize,
            bytes.len() - 8
        );
        assert_eq!(&bytes[8..12], b"AVI ");
        assert_eq!(count(&bytes, b"00dc"), 8, "4 data chunks + 4 index entries");
        assert_eq!(count(&bytes, b"idx1"), 1);

        // avih total-frames field.
        let avih = bytes.windows(4).position(|w| w == b"avih").unwrap();
        let total = u32::from_le_bytes(bytes[avih + 8 + 16..avih + 8 + 20].try_into().unwrap());
        assert_eq!(total, 4);
    }

    #[test]
    fn dropping_artifact_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = MjpegAviAssembler::new(dir.path(), 10);
        let artifact = assembler.assemble(CameraId(1), &frames(2)).unwrap();
        let path = artifact.path().to_path_buf();
        assert!(path.exists());
        drop(artifact);
        assert!(!path.exists());
    }

    #[test]
    fn empty_clip_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = MjpegAviAssembler::new(dir.path(), 10);
        assert!(matches!(
            assembler.assemble(CameraId(1), &[]),
            Err(EncodeError::Empty(CameraId(1)))
        ));
    }

    #[test]
    fn failed_transcode_keeps_avi() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = MjpegAviAssembler::new(dir.path(), 10)
            .with_ffmpeg(dir.path().join("no-such-ffmpeg"));
        let artifact = assembler.assemble(CameraId(2), &frames(3)).unwrap();
        assert_eq!(artifact.content_type(), "video/x-msvideo");
        assert!(artifact.path().exists());
    }
}
