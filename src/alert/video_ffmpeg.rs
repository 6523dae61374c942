//! In-process clip encoding through libav.
//!
//! Frames are scaled to YUV420P and encoded as H.264 (MPEG-4 Part 2 when no
//! H.264 encoder is built in) into an MP4 container. Any encoder failure
//! falls back to the Motion-JPEG AVI writer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use ffmpeg_next as ffmpeg;
use image::RgbImage;

use super::video::{clip_stem, uniform_image, MediaArtifact, MjpegAviAssembler, VideoAssembler};
use crate::error::EncodeError;
use crate::frame::BufferedFrame;
use crate::CameraId;

impl From<ffmpeg::Error> for EncodeError {
    fn from(e: ffmpeg::Error) -> Self {
        EncodeError::Transcode(format!("ffmpeg: {}", e))
    }
}

#[derive(Debug)]
pub struct FfmpegAssembler {
    output_dir: PathBuf,
    fps: u32,
    counter: AtomicU64,
    fallback: MjpegAviAssembler,
}

impl FfmpegAssembler {
    pub fn new(output_dir: impl Into<PathBuf>, fps: u32) -> Result<Self, EncodeError> {
        ffmpeg::init()?;
        let output_dir = output_dir.into();
        let fps = fps.max(1);
        Ok(Self {
            fallback: MjpegAviAssembler::new(output_dir.clone(), fps),
            output_dir,
            fps,
            counter: AtomicU64::new(0),
        })
    }

    fn encode(&self, path: &Path, frames: &[BufferedFrame]) -> Result<(), EncodeError> {
        let first = frames
            .first()
            .ok_or_else(|| EncodeError::Transcode("no frames".to_string()))?;
        // yuv420p needs even dimensions.
        let width = (first.frame.width() & !1).max(2);
        let height = (first.frame.height() & !1).max(2);

        let mut output = ffmpeg::format::output(&path)?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::H264)
            .or_else(|| ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4))
            .ok_or_else(|| EncodeError::Transcode("no H.264 or MPEG-4 encoder".to_string()))?;

        let mut stream = output.add_stream(codec)?;
        let stream_index = stream.index();

        let mut setup = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        setup.set_width(width);
        setup.set_height(height);
        setup.set_format(ffmpeg::format::Pixel::YUV420P);
        setup.set_time_base((1, self.fps as i32));
        setup.set_frame_rate(Some((self.fps as i32, 1)));
        if global_header {
            setup.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let mut encoder = setup.open_as(codec)?;
        stream.set_parameters(&encoder);
        let encoder_time_base = ffmpeg::Rational::new(1, self.fps as i32);

        output.write_header()?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| EncodeError::Transcode("output stream vanished".to_string()))?;

        let mut scaler = ffmpeg::software::scaling::context::Context::get(
            ffmpeg::format::Pixel::RGB24,
            width,
            height,
            ffmpeg::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )?;

        let mut rgb = ffmpeg::frame::Video::new(ffmpeg::format::Pixel::RGB24, width, height);
        let mut yuv = ffmpeg::frame::Video::empty();
        for (pts, buffered) in frames.iter().enumerate() {
            let image = uniform_image(buffered.frame.image(), width, height);
            fill_rgb(&mut rgb, &image);
            scaler.run(&rgb, &mut yuv)?;
            yuv.set_pts(Some(pts as i64));
            encoder.send_frame(&yuv)?;
            write_packets(&mut encoder, &mut output, stream_index, encoder_time_base, stream_time_base)?;
        }
        encoder.send_eof()?;
        write_packets(&mut encoder, &mut output, stream_index, encoder_time_base, stream_time_base)?;
        output.write_trailer()?;
        Ok(())
    }
}

fn fill_rgb(frame: &mut ffmpeg::frame::Video, image: &RgbImage) {
    let stride = frame.stride(0);
    let row_len = image.width() as usize * 3;
    let pixels = image.as_raw();
    let data = frame.data_mut(0);
    for (y, row) in pixels.chunks_exact(row_len).enumerate() {
        let start = y * stride;
        data[start..start + row_len].copy_from_slice(row);
    }
}

fn write_packets(
    encoder: &mut ffmpeg::encoder::video::Encoder,
    output: &mut ffmpeg::format::context::Output,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
) -> Result<(), EncodeError> {
    let mut packet = ffmpeg::Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(encoder_time_base, stream_time_base);
        packet.write_interleaved(output)?;
    }
    Ok(())
}

impl VideoAssembler for FfmpegAssembler {
    fn assemble(
        &self,
        camera: CameraId,
        frames: &[BufferedFrame],
    ) -> Result<MediaArtifact, EncodeError> {
        if frames.is_empty() {
            return Err(EncodeError::Empty(camera));
        }
        std::fs::create_dir_all(&self.output_dir)?;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self
            .output_dir
            .join(format!("{}.mp4", clip_stem(camera, frames, n)));
        // Owns the file from here on so a half-written clip is removed.
        let artifact = MediaArtifact::new(path, "video/mp4");

        match self.encode(artifact.path(), frames) {
            Ok(()) => Ok(artifact),
            Err(e) => {
                log::warn!("camera {}: {}; writing MJPEG AVI instead", camera, e);
                drop(artifact);
                self.fallback.assemble(camera, frames)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use image::Rgb;
    use std::time::Instant;

    fn frames(n: u64, width: u32, height: u32) -> Vec<BufferedFrame> {
        let now = Instant::now();
        (0..n)
            .map(|seq| {
                let image = RgbImage::from_pixel(width, height, Rgb([(seq * 30) as u8, 120, 40]));
                BufferedFrame::new(Frame::captured_now(image, seq), now)
            })
            .collect()
    }

    #[test]
    fn encodes_an_mp4_clip() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = FfmpegAssembler::new(dir.path(), 10).unwrap();
        // Odd sizes are trimmed to even before encoding.
        let artifact = assembler.assemble(CameraId(2), &frames(6, 65, 49)).unwrap();

        let bytes = artifact.read_bytes().unwrap();
        assert!(!bytes.is_empty());
        if artifact.content_type() == "video/mp4" {
            assert_eq!(&bytes[4..8], b"ftyp");
        } else {
            assert_eq!(&bytes[0..4], b"RIFF");
        }
        let path = artifact.path().to_path_buf();
        drop(artifact);
        assert!(!path.exists());
    }

    #[test]
    fn empty_clip_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = FfmpegAssembler::new(dir.path(), 10).unwrap();
        assert!(matches!(
            assembler.assemble(CameraId(1), &[]),
            Err(EncodeError::Empty(CameraId(1)))
        ));
    }
}
