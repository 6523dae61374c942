//! HTTP frame source.
//!
//! Handles the two shapes consumer IP cameras serve over HTTP:
//! - `multipart/x-mixed-replace` MJPEG streams, split on JPEG SOI/EOI markers
//! - single-JPEG snapshot endpoints, polled at the target rate

use std::io::{self, Read};
use std::time::{Duration, Instant};

use super::{redact_url, FrameSource, SourceConfig, SourceStats};
use crate::error::{ConnectError, ReadError};
use crate::frame::Frame;
use crate::CameraId;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct HttpSource {
    config: SourceConfig,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    /// Holds the body of the connecting request until it is consumed.
    SingleJpeg { pending: Option<Vec<u8>> },
}

impl HttpSource {
    pub fn new(config: SourceConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.read_timeout)
            .timeout_read(config.read_timeout)
            .build();
        Self {
            config,
            agent,
            stream: None,
            last_frame_at: None,
            frame_count: 0,
        }
    }

    fn fetch_single_jpeg(&self) -> Result<Vec<u8>, ReadError> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .map_err(|e| ReadError::Stream(format!("fetch jpeg snapshot: {}", e)))?;
        read_body(response).map_err(|e| read_error(e, self.config.read_timeout))
    }

    fn decode(&mut self, jpeg: &[u8]) -> Result<Frame, ReadError> {
        let image = image::load_from_memory(jpeg)
            .map_err(|e| ReadError::Decode(e.to_string()))?
            .into_rgb8();
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Frame::captured_now(image, self.frame_count))
    }
}

impl FrameSource for HttpSource {
    fn camera_id(&self) -> CameraId {
        self.config.camera
    }

    fn describe(&self) -> String {
        redact_url(&self.config.url)
    }

    fn open(&mut self) -> Result<(), ConnectError> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .map_err(|e| ConnectError::Unreachable(format!("{}: {}", self.describe(), e)))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();

        let stream = if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(
                response.into_reader(),
                self.config.read_timeout,
            ))
        } else {
            let body = read_body(response)
                .map_err(|e| ConnectError::Unreachable(format!("{}: {}", self.describe(), e)))?;
            HttpStream::SingleJpeg {
                pending: Some(body),
            }
        };
        self.stream = Some(stream);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, ReadError> {
        let min_interval = self.config.frame_interval();
        loop {
            let jpeg = match self.stream.as_mut().ok_or(ReadError::NotOpen)? {
                HttpStream::Mjpeg(stream) => {
                    let jpeg = stream.read_next_jpeg()?;
                    // Drop frames arriving faster than the target rate.
                    if let Some(last) = self.last_frame_at {
                        if last.elapsed() < min_interval {
                            continue;
                        }
                    }
                    jpeg
                }
                HttpStream::SingleJpeg { pending } => match pending.take() {
                    Some(body) => body,
                    None => {
                        if let Some(last) = self.last_frame_at {
                            let elapsed = last.elapsed();
                            if elapsed < min_interval {
                                std::thread::sleep(min_interval - elapsed);
                            }
                        }
                        self.fetch_single_jpeg()?
                    }
                },
            };
            return self.decode(&jpeg);
        }
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.describe(),
        }
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
    timeout: Duration,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>, timeout: Duration) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
            timeout,
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>, ReadError> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self
                .reader
                .read(&mut chunk)
                .map_err(|e| read_error(e, self.timeout))?;
            if read == 0 {
                return Err(ReadError::Stream("mjpeg stream ended".to_string()));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn read_body(response: ureq::Response) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)?;
    if bytes.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty jpeg body"));
    }
    Ok(bytes)
}

fn read_error(error: io::Error, timeout: Duration) -> ReadError {
    match error.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ReadError::Timeout(timeout),
        _ => ReadError::Stream(error.to_string()),
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tiny_jpeg(value: u8) -> Vec<u8> {
        let image = image::RgbImage::from_pixel(16, 16, image::Rgb([value; 3]));
        crate::frame::encode_jpeg(&image, 90).unwrap()
    }

    #[test]
    fn finds_jpeg_bounds_between_boundaries() {
        let jpeg = tiny_jpeg(100);
        let mut body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        let offset = body.len();
        body.extend_from_slice(&jpeg);
        body.extend_from_slice(b"\r\n--frame\r\n");

        let (start, end) = find_jpeg_bounds(&body).unwrap();
        assert_eq!(start, offset);
        assert_eq!(&body[start..end], &jpeg[..]);
        assert!(find_jpeg_bounds(b"no markers here").is_none());
    }

    #[test]
    fn mjpeg_stream_yields_consecutive_frames() {
        let mut body = Vec::new();
        for value in [40u8, 200] {
            body.extend_from_slice(b"--frame\r\n\r\n");
            body.extend_from_slice(&tiny_jpeg(value));
        }
        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)), Duration::from_secs(1));

        let first = image::load_from_memory(&stream.read_next_jpeg().unwrap()).unwrap();
        let second = image::load_from_memory(&stream.read_next_jpeg().unwrap()).unwrap();
        assert!(first.to_rgb8().get_pixel(8, 8)[0] < 100);
        assert!(second.to_rgb8().get_pixel(8, 8)[0] > 150);
        assert!(matches!(stream.read_next_jpeg(), Err(ReadError::Stream(_))));
    }
}
