//! Footage input: random-access video decoding and the coarse frame reader.

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};

use thiserror::Error;

use ffmpeg_next as ffmpeg;

use ffmpeg::codec;
use ffmpeg::format;
use ffmpeg::media;
use ffmpeg::software::scaling::{context::Context as ScalingContext, flag::Flags as ScalingFlags};
use ffmpeg::util::format::pixel::Pixel;
use ffmpeg::util::frame;

use crate::io::image::RgbFrame;

/// Additional frames skipped after every processed frame; the tracker sees
/// every `FRAMESKIP + 1`-th frame of the footage.
pub const FRAMESKIP: u32 = 7;

#[derive(Debug, Error)]
pub enum FootageError {
    #[error("invalid footage path: {0}")]
    InvalidPath(PathBuf),
    #[error("footage file not found: {0}")]
    MissingPath(PathBuf),
    #[error("footage path is not a file: {0}")]
    NotAFile(PathBuf),
    #[error("footage file is empty: {0}")]
    EmptyFile(PathBuf),
    #[error("footage file is not readable: {0}")]
    Unreadable(PathBuf),
    #[error("failed to initialize ffmpeg: {0}")]
    InitFailed(String),
    #[error("failed to open input: {0}")]
    OpenFailed(String),
    #[error("missing video stream")]
    StreamMissing,
    #[error("footage reports no frames: {0}")]
    NoFrames(PathBuf),
    #[error("failed to create decoder: {0}")]
    Decoder(String),
    #[error("failed to configure scaler: {0}")]
    Scaler(String),
    #[error("decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, FootageError>;

/// Seam between the tracker and a concrete video decoder.
///
/// Sources must be rewindable; realtime streams are unsupported because the
/// tracker peeks the first frame during initialization and then seeks back.
pub trait FootageSource {
    fn frame_count(&self) -> usize;
    fn fps(&self) -> f64;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Decode and return the next frame, or `None` at end of stream.
    fn read_next(&mut self) -> Result<Option<RgbFrame>>;
    /// Decode and discard the next frame. Returns false at end of stream.
    fn grab_next(&mut self) -> Result<bool>;
    /// Rewind to the first frame.
    fn seek_start(&mut self) -> Result<()>;
}

/// ffmpeg-backed footage decoder.
pub struct FfmpegFootage {
    path: PathBuf,
    input: format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: ScalingContext,
    pending: VecDeque<frame::Video>,
    width: u32,
    height: u32,
    fps: f64,
    frame_count: usize,
}

impl FfmpegFootage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let path_str = path
            .to_str()
            .ok_or_else(|| FootageError::InvalidPath(path.clone()))?;

        validate_file(&path)?;

        ffmpeg::init().map_err(|err| FootageError::InitFailed(err.to_string()))?;

        let input =
            format::input(&path_str).map_err(|err| FootageError::OpenFailed(err.to_string()))?;

        let stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or(FootageError::StreamMissing)?;
        let stream_index = stream.index();

        let fps = frame_rate_from_stream(&stream);
        let frame_count = match stream.frames() {
            count if count > 0 => count as usize,
            // Some containers omit the frame count; estimate from duration.
            _ => {
                let duration = input.duration();
                if duration > 0 {
                    (duration as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE) * fps).round() as usize
                } else {
                    0
                }
            }
        };
        if frame_count == 0 {
            return Err(FootageError::NoFrames(path));
        }

        let decoder = open_decoder(&stream)?;
        let scaler = rgb_scaler(&decoder)?;

        let width = decoder.width();
        let height = decoder.height();

        Ok(Self {
            path,
            input,
            stream_index,
            decoder,
            scaler,
            pending: VecDeque::new(),
            width,
            height,
            fps,
            frame_count,
        })
    }

    fn decode_next_raw(&mut self) -> Result<Option<frame::Video>> {
        if let Some(decoded) = self.pending.pop_front() {
            return Ok(Some(decoded));
        }

        let stream_index = self.stream_index;
        let mut decoded = frame::Video::empty();

        let Self {
            input,
            decoder,
            pending,
            ..
        } = self;

        for (stream, packet) in input.packets() {
            if stream.index() != stream_index {
                continue;
            }

            decoder
                .send_packet(&packet)
                .map_err(|err| FootageError::Decode(err.to_string()))?;

            while decoder.receive_frame(&mut decoded).is_ok() {
                pending.push_back(decoded.clone());
            }

            if let Some(front) = pending.pop_front() {
                return Ok(Some(front));
            }
        }

        decoder
            .send_eof()
            .map_err(|err| FootageError::Decode(err.to_string()))?;
        while decoder.receive_frame(&mut decoded).is_ok() {
            pending.push_back(decoded.clone());
        }

        Ok(pending.pop_front())
    }

    fn convert(&mut self, decoded: &frame::Video) -> Result<RgbFrame> {
        let mut rgb = frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb)
            .map_err(|err| FootageError::Decode(err.to_string()))?;

        // The scaler may pad rows; repack without stride.
        let stride = rgb.stride(0);
        let row_bytes = self.width as usize * 3;
        let src = rgb.data(0);
        let mut data = Vec::with_capacity(row_bytes * self.height as usize);
        for y in 0..self.height as usize {
            let start = y * stride;
            data.extend_from_slice(&src[start..start + row_bytes]);
        }

        Ok(RgbFrame::new(self.width, self.height, data))
    }
}

impl FootageSource for FfmpegFootage {
    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn read_next(&mut self) -> Result<Option<RgbFrame>> {
        match self.decode_next_raw()? {
            Some(decoded) => Ok(Some(self.convert(&decoded)?)),
            None => Ok(None),
        }
    }

    fn grab_next(&mut self) -> Result<bool> {
        Ok(self.decode_next_raw()?.is_some())
    }

    fn seek_start(&mut self) -> Result<()> {
        // Reopening is the portable way to land exactly on frame zero.
        let path_str = self
            .path
            .to_str()
            .ok_or_else(|| FootageError::InvalidPath(self.path.clone()))?;
        self.input =
            format::input(&path_str).map_err(|err| FootageError::OpenFailed(err.to_string()))?;

        let stream = self
            .input
            .streams()
            .best(media::Type::Video)
            .ok_or(FootageError::StreamMissing)?;
        self.stream_index = stream.index();
        self.decoder = open_decoder(&stream)?;
        self.scaler = rgb_scaler(&self.decoder)?;
        self.pending.clear();
        Ok(())
    }
}

fn open_decoder(stream: &format::stream::Stream) -> Result<ffmpeg::decoder::Video> {
    let context = codec::context::Context::from_parameters(stream.parameters())
        .map_err(|err| FootageError::Decoder(err.to_string()))?;
    context
        .decoder()
        .video()
        .map_err(|err| FootageError::Decoder(err.to_string()))
}

fn rgb_scaler(decoder: &ffmpeg::decoder::Video) -> Result<ScalingContext> {
    ScalingContext::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        ScalingFlags::BILINEAR,
    )
    .map_err(|err| FootageError::Scaler(err.to_string()))
}

fn frame_rate_from_stream(stream: &format::stream::Stream) -> f64 {
    let fps = f64::from(stream.rate());
    if fps > 1.0 {
        fps
    } else {
        30.0
    }
}

fn validate_file(path: &Path) -> Result<()> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) => {
            return Err(match err.kind() {
                std::io::ErrorKind::NotFound => FootageError::MissingPath(path.to_path_buf()),
                _ => FootageError::Unreadable(path.to_path_buf()),
            })
        }
    };
    if !metadata.is_file() {
        return Err(FootageError::NotAFile(path.to_path_buf()));
    }
    if metadata.len() == 0 {
        return Err(FootageError::EmptyFile(path.to_path_buf()));
    }
    File::open(path).map_err(|_| FootageError::Unreadable(path.to_path_buf()))?;
    Ok(())
}

/// Coarse reader over a footage source.
///
/// `next_frame` reads one frame and then skips [`FRAMESKIP`] more, so the
/// absolute position advances by 8 frames per call while the coarse index
/// counts processed frames.
pub struct FrameReader<'a> {
    source: &'a mut dyn FootageSource,
    length: usize,
    frame_index: u32,
    coarse_index: u32,
}

impl<'a> FrameReader<'a> {
    pub fn new(source: &'a mut dyn FootageSource) -> Self {
        let length = source.frame_count();
        Self {
            source,
            length,
            frame_index: 0,
            coarse_index: 0,
        }
    }

    /// Absolute frame position (index of the next frame to read).
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Count of frames processed so far.
    pub fn coarse_index(&self) -> u32 {
        self.coarse_index
    }

    pub fn frame_count(&self) -> usize {
        self.length
    }

    pub fn fps(&self) -> f64 {
        self.source.fps()
    }

    /// Read the next coarse frame, or `None` once the footage is exhausted.
    pub fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
        if self.frame_index as usize >= self.length {
            return Ok(None);
        }

        let Some(frame) = self.source.read_next()? else {
            return Ok(None);
        };

        for _ in 0..FRAMESKIP {
            if !self.source.grab_next()? {
                break;
            }
        }

        self.coarse_index += 1;
        self.frame_index += FRAMESKIP + 1;

        Ok(Some(frame))
    }

    /// Read the first frame without consuming it: the source is rewound and
    /// the reader's counters stay untouched.
    pub fn peek_first(&mut self) -> Result<Option<RgbFrame>> {
        let frame = self.source.read_next()?;
        self.source.seek_start()?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::image::GrayImage;

    /// In-memory source producing constant-value frames.
    struct StubFootage {
        frames: usize,
        cursor: usize,
    }

    impl StubFootage {
        fn new(frames: usize) -> Self {
            Self { frames, cursor: 0 }
        }
    }

    impl FootageSource for StubFootage {
        fn frame_count(&self) -> usize {
            self.frames
        }

        fn fps(&self) -> f64 {
            24.0
        }

        fn width(&self) -> u32 {
            4
        }

        fn height(&self) -> u32 {
            4
        }

        fn read_next(&mut self) -> Result<Option<RgbFrame>> {
            if self.cursor >= self.frames {
                return Ok(None);
            }
            let value = self.cursor as u8;
            self.cursor += 1;
            let gray = GrayImage::new(4, 4, vec![value; 16]);
            Ok(Some(RgbFrame::from_gray(&gray)))
        }

        fn grab_next(&mut self) -> Result<bool> {
            if self.cursor >= self.frames {
                return Ok(false);
            }
            self.cursor += 1;
            Ok(true)
        }

        fn seek_start(&mut self) -> Result<()> {
            self.cursor = 0;
            Ok(())
        }
    }

    #[test]
    fn reader_applies_frame_skip() {
        let mut source = StubFootage::new(72);
        let mut reader = FrameReader::new(&mut source);

        let mut seen = Vec::new();
        while let Some(frame) = reader.next_frame().unwrap() {
            seen.push(frame.data[0]);
        }

        // Every 8th frame: 0, 8, ..., 64.
        assert_eq!(seen, vec![0, 8, 16, 24, 32, 40, 48, 56, 64]);
        assert_eq!(reader.coarse_index(), 9);
        assert_eq!(reader.frame_index(), 72);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn peek_first_does_not_advance() {
        let mut source = StubFootage::new(16);
        let mut reader = FrameReader::new(&mut source);

        let first = reader.peek_first().unwrap().expect("first frame");
        assert_eq!(first.data[0], 0);
        assert_eq!(reader.frame_index(), 0);
        assert_eq!(reader.coarse_index(), 0);

        let again = reader.next_frame().unwrap().expect("frame 0");
        assert_eq!(again.data[0], 0);
    }

    #[test]
    fn validate_rejects_missing_and_empty_files() {
        let missing = std::env::temp_dir().join(format!(
            "slidesync_footage_missing_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        assert!(matches!(
            validate_file(&missing),
            Err(FootageError::MissingPath(_))
        ));

        let empty = std::env::temp_dir().join(format!(
            "slidesync_footage_empty_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        std::fs::write(&empty, b"").unwrap();
        let result = validate_file(&empty);
        std::fs::remove_file(&empty).ok();
        assert!(matches!(result, Err(FootageError::EmptyFile(_))));
    }
}
