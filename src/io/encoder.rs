//! Video output: streaming H.264/MP4 encoder.
//!
//! The sink is deliberately narrow: push a frame, repeat the last frame,
//! close. The generator loop drives it one instruction gap at a time, so
//! the encoder only ever needs to remember a single frame.

use std::path::{Path, PathBuf};

use thiserror::Error;

use ffmpeg_next as ffmpeg;

use ffmpeg::codec;
use ffmpeg::format;
use ffmpeg::software::scaling::{context::Context as ScalingContext, flag::Flags as ScalingFlags};
use ffmpeg::util::format::pixel::Pixel;
use ffmpeg::util::frame;
use ffmpeg::util::rational::Rational;

use crate::io::image::RgbFrame;

/// Target bit rate of the synthesized video.
const BIT_RATE: usize = 2 * 1024 * 1024;

/// Keyframe interval. Slide videos compress extremely well, so a short GOP
/// keeps seeking snappy without hurting the file size much.
const GOP_SIZE: u32 = 18;

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("invalid output path: {0}")]
    InvalidPath(PathBuf),
    #[error("failed to initialize ffmpeg: {0}")]
    InitFailed(String),
    #[error("no H.264 encoder available")]
    CodecMissing,
    #[error("framerate must be nonzero")]
    ZeroFramerate,
    #[error("failed to open output {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("failed to configure encoder: {0}")]
    Configure(String),
    #[error("frame is {got_width}x{got_height}, encoder expects {width}x{height}")]
    FrameSize {
        got_width: u32,
        got_height: u32,
        width: u32,
        height: u32,
    },
    #[error("no frame written yet, nothing to repeat")]
    NothingToRepeat,
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("failed to finalize output: {0}")]
    Finalize(String),
}

pub type Result<T> = std::result::Result<T, EncoderError>;

/// Streaming frame sink the generator writes into.
pub trait FrameSink {
    /// Encode exactly one frame.
    fn write(&mut self, frame: &RgbFrame) -> Result<()>;
    /// Re-encode the last written frame `count` more times.
    fn repeat(&mut self, count: u32) -> Result<()>;
    /// Drain the encoder and finalize the container.
    fn close(&mut self) -> Result<()>;
}

/// H.264/MP4 encoder over ffmpeg.
pub struct FfmpegEncoder {
    output: format::context::Output,
    encoder: ffmpeg::encoder::video::Encoder,
    scaler: ScalingContext,
    time_base: Rational,
    last: Option<frame::Video>,
    pts: i64,
    width: u32,
    height: u32,
    open: bool,
}

impl FfmpegEncoder {
    pub fn open<P: AsRef<Path>>(path: P, width: u32, height: u32, fps: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if fps == 0 {
            return Err(EncoderError::ZeroFramerate);
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| EncoderError::InvalidPath(path.clone()))?;

        ffmpeg::init().map_err(|err| EncoderError::InitFailed(err.to_string()))?;

        let mut output = format::output(&path_str).map_err(|err| EncoderError::Open {
            path: path.clone(),
            reason: err.to_string(),
        })?;

        let codec = ffmpeg::encoder::find(codec::Id::H264).ok_or(EncoderError::CodecMissing)?;
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);

        let mut stream = output
            .add_stream(codec)
            .map_err(|err| EncoderError::Configure(err.to_string()))?;

        let mut video = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|err| EncoderError::Configure(err.to_string()))?;

        let time_base = Rational::new(1, fps as i32);
        video.set_width(width);
        video.set_height(height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base(time_base);
        video.set_frame_rate(Some(Rational::new(fps as i32, 1)));
        video.set_bit_rate(BIT_RATE);
        video.set_gop(GOP_SIZE);
        if global_header {
            video.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let encoder = video
            .open_as(codec)
            .map_err(|err| EncoderError::Configure(err.to_string()))?;
        stream.set_parameters(&encoder);
        stream.set_time_base(time_base);

        output
            .write_header()
            .map_err(|err| EncoderError::Configure(err.to_string()))?;

        let scaler = ScalingContext::get(
            Pixel::RGB24,
            width,
            height,
            Pixel::YUV420P,
            width,
            height,
            ScalingFlags::BILINEAR,
        )
        .map_err(|err| EncoderError::Configure(err.to_string()))?;

        Ok(Self {
            output,
            encoder,
            scaler,
            time_base,
            last: None,
            pts: 0,
            width,
            height,
            open: true,
        })
    }

    fn encode_current(&mut self) -> Result<()> {
        let frame = self.last.as_mut().ok_or(EncoderError::NothingToRepeat)?;
        frame.set_pts(Some(self.pts));
        self.encoder
            .send_frame(frame)
            .map_err(|err| EncoderError::Encode(err.to_string()))?;
        self.pts += 1;
        self.drain_packets()
    }

    fn drain_packets(&mut self) -> Result<()> {
        let stream_time_base = self
            .output
            .stream(0)
            .map(|s| s.time_base())
            .unwrap_or(self.time_base);

        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(0);
            packet.rescale_ts(self.time_base, stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .map_err(|err| EncoderError::Encode(err.to_string()))?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.encoder
            .send_eof()
            .map_err(|err| EncoderError::Encode(err.to_string()))?;
        self.drain_packets()?;
        self.output
            .write_trailer()
            .map_err(|err| EncoderError::Finalize(err.to_string()))?;
        self.open = false;
        Ok(())
    }
}

impl FrameSink for FfmpegEncoder {
    fn write(&mut self, frame: &RgbFrame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            return Err(EncoderError::FrameSize {
                got_width: frame.width,
                got_height: frame.height,
                width: self.width,
                height: self.height,
            });
        }

        let mut rgb = frame::Video::new(Pixel::RGB24, self.width, self.height);
        let stride = rgb.stride(0);
        let row_bytes = self.width as usize * 3;
        {
            let dst = rgb.data_mut(0);
            for y in 0..self.height as usize {
                dst[y * stride..y * stride + row_bytes]
                    .copy_from_slice(&frame.data[y * row_bytes..(y + 1) * row_bytes]);
            }
        }

        let mut yuv = frame::Video::new(Pixel::YUV420P, self.width, self.height);
        self.scaler
            .run(&rgb, &mut yuv)
            .map_err(|err| EncoderError::Encode(err.to_string()))?;

        self.last = Some(yuv);
        self.encode_current()
    }

    fn repeat(&mut self, count: u32) -> Result<()> {
        for _ in 0..count {
            self.encode_current()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.finalize()
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        // Best effort: an encoder dropped mid-stream still writes a trailer
        // so the container is playable up to the failure point.
        let _ = self.finalize();
    }
}
