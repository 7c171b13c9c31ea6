//! In-process stream decoding through libav (`ffmpeg-next`).
//!
//! Packets are demuxed and decoded in this process, then scaled to RGB24 at
//! the configured resolution. Decoded frames are thinned to the requested
//! rate from their presentation timestamps.

use crate::frame::Frame;
use crate::source::CaptureError;
use crate::stream::{is_rtsp, pack_rows, FrameDecimator, FrameReader, StreamConnector, RTSP_SOCKET_TIMEOUT_US};
use chrono::Local;
use ffmpeg_next as ffmpeg;

/// Connector that decodes a network stream with libav.
#[derive(Debug, Clone)]
pub struct LibavStreamConnector {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

impl LibavStreamConnector {
    pub fn new(url: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            url: url.into(),
            width,
            height,
        }
    }

    fn open_options(&self) -> ffmpeg::Dictionary<'static> {
        let mut options = ffmpeg::Dictionary::new();
        if is_rtsp(&self.url) {
            options.set("rtsp_transport", "tcp");
            options.set("timeout", RTSP_SOCKET_TIMEOUT_US);
        }
        options
    }
}

fn unavailable(what: &str, e: ffmpeg::Error) -> CaptureError {
    CaptureError::StreamUnavailable(format!("{what}: {e}"))
}

impl StreamConnector for LibavStreamConnector {
    fn connect(&self, fps: u32) -> Result<Box<dyn FrameReader>, CaptureError> {
        ffmpeg::init().map_err(|e| unavailable("initialize ffmpeg", e))?;
        let input = ffmpeg::format::input_with_dictionary(&self.url, self.open_options())
            .map_err(|e| unavailable("open stream", e))?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| CaptureError::StreamUnavailable("stream has no video track".into()))?;
        let stream_index = stream.index();
        let time_base = f64::from(stream.time_base());
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|context| context.decoder().video())
            .map_err(|e| unavailable("open video decoder", e))?;

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            self.width,
            self.height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| unavailable("create scaler", e))?;

        tracing::info!(
            url = %self.url,
            source_width = decoder.width(),
            source_height = decoder.height(),
            width = self.width,
            height = self.height,
            fps,
            "stream opened (libav)"
        );

        Ok(Box::new(LibavReader {
            input,
            stream_index,
            time_base,
            decoder,
            scaler,
            decimator: FrameDecimator::new(fps),
            decoded: ffmpeg::frame::Video::empty(),
            sequence: 0,
        }))
    }
}

struct LibavReader {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    time_base: f64,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    decimator: FrameDecimator,
    decoded: ffmpeg::frame::Video,
    sequence: u64,
}

impl LibavReader {
    fn convert(&mut self) -> Result<Frame, CaptureError> {
        let mut rgb = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&self.decoded, &mut rgb)
            .map_err(|e| CaptureError::ReadFailed(format!("scale: {e}")))?;
        let pixels = pack_rows(rgb.data(0), rgb.stride(0), rgb.width(), rgb.height())
            .ok_or_else(|| CaptureError::ReadFailed("scaled frame shorter than its stride".into()))?;

        let sequence = self.sequence;
        self.sequence += 1;
        Frame::from_rgb24(pixels, rgb.width(), rgb.height(), Local::now(), sequence)
            .map_err(|e| CaptureError::ReadFailed(e.to_string()))
    }
}

impl FrameReader for LibavReader {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        loop {
            while self.decoder.receive_frame(&mut self.decoded).is_ok() {
                let at = self.decoded.timestamp().map(|pts| pts as f64 * self.time_base);
                if self.decimator.keep(at) {
                    return self.convert();
                }
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    return Err(CaptureError::StreamUnavailable("stream ended".into()));
                }
                Err(e) => return Err(CaptureError::ReadFailed(format!("read packet: {e}"))),
            }
            if packet.stream() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .map_err(|e| CaptureError::ReadFailed(format!("decode: {e}")))?;
        }
    }
}
