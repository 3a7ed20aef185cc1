//! Frame codec interface (external collaborator, consumed not implemented).
//!
//! The JPEG/H.264 decode itself — and any video transcoding — lives
//! outside this crate. Callers supply a [`FrameFactory`] implementation;
//! the video formatter only ever calls it with a raw body and a decoded
//! header tuple.

use bytes::Bytes;

/// `format_code` value for an MJPEG video frame.
pub const VIDEO_FRAME_FORMAT_MJPEG: u32 = 0x10;
/// `format_code` value for an H.264 video frame. Reserved by the codec
/// module; the core only special-cases MJPEG and treats every other
/// recognized code as H.264 via [`FrameFactory::create_h264_frame`].
pub const VIDEO_FRAME_FORMAT_H264: u32 = 0x20;

/// Decoded video header, common to both wire-format versions after
/// timestamp normalization to microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoHeader {
    pub format_code: u32,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub timestamp_us: f64,
    pub data_len: u32,
    pub reserved: u32,
}

#[derive(Debug, Clone)]
pub struct JpegFrame {
    pub header: VideoHeader,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct H264Frame {
    pub header: VideoHeader,
    pub data: Bytes,
}

/// A consumed collaborator that turns raw video bodies into decoded frames.
///
/// Both methods return `None` rather than erroring: a `None` JPEG frame
/// means "nothing usable in this body"; a `None` H.264 frame means "not a
/// keyframe and no reference available yet", which the video formatter
/// treats as "reuse the last good frame", never as a hard error.
pub trait FrameFactory {
    fn create_jpeg_frame(&mut self, body: &Bytes, header: VideoHeader) -> Option<JpegFrame>;
    fn create_h264_frame(&mut self, body: &Bytes, header: VideoHeader) -> Option<H264Frame>;
}
