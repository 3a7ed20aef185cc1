//! Versioned binary formatter registry: decodes a [`DataMessage`] into a
//! strongly typed value per sensor kind, dispatched by wire-format version.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};
use crate::format::WireFormatVersion;
use crate::frame::{FrameFactory, VideoHeader, VIDEO_FRAME_FORMAT_H264, VIDEO_FRAME_FORMAT_MJPEG};
use crate::wire::DataMessage;

const NANO: f64 = 1e-9;

#[derive(Debug, Clone)]
pub enum VideoValue {
    Jpeg(crate::frame::JpegFrame),
    H264(crate::frame::H264Frame),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GazeValue {
    pub x: f32,
    pub y: f32,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuValue {
    pub timestamp: f64,
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnotateValue {
    pub key: u8,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventValue {
    pub timestamp: f64,
    pub label: String,
}

fn parse_video_header(version: WireFormatVersion, header: &[u8]) -> Result<VideoHeader> {
    if header.len() < 32 {
        return Err(Error::Malformed("video header shorter than 32 bytes"));
    }
    let mut c = Cursor::new(header);
    let format_code = c.read_u32::<LittleEndian>()?;
    let width = c.read_u32::<LittleEndian>()?;
    let height = c.read_u32::<LittleEndian>()?;
    let sequence = c.read_u32::<LittleEndian>()?;
    let timestamp_us = match version {
        WireFormatVersion::V3 => c.read_f64::<LittleEndian>()? * 1e6,
        WireFormatVersion::V4 => c.read_u64::<LittleEndian>()? as f64 / 1e3,
    };
    let data_len = c.read_u32::<LittleEndian>()?;
    let reserved = c.read_u32::<LittleEndian>()?;
    Ok(VideoHeader {
        format_code,
        width,
        height,
        sequence,
        timestamp_us,
        data_len,
        reserved,
    })
}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::Malformed("buffer too short for fixed layout")
    }
}

/// Video formatter. Stateful: remembers the most recent successfully
/// constructed H.264 frame so that a codec `None` (non-keyframe without a
/// prior reference) can be papered over by reusing it.
pub struct VideoFormatter {
    version: WireFormatVersion,
    frame_factory: Box<dyn FrameFactory>,
    newest_h264: Option<crate::frame::H264Frame>,
}

impl VideoFormatter {
    pub fn new(version: WireFormatVersion, frame_factory: Box<dyn FrameFactory>) -> Self {
        Self {
            version,
            frame_factory,
            newest_h264: None,
        }
    }

    /// Drop the cached H.264 reference frame. Tied to session resubscription.
    pub fn reset(&mut self) {
        self.newest_h264 = None;
    }

    pub fn decode(&mut self, msg: &DataMessage) -> Result<Vec<VideoValue>> {
        let header = parse_video_header(self.version, &msg.header)?;
        match header.format_code {
            VIDEO_FRAME_FORMAT_MJPEG => Ok(self
                .frame_factory
                .create_jpeg_frame(&msg.body, header)
                .into_iter()
                .map(VideoValue::Jpeg)
                .collect()),
            VIDEO_FRAME_FORMAT_H264 => {
                let frame = self.frame_factory.create_h264_frame(&msg.body, header);
                if frame.is_some() {
                    self.newest_h264 = frame;
                }
                Ok(self
                    .newest_h264
                    .clone()
                    .into_iter()
                    .map(VideoValue::H264)
                    .collect())
            }
            other => Err(Error::Stream(format!(
                "frame was not of format MJPEG or H264 (format_code={other:#x})"
            ))),
        }
    }
}

fn decode_gaze_v4(msg: &DataMessage) -> Result<Vec<GazeValue>> {
    if msg.header.len() < 8 {
        return Err(Error::Malformed("gaze header shorter than 8 bytes"));
    }
    if msg.body.len() < 8 {
        return Err(Error::Malformed("gaze body shorter than 8 bytes"));
    }
    let ts_ns = Cursor::new(&msg.header[..8]).read_u64::<LittleEndian>()?;
    let mut body = Cursor::new(&msg.body[..8]);
    let x = body.read_f32::<LittleEndian>()?;
    let y = body.read_f32::<LittleEndian>()?;
    Ok(vec![GazeValue {
        x,
        y,
        timestamp: ts_ns as f64 * NANO,
    }])
}

/// Gaze formatter. V3 has no decoder in the reference implementation and
/// is modeled as an explicit unsupported sentinel rather than guessed.
pub enum GazeFormatter {
    Supported,
    Unsupported,
}

impl GazeFormatter {
    pub fn for_version(version: WireFormatVersion) -> Self {
        match version {
            WireFormatVersion::V3 => GazeFormatter::Unsupported,
            WireFormatVersion::V4 => GazeFormatter::Supported,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, GazeFormatter::Unsupported)
    }

    pub fn decode(&self, msg: &DataMessage) -> Result<Vec<GazeValue>> {
        match self {
            GazeFormatter::Supported => decode_gaze_v4(msg),
            GazeFormatter::Unsupported => Err(Error::UnsupportedFormat),
        }
    }
}

const IMU_RECORD_SIZE: usize = 32;

fn decode_imu_records(version: WireFormatVersion, body: &[u8]) -> Result<Vec<ImuValue>> {
    if body.len() % IMU_RECORD_SIZE != 0 {
        return Err(Error::Malformed(
            "imu body length is not a multiple of the record size",
        ));
    }
    let mut out = Vec::with_capacity(body.len() / IMU_RECORD_SIZE);
    for chunk in body.chunks_exact(IMU_RECORD_SIZE) {
        let mut c = Cursor::new(chunk);
        let timestamp = match version {
            WireFormatVersion::V3 => c.read_f64::<LittleEndian>()?,
            WireFormatVersion::V4 => c.read_u64::<LittleEndian>()? as f64 * NANO,
        };
        let accel_x = c.read_f32::<LittleEndian>()? as f64;
        let accel_y = c.read_f32::<LittleEndian>()? as f64;
        let accel_z = c.read_f32::<LittleEndian>()? as f64;
        let gyro_x = c.read_f32::<LittleEndian>()? as f64;
        let gyro_y = c.read_f32::<LittleEndian>()? as f64;
        let gyro_z = c.read_f32::<LittleEndian>()? as f64;
        out.push(ImuValue {
            timestamp,
            accel_x,
            accel_y,
            accel_z,
            gyro_x,
            gyro_y,
            gyro_z,
        });
    }
    Ok(out)
}

pub struct ImuFormatter {
    version: WireFormatVersion,
}

impl ImuFormatter {
    pub fn for_version(version: WireFormatVersion) -> Self {
        Self { version }
    }

    pub fn decode(&self, msg: &DataMessage) -> Result<Vec<ImuValue>> {
        decode_imu_records(self.version, &msg.body)
    }
}

fn decode_annotate(version: WireFormatVersion, header: &[u8]) -> Result<Vec<AnnotateValue>> {
    if header.is_empty() {
        return Err(Error::Malformed("annotate header is empty"));
    }
    let mut c = Cursor::new(header);
    let key = c.read_u8()?;
    let timestamp = match version {
        WireFormatVersion::V3 => c.read_f64::<LittleEndian>()?,
        WireFormatVersion::V4 => c.read_u64::<LittleEndian>()? as f64 * NANO,
    };
    Ok(vec![AnnotateValue { key, timestamp }])
}

/// Annotate formatter. Not fully NDSI-conformant (see the empty-prefix
/// subscription quirk on [`crate::sensor::AnnotateSensor`]); both versions
/// are supported, so unlike gaze/event there is no unsupported sentinel.
pub struct AnnotateFormatter {
    version: WireFormatVersion,
}

impl AnnotateFormatter {
    pub fn for_version(version: WireFormatVersion) -> Self {
        Self { version }
    }

    pub fn decode(&self, msg: &DataMessage) -> Result<Vec<AnnotateValue>> {
        decode_annotate(self.version, &msg.header)
    }
}

fn decode_event_v4(msg: &DataMessage) -> Result<Vec<EventValue>> {
    if msg.header.len() < 16 {
        return Err(Error::Malformed("event header shorter than 16 bytes"));
    }
    let mut c = Cursor::new(&msg.header[..16]);
    let ts_ns = c.read_i64::<LittleEndian>()?;
    let body_length = c.read_u32::<LittleEndian>()? as usize;
    let encoding_code = c.read_u32::<LittleEndian>()?;
    if body_length > msg.body.len() {
        return Err(Error::Malformed("event body shorter than body_length"));
    }
    let label = match encoding_code {
        0 => String::from_utf8(msg.body[..body_length].to_vec())
            .map_err(|_| Error::Stream("event body was not valid utf-8".to_string()))?,
        other => {
            return Err(Error::Stream(format!(
                "unknown event encoding code {other}"
            )))
        }
    };
    Ok(vec![EventValue {
        timestamp: ts_ns as f64 * NANO,
        label,
    }])
}

/// Event formatter. V3 has no decoder in the reference implementation.
pub enum EventFormatter {
    Supported,
    Unsupported,
}

impl EventFormatter {
    pub fn for_version(version: WireFormatVersion) -> Self {
        match version {
            WireFormatVersion::V3 => EventFormatter::Unsupported,
            WireFormatVersion::V4 => EventFormatter::Supported,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, EventFormatter::Unsupported)
    }

    pub fn decode(&self, msg: &DataMessage) -> Result<Vec<EventValue>> {
        match self {
            EventFormatter::Supported => decode_event_v4(msg),
            EventFormatter::Unsupported => Err(Error::UnsupportedFormat),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn msg(header: &[u8], body: &[u8]) -> DataMessage {
        DataMessage {
            sensor_uuid: "sensor".to_string(),
            header: Bytes::copy_from_slice(header),
            body: Bytes::copy_from_slice(body),
        }
    }

    #[test]
    fn gaze_v4_decode_matches_reference_vector() {
        let header = [0x08, 0xCD, 0x9D, 0xC4, 0xC2, 0x37, 0xB6, 0x15];
        let body = [0x2A, 0x0B, 0x0D, 0x44, 0x5C, 0x91, 0x07, 0x44];
        let values = decode_gaze_v4(&msg(&header, &body)).unwrap();
        assert_eq!(values.len(), 1);
        let v = values[0];
        assert!((v.x - 564.17444).abs() < 1e-2);
        assert!((v.y - 542.27124).abs() < 1e-2);
        assert!((v.timestamp - 1564499230.2196853).abs() < 1e-3);
    }

    #[test]
    fn gaze_v3_is_unsupported() {
        let f = GazeFormatter::for_version(WireFormatVersion::V3);
        assert!(f.is_unsupported());
        assert!(matches!(
            f.decode(&msg(&[0; 8], &[0; 8])),
            Err(Error::UnsupportedFormat)
        ));
    }

    #[test]
    fn event_v3_is_unsupported() {
        let f = EventFormatter::for_version(WireFormatVersion::V3);
        assert!(f.is_unsupported());
    }

    #[test]
    fn imu_v4_decodes_n_records() {
        let mut body = Vec::new();
        for i in 0..5u64 {
            body.extend_from_slice(&(i * 1_000_000_000).to_le_bytes());
            for v in [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0] {
                body.extend_from_slice(&v.to_le_bytes());
            }
        }
        let values = decode_imu_records(WireFormatVersion::V4, &body).unwrap();
        assert_eq!(values.len(), 5);
        assert!((values[3].timestamp - 3.0).abs() < 1e-9);
        assert_eq!(values[0].accel_x, 1.0);
        assert_eq!(values[0].gyro_z, 6.0);
    }

    #[test]
    fn imu_body_not_multiple_of_record_size_is_malformed() {
        let body = vec![0u8; 33];
        assert!(matches!(
            decode_imu_records(WireFormatVersion::V3, &body),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn annotate_v4_decodes_header() {
        let mut header = vec![7u8];
        header.extend_from_slice(&2_000_000_000u64.to_le_bytes());
        let values = decode_annotate(WireFormatVersion::V4, &header).unwrap();
        assert_eq!(values[0].key, 7);
        assert!((values[0].timestamp - 2.0).abs() < 1e-9);
    }

    #[test]
    fn event_unknown_encoding_is_stream_error() {
        let mut header = Vec::new();
        header.extend_from_slice(&0i64.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&99u32.to_le_bytes());
        let err = decode_event_v4(&msg(&header, &[])).unwrap_err();
        assert!(matches!(err, Error::Stream(_)));
    }

    #[test]
    fn event_v4_decodes_utf8_label() {
        let label = b"hello";
        let mut header = Vec::new();
        header.extend_from_slice(&123_000_000_000i64.to_le_bytes());
        header.extend_from_slice(&(label.len() as u32).to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        let values = decode_event_v4(&msg(&header, label)).unwrap();
        assert_eq!(values[0].label, "hello");
        assert!((values[0].timestamp - 123.0).abs() < 1e-9);
    }

    struct StubFrameFactory {
        jpeg_calls: u32,
        h264_script: Vec<bool>,
    }

    impl FrameFactory for StubFrameFactory {
        fn create_jpeg_frame(
            &mut self,
            body: &Bytes,
            header: VideoHeader,
        ) -> Option<crate::frame::JpegFrame> {
            self.jpeg_calls += 1;
            Some(crate::frame::JpegFrame {
                header,
                data: body.clone(),
            })
        }

        fn create_h264_frame(
            &mut self,
            body: &Bytes,
            header: VideoHeader,
        ) -> Option<crate::frame::H264Frame> {
            if self.h264_script.remove(0) {
                Some(crate::frame::H264Frame {
                    header,
                    data: body.clone(),
                })
            } else {
                None
            }
        }
    }

    fn video_header_bytes(format_code: u32, sequence: u32) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(&format_code.to_le_bytes());
        h.extend_from_slice(&0u32.to_le_bytes()); // width
        h.extend_from_slice(&0u32.to_le_bytes()); // height
        h.extend_from_slice(&sequence.to_le_bytes());
        h.extend_from_slice(&0u64.to_le_bytes()); // timestamp_ns
        h.extend_from_slice(&0u32.to_le_bytes()); // data_len
        h.extend_from_slice(&0u32.to_le_bytes()); // reserved
        h
    }

    #[test]
    fn video_h264_cache_reuses_last_good_frame() {
        let factory = StubFrameFactory {
            jpeg_calls: 0,
            h264_script: vec![true, false, true],
        };
        let mut fmt = VideoFormatter::new(WireFormatVersion::V4, Box::new(factory));

        let k0 = fmt
            .decode(&msg(&video_header_bytes(VIDEO_FRAME_FORMAT_H264, 0), b"k0"))
            .unwrap();
        let d1 = fmt
            .decode(&msg(&video_header_bytes(VIDEO_FRAME_FORMAT_H264, 1), b"d1"))
            .unwrap();
        let d2 = fmt
            .decode(&msg(&video_header_bytes(VIDEO_FRAME_FORMAT_H264, 2), b"f2"))
            .unwrap();

        let body_of = |v: &[VideoValue]| match &v[0] {
            VideoValue::H264(f) => f.data.clone(),
            _ => panic!("expected h264"),
        };
        assert_eq!(body_of(&k0), Bytes::from_static(b"k0"));
        assert_eq!(body_of(&d1), Bytes::from_static(b"k0"));
        assert_eq!(body_of(&d2), Bytes::from_static(b"f2"));
    }

    #[test]
    fn video_unknown_format_code_is_stream_error() {
        let factory = StubFrameFactory {
            jpeg_calls: 0,
            h264_script: vec![],
        };
        let mut fmt = VideoFormatter::new(WireFormatVersion::V3, Box::new(factory));
        let header = video_header_bytes(0xFF, 0);
        let err = fmt.decode(&msg(&header, b"")).unwrap_err();
        assert!(matches!(err, Error::Stream(_)));
    }

    #[test]
    fn video_header_too_short_is_malformed() {
        let factory = StubFrameFactory {
            jpeg_calls: 0,
            h264_script: vec![],
        };
        let mut fmt = VideoFormatter::new(WireFormatVersion::V4, Box::new(factory));
        let err = fmt.decode(&msg(&[0u8; 4], b"")).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }
}
