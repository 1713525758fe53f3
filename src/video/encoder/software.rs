//! Raw video "encoder"
//!
//! Wraps uncompressed I420/NV12 frames in a small framed container. It lets
//! the pipeline run end to end on machines without a codec library and is
//! the software fallback the binary registers.
//!
//! Frame layout (big endian):
//! ```text
//! "LPRV" | version u8 | flags u8 | format u8 | reserved u8
//! width u16 | height u16 | pts_ms u64 | payload len u32 | payload
//! ```

use bytes::{BufMut, BytesMut};

use super::traits::{
    CompressionSession, EncodedSample, EncoderFactory, EncoderStatus, SessionProperty,
    SessionSpec, VideoCodec,
};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::VideoFrame;

pub const RAW_MAGIC: &[u8; 4] = b"LPRV";
pub const RAW_VERSION: u8 = 1;
pub const RAW_HEADER_LEN: usize = 24;

const FLAG_KEYFRAME: u8 = 0x01;

fn format_tag(format: PixelFormat) -> u8 {
    match format {
        PixelFormat::Nv12 => 1,
        _ => 0,
    }
}

/// Factory for [`RawVideoSession`]
#[derive(Debug, Default)]
pub struct RawVideoEncoderFactory;

impl RawVideoEncoderFactory {
    pub fn new() -> Self {
        Self
    }
}

impl EncoderFactory for RawVideoEncoderFactory {
    fn name(&self) -> &str {
        "raw"
    }

    fn is_hardware(&self) -> bool {
        false
    }

    fn priority(&self) -> u32 {
        0
    }

    fn supports(&self, _codec: VideoCodec) -> bool {
        true
    }

    fn create(&self, spec: &SessionSpec) -> Result<Box<dyn CompressionSession>, EncoderStatus> {
        if !spec.input_format.is_encoder_native() {
            return Err(EncoderStatus::InsufficientColorData);
        }
        Ok(Box::new(RawVideoSession {
            codec: spec.codec,
            resolution: spec.resolution,
            input_format: spec.input_format,
            bitrate_kbps: 0,
        }))
    }
}

/// Pass-through session
pub struct RawVideoSession {
    codec: VideoCodec,
    resolution: Resolution,
    input_format: PixelFormat,
    bitrate_kbps: u32,
}

impl RawVideoSession {
    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate_kbps
    }
}

impl CompressionSession for RawVideoSession {
    fn name(&self) -> &str {
        "raw"
    }

    fn is_hardware(&self) -> bool {
        false
    }

    fn input_format(&self) -> PixelFormat {
        self.input_format
    }

    fn set_input_format(&mut self, format: PixelFormat) -> Result<(), EncoderStatus> {
        if !format.is_encoder_native() {
            return Err(EncoderStatus::PropertyNotSupported);
        }
        self.input_format = format;
        Ok(())
    }

    fn set_property(&mut self, property: SessionProperty) -> Result<(), EncoderStatus> {
        match property {
            SessionProperty::Bitrate(kbps) => {
                self.bitrate_kbps = kbps;
                Ok(())
            }
            // no inter-frame prediction, so nothing to reorder
            SessionProperty::FrameReordering(true) => Err(EncoderStatus::PropertyNotSupported),
            _ => Ok(()),
        }
    }

    fn encode(
        &mut self,
        frame: &VideoFrame,
        pts_ms: u64,
        _force_keyframe: bool,
    ) -> Result<Option<EncodedSample>, EncoderStatus> {
        if frame.resolution != self.resolution {
            return Err(EncoderStatus::Other(-1));
        }
        if frame.format != self.input_format {
            return Err(EncoderStatus::PixelTransferFailed);
        }

        let payload = frame.data();
        let mut buf = BytesMut::with_capacity(RAW_HEADER_LEN + payload.len());
        buf.put_slice(RAW_MAGIC);
        buf.put_u8(RAW_VERSION);
        buf.put_u8(FLAG_KEYFRAME);
        buf.put_u8(format_tag(self.input_format));
        buf.put_u8(0);
        buf.put_u16(self.resolution.width as u16);
        buf.put_u16(self.resolution.height as u16);
        buf.put_u64(pts_ms);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);

        Ok(Some(EncodedSample {
            data: buf.freeze(),
            codec: self.codec,
            resolution: self.resolution,
            key_frame: true,
            sequence: frame.sequence,
            pts_ms,
            capture_ts: frame.capture_ts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::HardwareRequirement;

    fn spec(format: PixelFormat) -> SessionSpec {
        SessionSpec {
            codec: VideoCodec::H264,
            resolution: Resolution::new(160, 128),
            input_format: format,
            hardware: HardwareRequirement::SoftwareOnly,
            pinned_encoder: None,
        }
    }

    #[test]
    fn test_encode_frames_payload() {
        let mut session = RawVideoEncoderFactory::new()
            .create(&spec(PixelFormat::Yuv420))
            .unwrap();
        let res = Resolution::new(160, 128);
        let frame = VideoFrame::from_vec(
            vec![3u8; PixelFormat::Yuv420.frame_size(res)],
            res,
            PixelFormat::Yuv420,
            42,
        );
        let sample = session.encode(&frame, 1400, false).unwrap().unwrap();
        assert_eq!(&sample.data[..4], RAW_MAGIC);
        assert_eq!(sample.len(), RAW_HEADER_LEN + frame.len());
        assert_eq!(u64::from_be_bytes(sample.data[12..20].try_into().unwrap()), 1400);
        assert!(sample.key_frame);
        assert_eq!(sample.sequence, 42);
    }

    #[test]
    fn test_format_mismatch_is_pixel_transfer_failure() {
        let mut session = RawVideoEncoderFactory::new()
            .create(&spec(PixelFormat::Nv12))
            .unwrap();
        let res = Resolution::new(160, 128);
        let frame = VideoFrame::from_vec(
            vec![0u8; PixelFormat::Yuv420.frame_size(res)],
            res,
            PixelFormat::Yuv420,
            0,
        );
        assert_eq!(
            session.encode(&frame, 0, false).unwrap_err(),
            EncoderStatus::PixelTransferFailed
        );
    }

    #[test]
    fn test_rejects_reordering_and_non_native_input() {
        let mut session = RawVideoEncoderFactory::new()
            .create(&spec(PixelFormat::Yuv420))
            .unwrap();
        assert_eq!(
            session.set_property(SessionProperty::FrameReordering(true)),
            Err(EncoderStatus::PropertyNotSupported)
        );
        assert!(session.set_property(SessionProperty::FrameReordering(false)).is_ok());
        assert!(RawVideoEncoderFactory::new()
            .create(&spec(PixelFormat::Bgra))
            .is_err());
    }
}
