//! Wire format of the TCP publish transport
//!
//! Messages travel in variable-length frames:
//! - Length <= 0x3F (63): 1-byte header, format `(len << 2)`
//! - Length <= 0x3FFF (16383): 2-byte LE header, format `(len << 2) | 0x1`
//! - Length <= 0x3FFFFF (4194303): 3-byte LE header, format `(len << 2) | 0x2`
//! - Length <= 0x3FFFFFFF (1073741823): 4-byte LE header, format `(len << 2) | 0x3`
//!
//! The low 2 bits of the first byte give the header length minus one. The
//! first body byte is the message tag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::video::encoder::VideoCodec;

/// Maximum frame body length (1GB)
const MAX_FRAME_LENGTH: usize = 0x3FFFFFFF;

const TAG_HELLO: u8 = 0x01;
const TAG_PUBLISH: u8 = 0x02;
const TAG_SAMPLE: u8 = 0x03;
const TAG_CLOSE: u8 = 0x04;
const TAG_ACCEPTED: u8 = 0x80;
const TAG_REJECTED: u8 = 0x81;
const TAG_UNPUBLISHED: u8 = 0x82;

/// Fixed part of a sample message after the tag
const SAMPLE_HEADER_LEN: usize = 1 + 1 + 2 + 2 + 8 + 8;

/// Protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client: open an application on the server
    Hello { app: String },
    /// Client: start publishing under a stream key
    Publish { key: String },
    /// Client: one encoded sample
    Sample {
        key_frame: bool,
        codec: VideoCodec,
        width: u16,
        height: u16,
        pts_ms: u64,
        sequence: u64,
        payload: Bytes,
    },
    /// Client: going away
    Close,
    /// Server: last request accepted
    Accepted,
    /// Server: last request refused
    Rejected { reason: String },
    /// Server: publish session ended on the server side
    Unpublished,
}

impl Message {
    fn body_len(&self) -> usize {
        1 + match self {
            Message::Hello { app } => app.len(),
            Message::Publish { key } => key.len(),
            Message::Rejected { reason } => reason.len(),
            Message::Sample { payload, .. } => SAMPLE_HEADER_LEN + payload.len(),
            Message::Close | Message::Accepted | Message::Unpublished => 0,
        }
    }

    fn put_body(&self, buf: &mut BytesMut) {
        match self {
            Message::Hello { app } => {
                buf.put_u8(TAG_HELLO);
                buf.put_slice(app.as_bytes());
            }
            Message::Publish { key } => {
                buf.put_u8(TAG_PUBLISH);
                buf.put_slice(key.as_bytes());
            }
            Message::Sample {
                key_frame,
                codec,
                width,
                height,
                pts_ms,
                sequence,
                payload,
            } => {
                buf.put_u8(TAG_SAMPLE);
                buf.put_u8(u8::from(*key_frame));
                buf.put_u8(codec_tag(*codec));
                buf.put_u16_le(*width);
                buf.put_u16_le(*height);
                buf.put_u64_le(*pts_ms);
                buf.put_u64_le(*sequence);
                buf.put_slice(payload);
            }
            Message::Close => buf.put_u8(TAG_CLOSE),
            Message::Accepted => buf.put_u8(TAG_ACCEPTED),
            Message::Rejected { reason } => {
                buf.put_u8(TAG_REJECTED);
                buf.put_slice(reason.as_bytes());
            }
            Message::Unpublished => buf.put_u8(TAG_UNPUBLISHED),
        }
    }

    /// Append the framed message to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> io::Result<()> {
        let len = self.body_len();
        buf.reserve(4 + len);
        put_header(len, buf)?;
        self.put_body(buf);
        Ok(())
    }

    /// Parse a frame body
    pub fn decode(mut body: BytesMut) -> io::Result<Message> {
        if body.is_empty() {
            return Err(invalid("empty message"));
        }
        let tag = body.get_u8();
        let message = match tag {
            TAG_HELLO => Message::Hello {
                app: utf8(body)?,
            },
            TAG_PUBLISH => Message::Publish { key: utf8(body)? },
            TAG_SAMPLE => {
                if body.len() < SAMPLE_HEADER_LEN {
                    return Err(invalid("truncated sample header"));
                }
                let key_frame = body.get_u8() != 0;
                let codec = codec_from_tag(body.get_u8())?;
                let width = body.get_u16_le();
                let height = body.get_u16_le();
                let pts_ms = body.get_u64_le();
                let sequence = body.get_u64_le();
                Message::Sample {
                    key_frame,
                    codec,
                    width,
                    height,
                    pts_ms,
                    sequence,
                    payload: body.freeze(),
                }
            }
            TAG_CLOSE => Message::Close,
            TAG_ACCEPTED => Message::Accepted,
            TAG_REJECTED => Message::Rejected {
                reason: utf8(body)?,
            },
            TAG_UNPUBLISHED => Message::Unpublished,
            other => return Err(invalid(&format!("unknown message tag 0x{:02x}", other))),
        };
        Ok(message)
    }
}

fn put_header(len: usize, buf: &mut BytesMut) -> io::Result<()> {
    if len <= 0x3F {
        buf.put_u8((len << 2) as u8);
    } else if len <= 0x3FFF {
        buf.put_u16_le(((len << 2) as u16) | 0x1);
    } else if len <= 0x3FFFFF {
        let h = ((len << 2) as u32) | 0x2;
        buf.put_u8((h & 0xFF) as u8);
        buf.put_u8(((h >> 8) & 0xFF) as u8);
        buf.put_u8(((h >> 16) & 0xFF) as u8);
    } else if len <= MAX_FRAME_LENGTH {
        buf.put_u32_le(((len << 2) as u32) | 0x3);
    } else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Message too large",
        ));
    }
    Ok(())
}

fn codec_tag(codec: VideoCodec) -> u8 {
    match codec {
        VideoCodec::H264 => 0,
        VideoCodec::H265 => 1,
    }
}

fn codec_from_tag(tag: u8) -> io::Result<VideoCodec> {
    match tag {
        0 => Ok(VideoCodec::H264),
        1 => Ok(VideoCodec::H265),
        other => Err(invalid(&format!("unknown codec tag {}", other))),
    }
}

fn utf8(body: BytesMut) -> io::Result<String> {
    String::from_utf8(body.to_vec()).map_err(|_| invalid("string is not valid UTF-8"))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Read a single frame body
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<BytesMut> {
    let mut first_byte = [0u8; 1];
    reader.read_exact(&mut first_byte).await?;

    let head_len = ((first_byte[0] & 0x3) + 1) as usize;
    let mut header_rest = [0u8; 3];
    if head_len > 1 {
        reader.read_exact(&mut header_rest[..head_len - 1]).await?;
    }

    let mut n = first_byte[0] as usize;
    for (i, byte) in header_rest[..head_len - 1].iter().enumerate() {
        n |= (*byte as usize) << (8 * (i + 1));
    }
    let msg_len = n >> 2;
    if msg_len > MAX_FRAME_LENGTH {
        return Err(invalid("Message too large"));
    }

    let mut buf = BytesMut::zeroed(msg_len);
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read and parse one message
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Message> {
    Message::decode(read_frame(reader).await?)
}

/// Write one message, reusing `buf` between calls
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
    buf: &mut BytesMut,
) -> io::Result<()> {
    buf.clear();
    message.encode_into(buf)?;
    writer.write_all(buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        for (len, header) in [(0usize, 1usize), (62, 1), (63, 2), (16_382, 2), (16_383, 3)] {
            let msg = Message::Hello {
                app: "a".repeat(len),
            };
            let mut buf = BytesMut::new();
            msg.encode_into(&mut buf).unwrap();
            // body = tag + app
            assert_eq!(buf.len(), header + len + 1, "app len {}", len);
        }
    }

    #[tokio::test]
    async fn test_sample_over_stream() {
        let sample = Message::Sample {
            key_frame: true,
            codec: VideoCodec::H265,
            width: 1280,
            height: 720,
            pts_ms: 33,
            sequence: 7,
            payload: Bytes::from(vec![9u8; 70_000]),
        };
        let (mut client, mut server) = tokio::io::duplex(1 << 20);
        let mut buf = BytesMut::new();
        write_message(&mut client, &sample, &mut buf).await.unwrap();
        write_message(&mut client, &Message::Close, &mut buf)
            .await
            .unwrap();

        assert_eq!(read_message(&mut server).await.unwrap(), sample);
        assert_eq!(read_message(&mut server).await.unwrap(), Message::Close);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Message::decode(BytesMut::new()).is_err());
        assert!(Message::decode(BytesMut::from(&[0x7Fu8][..])).is_err());
        // sample header cut short
        assert!(Message::decode(BytesMut::from(&[TAG_SAMPLE, 1, 0][..])).is_err());
    }
}
