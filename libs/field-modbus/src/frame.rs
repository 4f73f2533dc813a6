//! MBAP framing for Modbus TCP
//!
//! [`MbapCodec`] plugs into `tokio_util::codec::Framed` so a session reads
//! and writes whole frames through `Sink`/`Stream`.

use bytes::{BufMut, Bytes, BytesMut};
use errors::{protocol_error, FieldError, FieldResult};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN};

/// MBAP (Modbus Application Protocol) header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus
    pub protocol_id: u16,
    /// Byte count of unit id plus PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: (pdu_len + 1) as u16,
            unit_id,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
    }

    /// Parse the 7 header bytes
    pub fn decode(data: &[u8]) -> FieldResult<Self> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(protocol_error!(
                "MBAP header needs {} bytes, got {}",
                MBAP_HEADER_LEN,
                data.len()
            ));
        }

        let header = Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        };

        if header.protocol_id != 0 {
            return Err(protocol_error!("invalid protocol id: {}", header.protocol_id));
        }
        if header.length < 2 || usize::from(header.length) > MAX_MBAP_LENGTH {
            return Err(protocol_error!("invalid MBAP length: {}", header.length));
        }
        Ok(header)
    }

    /// Bytes of PDU following the header
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length).saturating_sub(1)
    }
}

/// One MBAP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbapFrame {
    pub header: MbapHeader,
    pub pdu: Bytes,
}

impl MbapFrame {
    pub fn new(transaction_id: u16, unit_id: u8, pdu: impl Into<Bytes>) -> Self {
        let pdu = pdu.into();
        Self {
            header: MbapHeader::new(transaction_id, unit_id, pdu.len()),
            pdu,
        }
    }
}

/// Length-delimited MBAP codec
#[derive(Debug, Default, Clone, Copy)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = MbapFrame;
    type Error = FieldError;

    fn decode(&mut self, src: &mut BytesMut) -> FieldResult<Option<MbapFrame>> {
        if src.len() < MBAP_HEADER_LEN {
            src.reserve(MBAP_HEADER_LEN - src.len());
            return Ok(None);
        }
        let header = MbapHeader::decode(&src[..MBAP_HEADER_LEN])?;

        let total = MBAP_HEADER_LEN + header.pdu_len();
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let pdu = frame.split_off(MBAP_HEADER_LEN).freeze();
        Ok(Some(MbapFrame { header, pdu }))
    }
}

impl Encoder<MbapFrame> for MbapCodec {
    type Error = FieldError;

    fn encode(&mut self, item: MbapFrame, dst: &mut BytesMut) -> FieldResult<()> {
        dst.reserve(MBAP_HEADER_LEN + item.pdu.len());
        item.header.encode(dst);
        dst.put_slice(&item.pdu);
        Ok(())
    }
}

/// Header plus PDU, ready for the socket
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    MbapHeader::new(transaction_id, unit_id, pdu.len()).encode(&mut buf);
    buf.put_slice(pdu);
    buf.freeze()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(0x0102, 0x11, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(
            frame.as_ref(),
            &[0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x00, 0x00, 0x01]
        );

        let header = MbapHeader::decode(&frame).unwrap();
        assert_eq!(header.transaction_id, 0x0102);
        assert_eq!(header.unit_id, 0x11);
        assert_eq!(header.pdu_len(), 5);
    }

    #[test]
    fn test_rejects_bad_headers() {
        assert!(MbapHeader::decode(&[0, 1, 0, 0, 0]).is_err());
        // protocol id 1
        assert!(MbapHeader::decode(&[0, 1, 0, 1, 0, 6, 1]).is_err());
        // length covering the unit id only
        assert!(MbapHeader::decode(&[0, 1, 0, 0, 0, 1, 1]).is_err());
        assert!(MbapHeader::decode(&[0, 1, 0, 0, 0x01, 0x00, 1]).is_err());
    }

    #[test]
    fn test_codec_waits_for_whole_frame() {
        let bytes = encode_frame(7, 1, &[0x03, 0x02, 0x00, 0x2A]);
        let mut codec = MbapCodec;
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&bytes[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[5..9]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[9..]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.transaction_id, 7);
        assert_eq!(frame.pdu.as_ref(), &[0x03, 0x02, 0x00, 0x2A]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_splits_back_to_back_frames() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(MbapFrame::new(1, 9, vec![0x05, 0x00, 0x10, 0xFF, 0x00]), &mut buf)
            .unwrap();
        codec
            .encode(MbapFrame::new(2, 9, vec![0x85, 0x02]), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.header.transaction_id, 1);
        assert_eq!(first.header.length, 6);
        assert_eq!(second, MbapFrame::new(2, 9, vec![0x85, 0x02]));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_foreign_protocol() {
        let mut buf = BytesMut::from(&[0u8, 1, 0, 7, 0, 3, 1, 3, 0][..]);
        assert!(MbapCodec.decode(&mut buf).is_err());
    }
}
