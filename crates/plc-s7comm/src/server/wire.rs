//! ISO-on-TCP and S7 frame codecs.
//!
//! Only what the server core needs: TPKT framing, COTP connection setup
//! and data transfer, and the S7 job/ack-data headers with the S7ANY item
//! addressing used by read-var and write-var.

use thiserror::Error;

use crate::codec::{get_u16_be, put_u16_be};

pub const TPKT_VERSION: u8 = 0x03;
pub const TPKT_HEADER_LEN: usize = 4;

pub const COTP_CONNECT_REQUEST: u8 = 0xE0;
pub const COTP_CONNECT_CONFIRM: u8 = 0xD0;
pub const COTP_DATA: u8 = 0xF0;

pub const S7_PROTOCOL_ID: u8 = 0x32;
pub const ROSCTR_JOB: u8 = 0x01;
pub const ROSCTR_ACK_DATA: u8 = 0x03;

pub const FUNC_SETUP_COMMUNICATION: u8 = 0xF0;
pub const FUNC_READ_VAR: u8 = 0x04;
pub const FUNC_WRITE_VAR: u8 = 0x05;

pub const AREA_PE: u8 = 0x81;
pub const AREA_PA: u8 = 0x82;
pub const AREA_MK: u8 = 0x83;
pub const AREA_DB: u8 = 0x84;

// Item return codes.
pub const RET_OK: u8 = 0xFF;
pub const RET_OUT_OF_RANGE: u8 = 0x05;
pub const RET_UNSUPPORTED: u8 = 0x06;
pub const RET_NO_OBJECT: u8 = 0x0A;

// Transport sizes in S7ANY item specifications.
pub const TS_BIT: u8 = 0x01;
pub const TS_BYTE: u8 = 0x02;
pub const TS_CHAR: u8 = 0x03;
pub const TS_WORD: u8 = 0x04;
pub const TS_INT: u8 = 0x05;
pub const TS_DWORD: u8 = 0x06;
pub const TS_DINT: u8 = 0x07;

// Transport sizes in data items.
pub const DATA_TS_BIT: u8 = 0x03;
pub const DATA_TS_BYTE_BITS: u8 = 0x04;
pub const DATA_TS_OCTET_STRING: u8 = 0x09;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,
    #[error("unsupported TPKT version {0:#04x}")]
    TpktVersion(u8),
    #[error("unsupported COTP PDU type {0:#04x}")]
    CotpType(u8),
    #[error("not an S7 protocol PDU (id {0:#04x})")]
    ProtocolId(u8),
    #[error("unexpected ROSCTR {0:#04x}")]
    Rosctr(u8),
    #[error("malformed item specification")]
    BadItem,
}

/// Wrap a COTP payload in a TPKT header.
pub fn tpkt_frame(payload: &[u8]) -> Vec<u8> {
    let total = payload.len() + TPKT_HEADER_LEN;
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&[TPKT_VERSION, 0x00]);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Validate a TPKT header and return the total frame length.
pub fn tpkt_total_len(header: &[u8; TPKT_HEADER_LEN]) -> Result<usize, WireError> {
    if header[0] != TPKT_VERSION {
        return Err(WireError::TpktVersion(header[0]));
    }
    let total = get_u16_be(header, 2) as usize;
    if total < TPKT_HEADER_LEN {
        return Err(WireError::Truncated);
    }
    Ok(total)
}

/// A parsed COTP PDU (the payload of one TPKT frame).
#[derive(Debug, PartialEq, Eq)]
pub enum CotpPdu<'a> {
    ConnectRequest { src_ref: u16, params: &'a [u8] },
    Data { payload: &'a [u8] },
}

pub fn parse_cotp(frame: &[u8]) -> Result<CotpPdu<'_>, WireError> {
    if frame.len() < 2 {
        return Err(WireError::Truncated);
    }
    let li = frame[0] as usize;
    match frame[1] {
        COTP_CONNECT_REQUEST => {
            // LI, type, dst-ref(2), src-ref(2), class, variable part.
            if frame.len() < li + 1 || li < 6 {
                return Err(WireError::Truncated);
            }
            Ok(CotpPdu::ConnectRequest {
                src_ref: get_u16_be(frame, 4),
                params: &frame[7..li + 1],
            })
        }
        COTP_DATA => {
            // LI (= 2), type, EOT; the S7 PDU follows.
            if frame.len() < li + 1 {
                return Err(WireError::Truncated);
            }
            Ok(CotpPdu::Data {
                payload: &frame[li + 1..],
            })
        }
        other => Err(WireError::CotpType(other)),
    }
}

/// Build a connect confirm answering `src_ref`, echoing the negotiation
/// parameters of the request.
pub fn build_connect_confirm(src_ref: u16, params: &[u8]) -> Vec<u8> {
    let li = 6 + params.len();
    let mut pdu = Vec::with_capacity(li + 1);
    pdu.push(li as u8);
    pdu.push(COTP_CONNECT_CONFIRM);
    pdu.extend_from_slice(&src_ref.to_be_bytes()); // dst-ref: the caller's ref
    pdu.extend_from_slice(&0x0001u16.to_be_bytes()); // our ref
    pdu.push(0x00); // class 0
    pdu.extend_from_slice(params);
    pdu
}

/// Prefix an S7 PDU with a COTP data header.
pub fn cotp_data(s7: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(3 + s7.len());
    pdu.extend_from_slice(&[0x02, COTP_DATA, 0x80]); // LI=2, DT, EOT
    pdu.extend_from_slice(s7);
    pdu
}

/// A parsed S7 job PDU.
#[derive(Debug)]
pub struct S7Job<'a> {
    pub pdu_ref: u16,
    pub params: &'a [u8],
    pub data: &'a [u8],
}

pub fn parse_s7_job(pdu: &[u8]) -> Result<S7Job<'_>, WireError> {
    if pdu.len() < 10 {
        return Err(WireError::Truncated);
    }
    if pdu[0] != S7_PROTOCOL_ID {
        return Err(WireError::ProtocolId(pdu[0]));
    }
    if pdu[1] != ROSCTR_JOB {
        return Err(WireError::Rosctr(pdu[1]));
    }
    let pdu_ref = get_u16_be(pdu, 4);
    let param_len = get_u16_be(pdu, 6) as usize;
    let data_len = get_u16_be(pdu, 8) as usize;
    if pdu.len() < 10 + param_len + data_len {
        return Err(WireError::Truncated);
    }
    Ok(S7Job {
        pdu_ref,
        params: &pdu[10..10 + param_len],
        data: &pdu[10 + param_len..10 + param_len + data_len],
    })
}

/// Build an ack-data PDU for `pdu_ref`.
pub fn build_s7_ack(pdu_ref: u16, error: (u8, u8), params: &[u8], data: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(12 + params.len() + data.len());
    pdu.push(S7_PROTOCOL_ID);
    pdu.push(ROSCTR_ACK_DATA);
    pdu.extend_from_slice(&[0x00, 0x00]); // redundancy id
    pdu.extend_from_slice(&pdu_ref.to_be_bytes());
    pdu.extend_from_slice(&(params.len() as u16).to_be_bytes());
    pdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
    pdu.push(error.0);
    pdu.push(error.1);
    pdu.extend_from_slice(params);
    pdu.extend_from_slice(data);
    pdu
}

/// One S7ANY item specification from a read/write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemRequest {
    pub transport: u8,
    pub count: u16,
    pub db_number: u16,
    pub area_code: u8,
    /// Bit-granular start address: `byte * 8 + bit`.
    pub address: u32,
}

pub const ITEM_SPEC_LEN: usize = 12;

impl ItemRequest {
    pub fn byte_offset(&self) -> usize {
        (self.address >> 3) as usize
    }

    pub fn bit(&self) -> u8 {
        (self.address & 0x07) as u8
    }

    /// Length of the addressed range in bytes; `None` for transport sizes
    /// the server does not serve.
    pub fn byte_len(&self) -> Option<usize> {
        let count = self.count as usize;
        match self.transport {
            TS_BIT => Some(1),
            TS_BYTE | TS_CHAR => Some(count),
            TS_WORD | TS_INT => Some(count * 2),
            TS_DWORD | TS_DINT => Some(count * 4),
            _ => None,
        }
    }
}

pub fn parse_item(spec: &[u8]) -> Result<ItemRequest, WireError> {
    if spec.len() < ITEM_SPEC_LEN {
        return Err(WireError::Truncated);
    }
    // Variable specification 0x12, length 0x0A, syntax id 0x10 (S7ANY).
    if spec[0] != 0x12 || spec[1] != 0x0A || spec[2] != 0x10 {
        return Err(WireError::BadItem);
    }
    Ok(ItemRequest {
        transport: spec[3],
        count: get_u16_be(spec, 4),
        db_number: get_u16_be(spec, 6),
        area_code: spec[8],
        address: u32::from(spec[9]) << 16 | u32::from(spec[10]) << 8 | u32::from(spec[11]),
    })
}

/// Build an S7ANY item specification (client side; used by tests).
pub fn build_item(item: &ItemRequest) -> [u8; ITEM_SPEC_LEN] {
    let mut spec = [0u8; ITEM_SPEC_LEN];
    spec[0] = 0x12;
    spec[1] = 0x0A;
    spec[2] = 0x10;
    spec[3] = item.transport;
    put_u16_be(&mut spec, 4, item.count);
    put_u16_be(&mut spec, 6, item.db_number);
    spec[8] = item.area_code;
    spec[9] = (item.address >> 16) as u8;
    spec[10] = (item.address >> 8) as u8;
    spec[11] = item.address as u8;
    spec
}

/// Payload byte count of a write data item, from its transport size and
/// length field.
pub fn data_item_payload_len(transport: u8, length: u16) -> Result<usize, WireError> {
    match transport {
        DATA_TS_BIT => Ok(1),
        DATA_TS_BYTE_BITS => Ok((length as usize).div_ceil(8)),
        DATA_TS_OCTET_STRING => Ok(length as usize),
        _ => Err(WireError::BadItem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tpkt_round_trip() {
        let frame = tpkt_frame(&[0xAA, 0xBB, 0xCC]);
        assert_eq!(frame, vec![0x03, 0x00, 0x00, 0x07, 0xAA, 0xBB, 0xCC]);
        let header: [u8; 4] = frame[..4].try_into().unwrap();
        assert_eq!(tpkt_total_len(&header), Ok(7));
    }

    #[test]
    fn bad_tpkt_version_is_rejected() {
        assert_eq!(
            tpkt_total_len(&[0x02, 0, 0, 10]),
            Err(WireError::TpktVersion(0x02))
        );
    }

    #[test]
    fn cotp_connect_request_parses_and_confirm_echoes() {
        // LI=17, CR, dst 0x0000, src 0x1234, class 0, three params.
        let mut cr = vec![0x11, 0xE0, 0x00, 0x00, 0x12, 0x34, 0x00];
        let params = [0xC0, 0x01, 0x0A, 0xC1, 0x02, 0x01, 0x00, 0xC2, 0x02, 0x01, 0x02];
        cr.extend_from_slice(&params);
        match parse_cotp(&cr).unwrap() {
            CotpPdu::ConnectRequest { src_ref, params: p } => {
                assert_eq!(src_ref, 0x1234);
                assert_eq!(p, &params[..]);
                let cc = build_connect_confirm(src_ref, p);
                assert_eq!(cc[1], COTP_CONNECT_CONFIRM);
                assert_eq!(&cc[2..4], &[0x12, 0x34]);
                assert_eq!(&cc[7..], &params[..]);
                assert_eq!(cc[0] as usize, cc.len() - 1);
            }
            other => panic!("expected connect request, got {other:?}"),
        }
    }

    #[test]
    fn cotp_data_exposes_the_s7_payload() {
        let wrapped = cotp_data(&[0x32, 0x01]);
        match parse_cotp(&wrapped).unwrap() {
            CotpPdu::Data { payload } => assert_eq!(payload, &[0x32, 0x01]),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn s7_job_and_ack_headers_round_trip() {
        let params = [FUNC_READ_VAR, 0x01];
        let mut job = vec![0x32, 0x01, 0x00, 0x00, 0xBE, 0xEF];
        job.extend_from_slice(&(params.len() as u16).to_be_bytes());
        job.extend_from_slice(&0u16.to_be_bytes());
        job.extend_from_slice(&params);

        let parsed = parse_s7_job(&job).unwrap();
        assert_eq!(parsed.pdu_ref, 0xBEEF);
        assert_eq!(parsed.params, &params[..]);
        assert!(parsed.data.is_empty());

        let ack = build_s7_ack(0xBEEF, (0, 0), &params, &[0xFF]);
        assert_eq!(ack[0], S7_PROTOCOL_ID);
        assert_eq!(ack[1], ROSCTR_ACK_DATA);
        assert_eq!(get_u16_be(&ack, 4), 0xBEEF);
        assert_eq!(get_u16_be(&ack, 6), params.len() as u16);
        assert_eq!(get_u16_be(&ack, 8), 1);
        assert_eq!(&ack[10..12], &[0, 0]);
    }

    #[test]
    fn item_spec_round_trip_and_addressing() {
        let item = ItemRequest {
            transport: TS_WORD,
            count: 3,
            db_number: 7,
            area_code: AREA_DB,
            address: 4 * 8 + 2,
        };
        let spec = build_item(&item);
        let parsed = parse_item(&spec).unwrap();
        assert_eq!(parsed, item);
        assert_eq!(parsed.byte_offset(), 4);
        assert_eq!(parsed.bit(), 2);
        assert_eq!(parsed.byte_len(), Some(6));
    }

    #[test]
    fn unsupported_transport_has_no_byte_len() {
        let item = ItemRequest {
            transport: 0x1C, // counter
            count: 1,
            db_number: 0,
            area_code: AREA_MK,
            address: 0,
        };
        assert_eq!(item.byte_len(), None);
    }

    #[test]
    fn write_data_item_lengths() {
        assert_eq!(data_item_payload_len(DATA_TS_BYTE_BITS, 16), Ok(2));
        assert_eq!(data_item_payload_len(DATA_TS_OCTET_STRING, 5), Ok(5));
        assert_eq!(data_item_payload_len(DATA_TS_BIT, 1), Ok(1));
        assert!(data_item_payload_len(0x55, 8).is_err());
    }
}
