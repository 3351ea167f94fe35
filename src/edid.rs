//! Parsing of the 128-byte base EDID block.
//!
//! This is the only module that understands the internal structure of the
//! EDID. Everything else works with the [`ParsedEdid`] it produces, or with
//! the [`EdidId`] identity derived from it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the base EDID block.
pub const EDID_SIZE: usize = 128;

const EDID_HEADER: [u8; 8] = [0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];

const DESCRIPTOR_START: usize = 54;
const DESCRIPTOR_SIZE: usize = 18;
const DESCRIPTOR_COUNT: usize = 4;

const DESCRIPTOR_TAG_SERIAL: u8 = 0xFF;
const DESCRIPTOR_TAG_MODEL: u8 = 0xFC;

/// Why a 128-byte block could not be turned into a [`ParsedEdid`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EdidError {
    #[error("EDID block is {0} bytes, expected 128")]
    WrongSize(usize),
    #[error("EDID header bytes invalid")]
    BadHeader,
    /// Model-name or serial descriptor missing; there is nothing to
    /// identify the monitor by.
    #[error("no usable identity fields in EDID")]
    NoIdentity,
}

/// Sums all 128 bytes (checksum byte included) modulo 256.
///
/// A conforming block sums to zero.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Unpacks the big-endian 2-byte manufacturer id into three ASCII letters.
///
/// Bits 14-10, 9-5, 4-0 are each offset by 0x40.
pub fn decode_mfg_id(bytes: [u8; 2]) -> String {
    let field = u16::from_be_bytes(bytes);
    let letters = [
        ((field >> 10) & 0x1F) as u8 + 0x40,
        ((field >> 5) & 0x1F) as u8 + 0x40,
        (field & 0x1F) as u8 + 0x40,
    ];
    letters.iter().map(|&b| b as char).collect()
}

/// Packs three ASCII uppercase letters into the 2-byte manufacturer field.
///
/// Returns `None` unless the input is exactly three characters in `A..=Z`.
pub fn encode_mfg_id(id: &str) -> Option<[u8; 2]> {
    let mut field = 0u16;
    let mut count = 0;
    for c in id.chars() {
        if !c.is_ascii_uppercase() {
            return None;
        }
        field = (field << 5) | (c as u16 - 0x40);
        count += 1;
    }
    if count != 3 {
        return None;
    }
    Some(field.to_be_bytes())
}

/// The durable identity fields of a monitor, as carried in its EDID.
///
/// Phantom detection and the persistence stores key on this rather than on
/// the raw 128 bytes: the same panel has been seen emitting byte-level
/// differing EDIDs on parallel connectors within one session (byte 24,
/// RGB 4:4:4 vs RGB 4:4:4 + YCbCr 4:2:2).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdidId {
    pub mfg_id: String,
    pub model_name: String,
    pub product_code: u16,
    pub serial_ascii: String,
    pub serial_binary: u32,
}

impl fmt::Display for EdidId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{:04x}/{}",
            self.mfg_id, self.model_name, self.product_code, self.serial_ascii
        )
    }
}

/// An EDID block decoded into its identity fields.
///
/// Immutable once created. The raw bytes are retained for byte-level
/// comparison (DRM connector matching, MST duplicate detection).
#[derive(Clone, PartialEq, Eq)]
pub struct ParsedEdid {
    bytes: [u8; EDID_SIZE],
    mfg_id: String,
    model_name: String,
    serial_ascii: String,
    product_code: u16,
    serial_binary: u32,
    checksum_ok: bool,
}

impl ParsedEdid {
    /// Decodes a 128-byte EDID block.
    ///
    /// Both the model-name descriptor (tag 0xFC) and the serial-number
    /// descriptor (tag 0xFF) must be present. A mismatching checksum is
    /// recorded and warned about but does not fail the parse: monitors
    /// with mis-checksummed EDIDs exist in the wild and the kernel exposes
    /// them anyway.
    pub fn parse(raw: &[u8]) -> Result<Self, EdidError> {
        if raw.len() != EDID_SIZE {
            return Err(EdidError::WrongSize(raw.len()));
        }
        if raw[..8] != EDID_HEADER {
            return Err(EdidError::BadHeader);
        }
        let mut bytes = [0u8; EDID_SIZE];
        bytes.copy_from_slice(raw);

        let checksum_ok = checksum(&bytes) == 0;
        if !checksum_ok {
            tracing::warn!(
                checkbyte = format_args!("{:#04x}", bytes[127]),
                "EDID checksum mismatch, accepting block anyway"
            );
        }

        let mut model_name = None;
        let mut serial_ascii = None;
        for k in 0..DESCRIPTOR_COUNT {
            let d = &bytes[DESCRIPTOR_START + k * DESCRIPTOR_SIZE..][..DESCRIPTOR_SIZE];
            if d[0] != 0x00 || d[1] != 0x00 || d[2] != 0x00 {
                continue;
            }
            let slot = match d[3] {
                DESCRIPTOR_TAG_MODEL => &mut model_name,
                DESCRIPTOR_TAG_SERIAL => &mut serial_ascii,
                _ => continue,
            };
            *slot = Some(descriptor_text(&d[5..]));
        }

        let (model_name, serial_ascii) = match (model_name, serial_ascii) {
            (Some(m), Some(s)) => (m, s),
            _ => return Err(EdidError::NoIdentity),
        };

        Ok(ParsedEdid {
            mfg_id: decode_mfg_id([bytes[8], bytes[9]]),
            model_name,
            serial_ascii,
            product_code: u16::from_le_bytes([bytes[10], bytes[11]]),
            serial_binary: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            checksum_ok,
            bytes,
        })
    }

    /// The raw 128-byte block.
    pub fn bytes(&self) -> &[u8; EDID_SIZE] {
        &self.bytes
    }

    /// Three-letter manufacturer id, e.g. `DEL`.
    pub fn mfg_id(&self) -> &str {
        &self.mfg_id
    }

    /// Model name from the 0xFC descriptor, at most 13 characters.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// ASCII serial number from the 0xFF descriptor, at most 13 characters.
    pub fn serial_ascii(&self) -> &str {
        &self.serial_ascii
    }

    /// Product code, bytes 10-11 little-endian.
    pub fn product_code(&self) -> u16 {
        self.product_code
    }

    /// Binary serial number, bytes 12-15 little-endian.
    pub fn serial_binary(&self) -> u32 {
        self.serial_binary
    }

    /// Whether the block summed to zero.
    pub fn checksum_ok(&self) -> bool {
        self.checksum_ok
    }

    /// The identity fields used for phantom matching and persistence keys.
    pub fn id(&self) -> EdidId {
        EdidId {
            mfg_id: self.mfg_id.clone(),
            model_name: self.model_name.clone(),
            product_code: self.product_code,
            serial_ascii: self.serial_ascii.clone(),
            serial_binary: self.serial_binary,
        }
    }

    /// Byte-for-byte equality of the underlying blocks.
    pub fn same_bytes(&self, other: &ParsedEdid) -> bool {
        self.bytes == other.bytes
    }
}

impl fmt::Debug for ParsedEdid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ParsedEdid")
            .field("mfg_id", &self.mfg_id)
            .field("model_name", &self.model_name)
            .field("serial_ascii", &self.serial_ascii)
            .field("product_code", &format_args!("{:#06x}", self.product_code))
            .field("serial_binary", &self.serial_binary)
            .field("checksum_ok", &self.checksum_ok)
            .finish()
    }
}

/// Descriptor text runs to the first 0x0A or to 13 bytes.
fn descriptor_text(payload: &[u8]) -> String {
    payload
        .iter()
        .take(13)
        .take_while(|&&b| b != 0x0A)
        .map(|&b| b as char)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a minimal valid EDID block and fixes up the checksum.
    pub(crate) fn test_edid(
        mfg: [u8; 2],
        product: [u8; 2],
        serial_bin: [u8; 4],
        model: &str,
        serial: &str,
    ) -> [u8; EDID_SIZE] {
        let mut b = [0u8; EDID_SIZE];
        b[..8].copy_from_slice(&EDID_HEADER);
        b[8] = mfg[0];
        b[9] = mfg[1];
        b[10] = product[0];
        b[11] = product[1];
        b[12..16].copy_from_slice(&serial_bin);

        write_descriptor(&mut b, 0, DESCRIPTOR_TAG_SERIAL, serial);
        write_descriptor(&mut b, 1, DESCRIPTOR_TAG_MODEL, model);

        b[127] = 0u8.wrapping_sub(checksum(&b[..127]));
        b
    }

    fn write_descriptor(b: &mut [u8; EDID_SIZE], slot: usize, tag: u8, text: &str) {
        let d = &mut b[DESCRIPTOR_START + slot * DESCRIPTOR_SIZE..][..DESCRIPTOR_SIZE];
        d[0] = 0x00;
        d[1] = 0x00;
        d[2] = 0x00;
        d[3] = tag;
        d[4] = 0x00;
        let text = text.as_bytes();
        assert!(text.len() <= 13);
        d[5..5 + text.len()].copy_from_slice(text);
        // terminator followed by space padding, as real monitors emit
        if text.len() < 13 {
            d[5 + text.len()] = 0x0A;
            for pad in &mut d[5 + text.len() + 1..] {
                *pad = 0x20;
            }
        }
    }

    #[test]
    fn checksum_zero_iff_sum_zero() {
        let block = test_edid([0x10, 0xAC], [0x27, 0xA0], [1, 0, 0, 0], "U2720Q", "ABC123");
        assert_eq!(checksum(&block), 0);

        let mut corrupt = block;
        corrupt[40] = corrupt[40].wrapping_add(1);
        assert_ne!(checksum(&corrupt), 0);
    }

    #[test]
    fn mfg_id_round_trip() {
        for s in ["DEL", "AAA", "ZZZ", "SAM", "GSM", "AUS"] {
            let bytes = encode_mfg_id(s).unwrap();
            assert_eq!(decode_mfg_id(bytes), s, "round trip for {}", s);
        }
        assert_eq!(encode_mfg_id("del"), None);
        assert_eq!(encode_mfg_id("DE"), None);
        assert_eq!(encode_mfg_id("DELL"), None);
    }

    #[test]
    fn dell_mfg_bytes_decode() {
        // 0x10AC is the well-known Dell id
        assert_eq!(decode_mfg_id([0x10, 0xAC]), "DEL");
        assert_eq!(encode_mfg_id("DEL"), Some([0x10, 0xAC]));
    }

    #[test]
    fn parses_identity_fields() {
        let block = test_edid([0x10, 0xAC], [0x27, 0xA0], [0x78, 0x56, 0x34, 0x12], "U2720Q", "ABC123");
        let edid = ParsedEdid::parse(&block).unwrap();
        assert_eq!(edid.mfg_id(), "DEL");
        assert_eq!(edid.product_code(), 0xA027);
        assert_eq!(edid.serial_binary(), 0x12345678);
        assert_eq!(edid.model_name(), "U2720Q");
        assert_eq!(edid.serial_ascii(), "ABC123");
        assert!(edid.checksum_ok());
    }

    #[test]
    fn serial_descriptor_terminates_at_newline() {
        // descriptor payload per the serial-number scenario:
        // 'A' 'B' 'C' '1' '2' '3' 0A 20 20 ...
        let block = test_edid([0x10, 0xAC], [0x27, 0xA0], [0, 0, 0, 0], "MODEL", "ABC123");
        let d = &block[DESCRIPTOR_START..][..DESCRIPTOR_SIZE];
        assert_eq!(&d[..4], &[0x00, 0x00, 0x00, 0xFF]);
        assert_eq!(&d[5..11], b"ABC123");
        assert_eq!(d[11], 0x0A);

        let edid = ParsedEdid::parse(&block).unwrap();
        assert_eq!(edid.serial_ascii(), "ABC123");
    }

    #[test]
    fn thirteen_byte_name_needs_no_terminator() {
        let block = test_edid([0x10, 0xAC], [0, 0], [0, 0, 0, 0], "ABCDEFGHIJKLM", "S");
        let edid = ParsedEdid::parse(&block).unwrap();
        assert_eq!(edid.model_name(), "ABCDEFGHIJKLM");
    }

    #[test]
    fn missing_descriptor_fails_parse() {
        let mut block = test_edid([0x10, 0xAC], [0, 0], [0, 0, 0, 0], "M", "S");
        // wipe the model-name descriptor tag
        block[DESCRIPTOR_START + DESCRIPTOR_SIZE + 3] = 0xFD;
        block[127] = 0u8.wrapping_sub(block[..127].iter().fold(0u8, |a, &x| a.wrapping_add(x)));
        assert_eq!(ParsedEdid::parse(&block), Err(EdidError::NoIdentity));
    }

    #[test]
    fn bad_header_rejected() {
        let mut block = test_edid([0x10, 0xAC], [0, 0], [0, 0, 0, 0], "M", "S");
        block[0] = 0xFF;
        assert_eq!(ParsedEdid::parse(&block), Err(EdidError::BadHeader));
    }

    #[test]
    fn bad_checksum_accepted_and_recorded() {
        let mut block = test_edid([0x10, 0xAC], [0, 0], [0, 0, 0, 0], "M", "S");
        block[127] = block[127].wrapping_add(1);
        let edid = ParsedEdid::parse(&block).unwrap();
        assert!(!edid.checksum_ok());
        assert_eq!(edid.mfg_id(), "DEL");
    }

    #[test]
    fn identity_ignores_byte_level_noise() {
        let a = test_edid([0x10, 0xAC], [0x27, 0xA0], [1, 0, 0, 0], "U2720Q", "ABC123");
        let mut b = a;
        // byte 24 is the feature-support byte that differs between
        // connectors on some panels
        b[24] ^= 0x08;
        b[127] = 0u8.wrapping_sub(b[..127].iter().fold(0u8, |x, &y| x.wrapping_add(y)));
        let pa = ParsedEdid::parse(&a).unwrap();
        let pb = ParsedEdid::parse(&b).unwrap();
        assert!(!pa.same_bytes(&pb));
        assert_eq!(pa.id(), pb.id());
    }
}
