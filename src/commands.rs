//! DDC/CI command request and response types.
//!
//! Each request type implements [`Command`]; its reply type implements
//! [`CommandResult`]. Payload bytes here exclude framing: the packet layer
//! adds source address, length byte, and checksum.

use std::{fmt, mem};

use crate::error::{Error, FramingError, SemanticError};
use crate::stats::OpClass;

/// An MCCS feature code.
pub type FeatureCode = u8;

pub trait Command {
    type Ok: CommandResult;
    /// Smallest legal encoded payload.
    const MIN_LEN: usize;
    /// Largest legal encoded payload.
    const MAX_LEN: usize;
    /// Retry class of this operation.
    const CLASS: OpClass;
    /// Delay before reading the reply, milliseconds.
    const DELAY_RESPONSE_MS: u64;
    /// Delay before the next command, milliseconds.
    const DELAY_COMMAND_MS: u64;

    fn len(&self) -> usize;

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error>;
}

pub trait CommandResult: Sized {
    const MAX_LEN: usize;
    fn decode(data: &[u8]) -> Result<Self, Error>;
}

/// VCP Feature Request, opcode 0x01.
#[derive(Copy, Clone, Debug)]
pub struct GetVcpFeature {
    pub code: FeatureCode,
}

impl GetVcpFeature {
    pub fn new(code: FeatureCode) -> Self {
        GetVcpFeature { code }
    }
}

impl Command for GetVcpFeature {
    type Ok = VcpValue;
    const MIN_LEN: usize = 2;
    const MAX_LEN: usize = 2;
    const CLASS: OpClass = OpClass::WriteRead;
    const DELAY_RESPONSE_MS: u64 = 40;
    const DELAY_COMMAND_MS: u64 = 50;

    fn len(&self) -> usize {
        2
    }

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error> {
        assert!(data.len() >= 2);
        data[0] = 0x01;
        data[1] = self.code;
        Ok(2)
    }
}

/// VCP Feature Reply payload, opcode 0x02.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpValue {
    /// VCP type code from the reply (0 = set parameter, 1 = momentary).
    pub ty: u8,
    pub mh: u8,
    pub ml: u8,
    pub sh: u8,
    pub sl: u8,
}

impl VcpValue {
    pub fn value(&self) -> u16 {
        ((self.sh as u16) << 8) | self.sl as u16
    }

    pub fn maximum(&self) -> u16 {
        ((self.mh as u16) << 8) | self.ml as u16
    }
}

impl fmt::Debug for VcpValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VcpValue")
            .field("maximum", &self.maximum())
            .field("value", &self.value())
            .finish()
    }
}

impl CommandResult for VcpValue {
    const MAX_LEN: usize = 8;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() != 8 {
            return Err(FramingError::InvalidLength(data.len()).into());
        }
        if data[0] != 0x02 {
            return Err(SemanticError::UnexpectedOpcode(data[0]).into());
        }
        match data[1] {
            0x00 => (), // NoError
            0x01 => return Err(SemanticError::UnsupportedVcpCode(data[2]).into()),
            rc => {
                return Err(SemanticError::OutOfRange(format!(
                    "unrecognized VCP result code {:#04x}",
                    rc
                ))
                .into())
            }
        }
        Ok(VcpValue {
            ty: data[3],
            mh: data[4],
            ml: data[5],
            sh: data[6],
            sl: data[7],
        })
    }
}

/// Set VCP Feature, opcode 0x03.
#[derive(Copy, Clone, Debug)]
pub struct SetVcpFeature {
    pub code: FeatureCode,
    pub value: u16,
}

impl SetVcpFeature {
    pub fn new(code: FeatureCode, value: u16) -> Self {
        SetVcpFeature { code, value }
    }
}

impl Command for SetVcpFeature {
    type Ok = ();
    const MIN_LEN: usize = 4;
    const MAX_LEN: usize = 4;
    const CLASS: OpClass = OpClass::WriteOnly;
    const DELAY_RESPONSE_MS: u64 = 0;
    const DELAY_COMMAND_MS: u64 = 50;

    fn len(&self) -> usize {
        4
    }

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error> {
        assert!(data.len() >= 4);
        data[0] = 0x03;
        data[1] = self.code;
        data[2] = (self.value >> 8) as _;
        data[3] = self.value as _;
        Ok(4)
    }
}

/// VCP Reset, opcode 0x09. Restores factory defaults for one feature.
#[derive(Copy, Clone, Debug)]
pub struct ResetVcpFeature {
    pub code: FeatureCode,
}

impl ResetVcpFeature {
    pub fn new(code: FeatureCode) -> Self {
        ResetVcpFeature { code }
    }
}

impl Command for ResetVcpFeature {
    type Ok = ();
    const MIN_LEN: usize = 2;
    const MAX_LEN: usize = 2;
    const CLASS: OpClass = OpClass::WriteOnly;
    const DELAY_RESPONSE_MS: u64 = 0;
    const DELAY_COMMAND_MS: u64 = 200;

    fn len(&self) -> usize {
        2
    }

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error> {
        assert!(data.len() >= 2);
        data[0] = 0x09;
        data[1] = self.code;
        Ok(2)
    }
}

/// Save Current Settings, opcode 0x0C.
#[derive(Copy, Clone, Debug)]
pub struct SaveCurrentSettings;

impl Command for SaveCurrentSettings {
    type Ok = ();
    const MIN_LEN: usize = 1;
    const MAX_LEN: usize = 1;
    const CLASS: OpClass = OpClass::WriteOnly;
    const DELAY_RESPONSE_MS: u64 = 0;
    const DELAY_COMMAND_MS: u64 = 200;

    fn len(&self) -> usize {
        1
    }

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error> {
        assert!(!data.is_empty());
        data[0] = 0x0c;
        Ok(1)
    }
}

/// Timing Request, opcode 0x07.
#[derive(Copy, Clone, Debug)]
pub struct GetTimingReport;

impl Command for GetTimingReport {
    type Ok = TimingMessage;
    const MIN_LEN: usize = 1;
    const MAX_LEN: usize = 1;
    const CLASS: OpClass = OpClass::WriteRead;
    const DELAY_RESPONSE_MS: u64 = 40;
    const DELAY_COMMAND_MS: u64 = 50;

    fn len(&self) -> usize {
        1
    }

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error> {
        assert!(!data.is_empty());
        data[0] = 0x07;
        Ok(1)
    }
}

/// Timing Reply payload, opcode 0x06.
#[derive(Clone, Debug)]
pub struct TimingMessage {
    pub timing_status: u8,
    pub horizontal_frequency: u16,
    pub vertical_frequency: u16,
}

impl CommandResult for TimingMessage {
    const MAX_LEN: usize = 6;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() != 6 {
            return Err(FramingError::InvalidLength(data.len()).into());
        }
        if data[0] != 0x06 {
            return Err(SemanticError::UnexpectedOpcode(data[0]).into());
        }
        Ok(TimingMessage {
            timing_status: data[1],
            horizontal_frequency: ((data[2] as u16) << 8) | data[3] as u16,
            vertical_frequency: ((data[4] as u16) << 8) | data[5] as u16,
        })
    }
}

/// Self-Test Request, opcode 0xB1. Reply carries opcode 0xA1.
#[derive(Copy, Clone, Debug)]
pub struct SelfTestRequest;

impl Command for SelfTestRequest {
    type Ok = SelfTestReply;
    const MIN_LEN: usize = 1;
    const MAX_LEN: usize = 1;
    const CLASS: OpClass = OpClass::WriteRead;
    const DELAY_RESPONSE_MS: u64 = 40;
    const DELAY_COMMAND_MS: u64 = 50;

    fn len(&self) -> usize {
        1
    }

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error> {
        assert!(!data.is_empty());
        data[0] = 0xb1;
        Ok(1)
    }
}

/// Self-Test Reply, opcode 0xA1. Result bytes are model-specific.
#[derive(Clone, Debug)]
pub struct SelfTestReply {
    pub data: Box<[u8]>,
}

impl CommandResult for SelfTestReply {
    const MAX_LEN: usize = 35;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.is_empty() || data.len() > 35 {
            return Err(FramingError::InvalidLength(data.len()).into());
        }
        if data[0] != 0xa1 {
            return Err(SemanticError::UnexpectedOpcode(data[0]).into());
        }
        Ok(SelfTestReply {
            data: data[1..].to_owned().into_boxed_slice(),
        })
    }
}

/// Identification Request, opcode 0xF1. Reply carries opcode 0xE1.
#[derive(Copy, Clone, Debug)]
pub struct IdRequest;

impl Command for IdRequest {
    type Ok = IdReply;
    const MIN_LEN: usize = 1;
    const MAX_LEN: usize = 1;
    const CLASS: OpClass = OpClass::WriteRead;
    const DELAY_RESPONSE_MS: u64 = 40;
    const DELAY_COMMAND_MS: u64 = 50;

    fn len(&self) -> usize {
        1
    }

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error> {
        assert!(!data.is_empty());
        data[0] = 0xf1;
        Ok(1)
    }
}

/// Identification Reply, opcode 0xE1.
#[derive(Clone, Debug)]
pub struct IdReply {
    pub data: Box<[u8]>,
}

impl CommandResult for IdReply {
    const MAX_LEN: usize = 35;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.is_empty() || data.len() > 35 {
            return Err(FramingError::InvalidLength(data.len()).into());
        }
        if data[0] != 0xe1 {
            return Err(SemanticError::UnexpectedOpcode(data[0]).into());
        }
        Ok(IdReply {
            data: data[1..].to_owned().into_boxed_slice(),
        })
    }
}

/// Capabilities Request, opcode 0xF3, with a fragment offset.
#[derive(Copy, Clone, Debug)]
pub struct CapabilitiesRequest {
    pub offset: u16,
}

impl CapabilitiesRequest {
    pub fn new(offset: u16) -> Self {
        CapabilitiesRequest { offset }
    }
}

impl Command for CapabilitiesRequest {
    type Ok = CapabilitiesReply;
    const MIN_LEN: usize = 3;
    const MAX_LEN: usize = 3;
    const CLASS: OpClass = OpClass::MultiPart;
    const DELAY_RESPONSE_MS: u64 = 40;
    const DELAY_COMMAND_MS: u64 = 50;

    fn len(&self) -> usize {
        3
    }

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error> {
        assert!(data.len() >= 3);
        data[0] = 0xf3;
        data[1] = (self.offset >> 8) as _;
        data[2] = self.offset as _;
        Ok(3)
    }
}

/// Capabilities Reply fragment, opcode 0xE3.
#[derive(Clone, Debug)]
pub struct CapabilitiesReply {
    pub offset: u16,
    pub data: Box<[u8]>,
}

impl CommandResult for CapabilitiesReply {
    const MAX_LEN: usize = 35;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 3 || data.len() > 35 {
            return Err(FramingError::InvalidLength(data.len()).into());
        }
        if data[0] != 0xe3 {
            return Err(SemanticError::UnexpectedOpcode(data[0]).into());
        }
        Ok(CapabilitiesReply {
            offset: ((data[1] as u16) << 8) | data[2] as u16,
            data: data[3..].to_owned().into_boxed_slice(),
        })
    }
}

/// Table Read Request, opcode 0xE2, with a fragment offset.
#[derive(Copy, Clone, Debug)]
pub struct TableRead {
    pub code: FeatureCode,
    pub offset: u16,
}

impl TableRead {
    pub fn new(code: FeatureCode, offset: u16) -> Self {
        TableRead { code, offset }
    }
}

impl Command for TableRead {
    type Ok = TableResponse;
    const MIN_LEN: usize = 4;
    const MAX_LEN: usize = 4;
    const CLASS: OpClass = OpClass::MultiPart;
    const DELAY_RESPONSE_MS: u64 = 40;
    const DELAY_COMMAND_MS: u64 = 50;

    fn len(&self) -> usize {
        4
    }

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error> {
        assert!(data.len() >= 4);
        data[0] = 0xe2;
        data[1] = self.code;
        data[2] = (self.offset >> 8) as _;
        data[3] = self.offset as _;
        Ok(4)
    }
}

/// Table Read Reply fragment, opcode 0xE4.
#[derive(Copy, Clone)]
pub struct TableResponse {
    pub offset: u16,
    data: [u8; 32],
    len: u8,
}

impl TableResponse {
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl fmt::Debug for TableResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TableResponse")
            .field("offset", &self.offset)
            .field("bytes", &self.bytes())
            .finish()
    }
}

impl Default for TableResponse {
    fn default() -> Self {
        unsafe { mem::zeroed() }
    }
}

impl CommandResult for TableResponse {
    const MAX_LEN: usize = 35;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 3 || data.len() > 35 {
            return Err(FramingError::InvalidLength(data.len()).into());
        }
        if data[0] != 0xe4 {
            return Err(SemanticError::UnexpectedOpcode(data[0]).into());
        }
        let mut table = TableResponse::default();
        table.offset = ((data[1] as u16) << 8) | data[2] as u16;
        let data = &data[3..];
        table.len = data.len() as u8;
        table.data[..data.len()].copy_from_slice(data);
        Ok(table)
    }
}

/// Table Write, opcode 0xE7, one fragment of at most 32 bytes.
#[derive(Copy, Clone, Debug)]
pub struct TableWrite<'a> {
    pub code: FeatureCode,
    pub offset: u16,
    pub data: &'a [u8],
}

impl<'a> TableWrite<'a> {
    pub fn new(code: FeatureCode, offset: u16, data: &'a [u8]) -> Self {
        TableWrite { code, offset, data }
    }
}

impl<'a> Command for TableWrite<'a> {
    type Ok = ();
    const MIN_LEN: usize = 4;
    const MAX_LEN: usize = 4 + 28;
    const CLASS: OpClass = OpClass::MultiPart;
    const DELAY_RESPONSE_MS: u64 = 0;
    const DELAY_COMMAND_MS: u64 = 50;

    fn len(&self) -> usize {
        4 + self.data.len()
    }

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error> {
        assert!(data.len() >= 4 + self.data.len());
        assert!(self.data.len() <= 28);
        data[0] = 0xe7;
        data[1] = self.code;
        data[2] = (self.offset >> 8) as _;
        data[3] = self.offset as _;
        data[4..4 + self.data.len()].copy_from_slice(self.data);
        Ok(4 + self.data.len())
    }
}

/// Enable Application Report, opcode 0xF5.
#[derive(Copy, Clone, Debug)]
pub struct EnableApplicationReport {
    pub enable: bool,
}

impl EnableApplicationReport {
    pub fn new(enable: bool) -> Self {
        EnableApplicationReport { enable }
    }
}

impl Command for EnableApplicationReport {
    type Ok = ();
    const MIN_LEN: usize = 2;
    const MAX_LEN: usize = 2;
    const CLASS: OpClass = OpClass::WriteOnly;
    const DELAY_RESPONSE_MS: u64 = 0;
    const DELAY_COMMAND_MS: u64 = 50;

    fn len(&self) -> usize {
        2
    }

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error> {
        assert!(data.len() >= 2);
        data[0] = 0xf5;
        data[1] = self.enable as u8;
        Ok(2)
    }
}

impl CommandResult for () {
    const MAX_LEN: usize = 0;

    fn decode(_data: &[u8]) -> Result<Self, Error> {
        Ok(())
    }
}

impl<'a, C: Command> Command for &'a C {
    type Ok = C::Ok;
    const MIN_LEN: usize = C::MIN_LEN;
    const MAX_LEN: usize = C::MAX_LEN;
    const CLASS: OpClass = C::CLASS;
    const DELAY_RESPONSE_MS: u64 = C::DELAY_RESPONSE_MS;
    const DELAY_COMMAND_MS: u64 = C::DELAY_COMMAND_MS;

    fn len(&self) -> usize {
        (*self).len()
    }

    fn encode(&self, data: &mut [u8]) -> Result<usize, Error> {
        (*self).encode(data)
    }
}
