/// An Application Protocol Data Unit (APDU) is the unit of communication between a smart card
/// reader and a smart card. This file defines the secure element applet commands and the
/// response framing.
use crate::error::ApduError;
use std::fmt;
use std::fmt::{Debug, Formatter};

pub const SELECT_CLA_INS_P1P2: [u8; 4] = [0x00, 0xA4, 0x04, 0x00];
pub const CLA_PROPRIETARY: u8 = 0x80;

pub const INS_STORE_DATA: u8 = 0x10;
pub const INS_READ_INIT: u8 = 0x20;
pub const INS_READ_CONTINUE: u8 = 0x21;
pub const INS_READ_FINALIZE: u8 = 0x22;
pub const INS_DELETE_DATA: u8 = 0x30;
pub const INS_GET_DATA: u8 = 0xCA;

/// GlobalPlatform GET DATA for the Card Production Life Cycle tag.
pub const GET_CPLC_APDU: [u8; 5] = [CLA_PROPRIETARY, INS_GET_DATA, 0x9F, 0x7F, 0x00];
pub const CPLC_TAG: [u8; 2] = [0x9F, 0x7F];

pub const DEFAULT_APPLET_AID: [u8; 8] = [0xA0, 0x00, 0x00, 0x00, 0x62, 0xCF, 0x01, 0x01];
pub const MIN_AID_LENGTH: usize = 5;
pub const MAX_AID_LENGTH: usize = 16;

// record field sizes (bytes)
pub const USER_HASH_LENGTH: usize = 32;
pub const ADDR_LENGTH: usize = 20;
pub const MESSAGE_LENGTH: usize = 32;
pub const MIN_SIGNATURE_LENGTH: usize = 8;
pub const MAX_SIGNATURE_LENGTH: usize = 72;
/// Record slots available in the applet.
pub const MAX_RECORDS: usize = 100;

pub const MAX_DATA_LENGTH: usize = 255;
/// Largest chunk requested by a read continue command.
pub const MAX_CHUNK_SIZE: u8 = 0xF0;

/// ISO 7816-4 status words used by the applet.
pub mod sw {
    pub const SUCCESS: u16 = 0x9000;
    pub const MORE_DATA_PREFIX: u8 = 0x61;
    pub const VERIFICATION_FAILED: u16 = 0x6300;
    pub const WRONG_LENGTH: u16 = 0x6700;
    pub const SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
    pub const CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
    pub const WRONG_DATA: u16 = 0x6A80;
    pub const FILE_NOT_FOUND: u16 = 0x6A82;
    pub const RECORD_NOT_FOUND: u16 = 0x6A83;
    pub const FILE_FULL: u16 = 0x6A84;
    pub const FILE_ALREADY_EXISTS: u16 = 0x6A89;
    pub const INS_NOT_SUPPORTED: u16 = 0x6D00;
    pub const CLA_NOT_SUPPORTED: u16 = 0x6E00;

    pub fn is_more_data(sw: u16) -> bool {
        (sw >> 8) as u8 == MORE_DATA_PREFIX
    }

    /// Signature verification failures inside the applet.
    pub fn is_unauthorized(sw: u16) -> bool {
        sw == SECURITY_STATUS_NOT_SATISFIED || sw == VERIFICATION_FAILED
    }

    pub fn more_data(remaining: usize) -> u16 {
        // 0x6100 means 256 or more bytes remain
        let remaining = if remaining > 0xFF { 0 } else { remaining };
        ((MORE_DATA_PREFIX as u16) << 8) | remaining as u16
    }

    pub fn description(sw: u16) -> &'static str {
        match sw {
            SUCCESS => "success",
            VERIFICATION_FAILED => "verification failed",
            WRONG_LENGTH => "wrong length",
            SECURITY_STATUS_NOT_SATISFIED => "signature invalid",
            CONDITIONS_NOT_SATISFIED => "conditions not satisfied",
            WRONG_DATA => "wrong data",
            FILE_NOT_FOUND => "applet not found",
            RECORD_NOT_FOUND => "record not found",
            FILE_FULL => "storage full",
            FILE_ALREADY_EXISTS => "record already exists",
            INS_NOT_SUPPORTED => "instruction not supported",
            CLA_NOT_SUPPORTED => "class not supported",
            sw if is_more_data(sw) => "more data available",
            _ => "unknown",
        }
    }
}

// Apdu Traits
pub trait CommandApdu {
    fn name() -> &'static str
    where
        Self: Sized;
    fn apdu_bytes(&self) -> Result<Vec<u8>, ApduError>;
}

/// Frame `header | Lc | data | Le`, omitting `Lc` when there is no data.
pub fn build_apdu(header: &[u8; 4], data: &[u8], le: Option<u8>) -> Result<Vec<u8>, ApduError> {
    if data.len() > MAX_DATA_LENGTH {
        return Err(ApduError::DataTooLong(data.len()));
    }
    let mut apdu = Vec::with_capacity(header.len() + data.len() + 2);
    apdu.extend_from_slice(header);
    if !data.is_empty() {
        apdu.push(data.len() as u8);
        apdu.extend_from_slice(data);
    }
    if let Some(le) = le {
        apdu.push(le);
    }
    Ok(apdu)
}

/// Split a response into its trailing status word and data. Responses shorter than the two
/// status bytes yield status word 0 and no data.
pub fn extract_response_and_sw(resp: &[u8]) -> (u16, Vec<u8>) {
    if resp.len() < 2 {
        return (0, Vec::new());
    }
    let (data, status) = resp.split_at(resp.len() - 2);
    (u16::from_be_bytes([status[0], status[1]]), data.to_vec())
}

/// `00 A4 04 00 Lc AID`
pub fn build_select(aid: &[u8]) -> Result<Vec<u8>, ApduError> {
    AppletSelect::new(aid)?.apdu_bytes()
}

#[derive(Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    pub data: Vec<u8>,
    pub sw: u16,
}

impl ResponseApdu {
    pub fn new(data: Vec<u8>, sw: u16) -> Self {
        ResponseApdu { data, sw }
    }

    pub fn status(sw: u16) -> Self {
        ResponseApdu::new(Vec::new(), sw)
    }

    pub fn success(data: Vec<u8>) -> Self {
        ResponseApdu::new(data, sw::SUCCESS)
    }

    pub fn parse(raw: &[u8]) -> Self {
        let (sw, data) = extract_response_and_sw(raw);
        ResponseApdu { data, sw }
    }

    pub fn is_success(&self) -> bool {
        self.sw == sw::SUCCESS
    }

    pub fn is_more_data(&self) -> bool {
        sw::is_more_data(self.sw)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.data.clone();
        bytes.extend_from_slice(&self.sw.to_be_bytes());
        bytes
    }
}

impl Debug for ResponseApdu {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseApdu")
            .field("data_len", &self.data.len())
            .field("sw", &format_args!("{:04X}", self.sw))
            .finish()
    }
}

/// A received command split into its fields.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CommandView {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<u8>,
}

impl CommandView {
    /// Parse short-form command cases 1 to 4.
    pub fn parse(raw: &[u8]) -> Result<Self, ApduError> {
        if raw.len() < 4 {
            return Err(ApduError::Malformed(format!(
                "{} bytes is shorter than a header",
                raw.len()
            )));
        }
        let (cla, ins, p1, p2) = (raw[0], raw[1], raw[2], raw[3]);
        let body = &raw[4..];
        let (data, le) = match body.len() {
            0 => (Vec::new(), None),
            1 => (Vec::new(), Some(body[0])),
            _ => {
                let lc = body[0] as usize;
                match body.len() - 1 {
                    n if n == lc => (body[1..].to_vec(), None),
                    n if n == lc + 1 => (body[1..=lc].to_vec(), Some(body[lc + 1])),
                    n => {
                        return Err(ApduError::Malformed(format!(
                            "Lc {lc} does not match {n} body bytes"
                        )))
                    }
                }
            }
        };
        Ok(CommandView {
            cla,
            ins,
            p1,
            p2,
            data,
            le,
        })
    }
}

/// Applet Select
#[derive(Clone, PartialEq, Eq)]
pub struct AppletSelect {
    aid: Vec<u8>,
}

impl AppletSelect {
    pub fn new(aid: &[u8]) -> Result<Self, ApduError> {
        if !(MIN_AID_LENGTH..=MAX_AID_LENGTH).contains(&aid.len()) {
            return Err(ApduError::InvalidAid(aid.len()));
        }
        Ok(AppletSelect { aid: aid.to_vec() })
    }

    pub fn aid(&self) -> &[u8] {
        &self.aid
    }
}

impl Default for AppletSelect {
    fn default() -> Self {
        AppletSelect {
            aid: DEFAULT_APPLET_AID.to_vec(),
        }
    }
}

impl CommandApdu for AppletSelect {
    fn name() -> &'static str {
        "select"
    }

    fn apdu_bytes(&self) -> Result<Vec<u8>, ApduError> {
        build_apdu(&SELECT_CLA_INS_P1P2, &self.aid, None)
    }
}

impl Debug for AppletSelect {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppletSelect")
            .field("aid", &hex::encode_upper(&self.aid))
            .finish()
    }
}

/// Store a wrap key under (user hash, address). The applet answers `index | count`.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreCommand {
    pub user_hash: [u8; USER_HASH_LENGTH],
    pub addr: [u8; ADDR_LENGTH],
    pub wrap_key: [u8; MESSAGE_LENGTH],
}

impl CommandApdu for StoreCommand {
    fn name() -> &'static str {
        "store"
    }

    fn apdu_bytes(&self) -> Result<Vec<u8>, ApduError> {
        let data = [
            self.user_hash.as_slice(),
            self.addr.as_slice(),
            self.wrap_key.as_slice(),
        ]
        .concat();
        build_apdu(
            &[CLA_PROPRIETARY, INS_STORE_DATA, 0x00, 0x00],
            &data,
            None,
        )
    }
}

impl Debug for StoreCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreCommand")
            .field("user_hash", &hex::encode(self.user_hash))
            .field("addr", &hex::encode(self.addr))
            .field("wrap_key", &"<redacted>")
            .finish()
    }
}

/// Start a chunked read. Each field is length prefixed and the applet answers with the
/// two byte big-endian length of the stored payload.
#[derive(Clone, PartialEq, Eq)]
pub struct ReadInitCommand {
    pub user_hash: [u8; USER_HASH_LENGTH],
    pub addr: [u8; ADDR_LENGTH],
    pub sig: Vec<u8>,
}

impl CommandApdu for ReadInitCommand {
    fn name() -> &'static str {
        "read_init"
    }

    fn apdu_bytes(&self) -> Result<Vec<u8>, ApduError> {
        let mut data = Vec::with_capacity(3 + USER_HASH_LENGTH + ADDR_LENGTH + self.sig.len());
        for field in [
            self.user_hash.as_slice(),
            self.addr.as_slice(),
            self.sig.as_slice(),
        ] {
            if field.len() > u8::MAX as usize {
                return Err(ApduError::DataTooLong(field.len()));
            }
            data.push(field.len() as u8);
            data.extend_from_slice(field);
        }
        build_apdu(
            &[CLA_PROPRIETARY, INS_READ_INIT, 0x00, 0x00],
            &data,
            Some(0x02),
        )
    }
}

impl Debug for ReadInitCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadInitCommand")
            .field("user_hash", &hex::encode(self.user_hash))
            .field("addr", &hex::encode(self.addr))
            .field("sig", &hex::encode(&self.sig))
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReadContinueCommand {
    pub le: u8,
}

impl CommandApdu for ReadContinueCommand {
    fn name() -> &'static str {
        "read_continue"
    }

    fn apdu_bytes(&self) -> Result<Vec<u8>, ApduError> {
        build_apdu(
            &[CLA_PROPRIETARY, INS_READ_CONTINUE, 0x00, 0x00],
            &[],
            Some(self.le),
        )
    }
}

#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReadFinalizeCommand {}

impl CommandApdu for ReadFinalizeCommand {
    fn name() -> &'static str {
        "read_finalize"
    }

    fn apdu_bytes(&self) -> Result<Vec<u8>, ApduError> {
        build_apdu(
            &[CLA_PROPRIETARY, INS_READ_FINALIZE, 0x00, 0x00],
            &[],
            Some(0x00),
        )
    }
}

/// Remove the record under (user hash, address), authorized by `sig`.
#[derive(Clone, PartialEq, Eq)]
pub struct DeleteCommand {
    pub user_hash: [u8; USER_HASH_LENGTH],
    pub addr: [u8; ADDR_LENGTH],
    pub sig: Vec<u8>,
}

impl CommandApdu for DeleteCommand {
    fn name() -> &'static str {
        "delete"
    }

    fn apdu_bytes(&self) -> Result<Vec<u8>, ApduError> {
        let data = [
            self.user_hash.as_slice(),
            self.addr.as_slice(),
            self.sig.as_slice(),
        ]
        .concat();
        build_apdu(
            &[CLA_PROPRIETARY, INS_DELETE_DATA, 0x00, 0x00],
            &data,
            None,
        )
    }
}

impl Debug for DeleteCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteCommand")
            .field("user_hash", &hex::encode(self.user_hash))
            .field("addr", &hex::encode(self.addr))
            .field("sig", &hex::encode(&self.sig))
            .finish()
    }
}

#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub struct GetCplcCommand {}

impl CommandApdu for GetCplcCommand {
    fn name() -> &'static str {
        "get_cplc"
    }

    fn apdu_bytes(&self) -> Result<Vec<u8>, ApduError> {
        Ok(GET_CPLC_APDU.to_vec())
    }
}
