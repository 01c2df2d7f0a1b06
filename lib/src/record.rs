use crate::apdu::*;
use crate::envelope::WrapKey;
use crate::error::SeError;
use crate::transport::{transmit, SeTransport};
use log::{debug, warn};
use std::fmt::Debug;

/// Slot index of the affected record and the number of records held afterwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RecordCount {
    pub index: u8,
    pub count: u8,
}

impl RecordCount {
    fn from_response(name: &str, response: &ResponseApdu) -> Result<Self, SeError> {
        match response.data.as_slice() {
            [index, count, ..] => Ok(RecordCount {
                index: *index,
                count: *count,
            }),
            _ => Err(SeError::MalformedResponse {
                sw: response.sw,
                reason: format!(
                    "{name} returned {} bytes, expected index and count",
                    response.data.len()
                ),
            }),
        }
    }
}

fn fixed<const N: usize>(field: &str, bytes: &[u8]) -> Result<[u8; N], SeError> {
    bytes.try_into().map_err(|_| {
        SeError::InvalidInput(format!(
            "{field} must be {} bytes, got {}",
            N,
            bytes.len()
        ))
    })
}

fn check_signature(sig: &[u8]) -> Result<Vec<u8>, SeError> {
    if !(MIN_SIGNATURE_LENGTH..=MAX_SIGNATURE_LENGTH).contains(&sig.len()) {
        return Err(SeError::InvalidInput(format!(
            "signature must be {MIN_SIGNATURE_LENGTH} to {MAX_SIGNATURE_LENGTH} bytes, got {}",
            sig.len()
        )));
    }
    Ok(sig.to_vec())
}

/// Map a non-success status word to an error.
fn status_error(name: &str, sw: u16) -> SeError {
    debug!("{name} failed: 0x{sw:04X} ({})", sw::description(sw));
    if sw::is_unauthorized(sw) {
        SeError::Unauthorized
    } else {
        SeError::Protocol { sw }
    }
}

async fn exchange<C>(transport: &dyn SeTransport, command: &C) -> Result<ResponseApdu, SeError>
where
    C: CommandApdu + Debug + Send + Sync,
{
    let response = transmit(transport, command).await?;
    if !response.is_success() {
        return Err(status_error(C::name(), response.sw));
    }
    Ok(response)
}

/// Store `wrap_key` under (user hash, address). The applet refuses a second store for the
/// same pair.
pub async fn store(
    transport: &dyn SeTransport,
    user_hash: &[u8],
    addr: &[u8],
    wrap_key: &WrapKey,
) -> Result<RecordCount, SeError> {
    let cmd = StoreCommand {
        user_hash: fixed("user hash", user_hash)?,
        addr: fixed("address", addr)?,
        wrap_key: *wrap_key.as_bytes(),
    };
    let response = exchange(transport, &cmd).await?;
    let slot = RecordCount::from_response(StoreCommand::name(), &response)?;
    debug!("Stored record {} of {}", slot.index, slot.count);
    Ok(slot)
}

/// Read the wrap key under (user hash, address), authorized by a DER signature over
/// `user_hash || addr`.
pub async fn read(
    transport: &dyn SeTransport,
    user_hash: &[u8],
    addr: &[u8],
    sig: &[u8],
) -> Result<WrapKey, SeError> {
    let payload = read_payload(transport, user_hash, addr, sig).await?;
    WrapKey::from_slice(&payload).map_err(|_| SeError::MalformedResponse {
        sw: sw::SUCCESS,
        reason: format!(
            "record holds {} bytes, expected {MESSAGE_LENGTH}",
            payload.len()
        ),
    })
}

/// Chunked read of a record payload of any length.
pub async fn read_payload(
    transport: &dyn SeTransport,
    user_hash: &[u8],
    addr: &[u8],
    sig: &[u8],
) -> Result<Vec<u8>, SeError> {
    let cmd = ReadInitCommand {
        user_hash: fixed("user hash", user_hash)?,
        addr: fixed("address", addr)?,
        sig: check_signature(sig)?,
    };
    let response = exchange(transport, &cmd).await?;
    let total = match response.data.as_slice() {
        [hi, lo] => u16::from_be_bytes([*hi, *lo]) as usize,
        data => {
            return Err(SeError::MalformedResponse {
                sw: response.sw,
                reason: format!("read init returned {} bytes, expected 2", data.len()),
            })
        }
    };
    debug!("Reading {total} byte record");

    match read_chunks(transport, total).await {
        Ok(payload) => Ok(payload),
        Err(e) => {
            finalize(transport).await;
            Err(e)
        }
    }
}

async fn read_chunks(transport: &dyn SeTransport, total: usize) -> Result<Vec<u8>, SeError> {
    let mut payload = Vec::with_capacity(total);
    while payload.len() < total {
        let remaining = total - payload.len();
        let le = remaining.min(MAX_CHUNK_SIZE as usize) as u8;
        let cmd = ReadContinueCommand { le };
        let response = transmit(transport, &cmd).await?;
        if !response.is_success() && !response.is_more_data() {
            return Err(status_error(ReadContinueCommand::name(), response.sw));
        }
        if response.data.is_empty() {
            return Err(SeError::MalformedResponse {
                sw: response.sw,
                reason: format!("empty chunk with {remaining} bytes outstanding"),
            });
        }
        payload.extend_from_slice(&response.data);
        if payload.len() > total {
            return Err(SeError::MalformedResponse {
                sw: response.sw,
                reason: format!("received {} bytes, expected {total}", payload.len()),
            });
        }
        if response.is_success() && payload.len() < total {
            return Err(SeError::MalformedResponse {
                sw: response.sw,
                reason: format!("read ended after {} of {total} bytes", payload.len()),
            });
        }
    }
    Ok(payload)
}

/// Reset the applet's read state. Failures are only logged.
async fn finalize(transport: &dyn SeTransport) {
    match transmit(transport, &ReadFinalizeCommand::default()).await {
        Ok(response) if response.is_success() => (),
        Ok(response) => debug!("Read finalize returned 0x{:04X}", response.sw),
        Err(e) => warn!("Read finalize failed: {e}"),
    }
}

/// Remove the record under (user hash, address), authorized by a DER signature.
pub async fn delete(
    transport: &dyn SeTransport,
    user_hash: &[u8],
    addr: &[u8],
    sig: &[u8],
) -> Result<RecordCount, SeError> {
    let cmd = DeleteCommand {
        user_hash: fixed("user hash", user_hash)?,
        addr: fixed("address", addr)?,
        sig: check_signature(sig)?,
    };
    let response = exchange(transport, &cmd).await?;
    let slot = RecordCount::from_response(DeleteCommand::name(), &response)?;
    debug!("Deleted record {}, {} remaining", slot.index, slot.count);
    Ok(slot)
}

/// Card Production Life Cycle data, unwrapped from its `9F7F` tag.
pub async fn get_cplc(transport: &dyn SeTransport) -> Result<Vec<u8>, SeError> {
    let response = exchange(transport, &GetCplcCommand::default()).await?;
    let malformed = |reason: String| SeError::MalformedResponse {
        sw: response.sw,
        reason,
    };
    match response.data.as_slice() {
        [t1, t2, len, data @ ..] if [*t1, *t2] == CPLC_TAG => {
            if *len as usize != data.len() {
                return Err(malformed(format!(
                    "CPLC length byte {len} but {} bytes follow",
                    data.len()
                )));
            }
            Ok(data.to_vec())
        }
        [t1, t2, _, ..] => Err(malformed(format!(
            "CPLC tag {t1:02X}{t2:02X}, expected 9F7F"
        ))),
        data => Err(malformed(format!("CPLC response has {} bytes", data.len()))),
    }
}
