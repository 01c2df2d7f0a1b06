use crate::apdu::{CommandApdu, ResponseApdu};
use crate::error::SeError;
use async_trait::async_trait;
use log::trace;
use std::fmt::Debug;

/// Trait for exchanging raw APDUs with a secure element.
#[async_trait]
pub trait SeTransport: Sync + Send {
    async fn transmit_apdu(&self, command_apdu: Vec<u8>) -> Result<Vec<u8>, SeError>;
}

/// A selected applet reachable for the length of one operation.
pub trait SeSession: SeTransport {
    /// Release the connection, leaving the card powered.
    fn close(self) -> Result<(), SeError>
    where
        Self: Sized;
}

/// Opens a fresh session for every operation so that an unplugged and replugged reader is
/// picked up on the next call.
#[async_trait]
pub trait SeConnector: Sync + Send {
    type Session: SeSession;

    /// Connect and select the applet.
    async fn open(&self) -> Result<Self::Session, SeError>;

    /// Connect without selecting the applet. GlobalPlatform GET DATA requests such as CPLC
    /// are answered by the card manager.
    async fn open_card(&self) -> Result<Self::Session, SeError>;
}

/// Helper function to serialize a command, transmit it and split the response.
pub(crate) async fn transmit<C>(
    transport: &(dyn SeTransport + '_),
    command: &C,
) -> Result<ResponseApdu, SeError>
where
    C: CommandApdu + Debug + Send + Sync,
{
    let command_apdu = command.apdu_bytes()?;
    trace!("{} -> {:?}", C::name(), command);
    let rapdu = transport.transmit_apdu(command_apdu).await?;
    if rapdu.len() < 2 {
        return Err(SeError::MalformedResponse {
            sw: 0,
            reason: format!("{} response has {} bytes", C::name(), rapdu.len()),
        });
    }
    let response = ResponseApdu::parse(&rapdu);
    trace!("{} <- {:?}", C::name(), response);
    Ok(response)
}

/// Index of the first reader whose name contains `wanted`, or the first reader when `wanted`
/// is empty.
pub fn select_reader(readers: &[String], wanted: &str) -> Option<usize> {
    if wanted.is_empty() {
        return if readers.is_empty() { None } else { Some(0) };
    }
    readers.iter().position(|reader| reader.contains(wanted))
}
