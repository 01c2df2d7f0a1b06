// Copyright (c) 2025 offline-signer contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::apdu::AppletSelect;
use crate::error::SeError;
use crate::transport::{select_reader, transmit, SeConnector, SeSession, SeTransport};
use async_trait::async_trait;
use log::{debug, info, warn};
use pcsc::{Card, Context, Disposition, Protocols, Scope, ShareMode, MAX_BUFFER_SIZE};
use std::ffi::CString;

/// Names of the readers currently attached.
pub fn list_readers() -> Result<Vec<String>, SeError> {
    let ctx = Context::establish(Scope::User)?;
    let readers = reader_cstrings(&ctx)?
        .iter()
        .map(|reader| reader.to_string_lossy().into_owned())
        .collect();
    release(ctx);
    Ok(readers)
}

fn reader_cstrings(ctx: &Context) -> Result<Vec<CString>, SeError> {
    let mut readers_buf = [0; 2048];
    let readers = ctx
        .list_readers(&mut readers_buf)?
        .map(|reader| reader.to_owned())
        .collect();
    Ok(readers)
}

fn release(ctx: Context) {
    if let Err((_, e)) = ctx.release() {
        warn!("Failed to release PC/SC context: {e}");
    }
}

/// Opens a PC/SC session per operation.
#[derive(Debug, Clone)]
pub struct PcscConnector {
    reader_name: String,
    aid: Vec<u8>,
}

impl PcscConnector {
    pub fn new(reader_name: impl Into<String>, aid: Vec<u8>) -> Self {
        PcscConnector {
            reader_name: reader_name.into(),
            aid,
        }
    }

    fn connect(&self) -> Result<PcscSession, SeError> {
        // Establish a PC/SC context. On an early return the context and card release
        // themselves when dropped.
        let ctx = Context::establish(Scope::User)?;

        let reader_cstrs = reader_cstrings(&ctx)?;
        let readers: Vec<String> = reader_cstrs
            .iter()
            .map(|reader| reader.to_string_lossy().into_owned())
            .collect();
        let index = select_reader(&readers, &self.reader_name).ok_or_else(|| {
            if readers.is_empty() {
                SeError::Transport("No readers are connected.".to_string())
            } else {
                SeError::Transport(format!(
                    "No reader matching '{}' among {:?}",
                    self.reader_name, readers
                ))
            }
        })?;
        let reader = readers[index].clone();
        if self.reader_name.is_empty() {
            warn!(
                "No card reader configured, using first of {} reader(s): {}",
                readers.len(),
                reader
            );
        }

        let card = ctx.connect(&reader_cstrs[index], ShareMode::Shared, Protocols::ANY)?;
        let protocol = card.status2_owned()?.protocol2();
        info!("Connected to reader {reader} using protocol {protocol:?}");

        Ok(PcscSession {
            ctx: Some(ctx),
            card: Some(card),
            reader,
        })
    }
}

#[async_trait]
impl SeConnector for PcscConnector {
    type Session = PcscSession;

    async fn open(&self) -> Result<PcscSession, SeError> {
        let select = AppletSelect::new(&self.aid)?;
        let session = self.connect()?;
        let response = transmit(&session, &select).await?;
        if !response.is_success() {
            // dropping the session disconnects and releases the context
            return Err(SeError::Protocol { sw: response.sw });
        }
        debug!("Selected applet {:?} on {}", select, session.reader);
        Ok(session)
    }

    async fn open_card(&self) -> Result<PcscSession, SeError> {
        self.connect()
    }
}

/// A connected card and the context it was opened from.
pub struct PcscSession {
    ctx: Option<Context>,
    card: Option<Card>,
    reader: String,
}

impl PcscSession {
    pub fn reader(&self) -> &str {
        &self.reader
    }

    fn teardown(&mut self) -> Result<(), SeError> {
        let mut result = Ok(());
        if let Some(card) = self.card.take() {
            if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
                result = Err(SeError::from(e));
            }
        }
        if let Some(ctx) = self.ctx.take() {
            if let Err((_, e)) = ctx.release() {
                if result.is_ok() {
                    result = Err(SeError::from(e));
                }
            }
        }
        result
    }
}

#[async_trait]
impl SeTransport for PcscSession {
    async fn transmit_apdu(&self, command_apdu: Vec<u8>) -> Result<Vec<u8>, SeError> {
        let card = self
            .card
            .as_ref()
            .ok_or_else(|| SeError::Transport("Card is not connected".to_string()))?;
        let mut receive_buffer = vec![0; MAX_BUFFER_SIZE];
        let rapdu = card.transmit(command_apdu.as_slice(), &mut receive_buffer)?;
        Ok(rapdu.to_vec())
    }
}

impl SeSession for PcscSession {
    fn close(mut self) -> Result<(), SeError> {
        debug!("Closing session on {}", self.reader);
        self.teardown()
    }
}

impl Drop for PcscSession {
    fn drop(&mut self) {
        if self.card.is_some() || self.ctx.is_some() {
            if let Err(e) = self.teardown() {
                warn!("Failed to close session on {}: {e}", self.reader);
            }
        }
    }
}
