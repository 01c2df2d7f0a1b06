//! In-memory secure element applet for tests and hardware-free development. Authorization
//! signatures are DER encoded secp256k1 ECDSA over `sha256(user_hash || addr)`.

use crate::apdu::*;
use crate::error::SeError;
use crate::transport::{transmit, SeConnector, SeSession, SeTransport};
use async_trait::async_trait;
use log::debug;
use secp256k1::ecdsa::Signature;
use secp256k1::hashes::sha256;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// CPLC block answered when none is configured.
pub const EMULATOR_CPLC: [u8; 8] = [0x47, 0x90, 0x50, 0x40, 0x47, 0x91, 0x81, 0x02];

/// Digest the applet verifies authorization signatures against.
pub fn authorization_message(user_hash: &[u8], addr: &[u8]) -> Message {
    Message::from_hashed_data::<sha256::Hash>(&[user_hash, addr].concat())
}

/// DER authorization signature accepted by an applet holding the matching public key.
pub fn sign_authorization(secret: &SecretKey, user_hash: &[u8], addr: &[u8]) -> Vec<u8> {
    let secp = Secp256k1::signing_only();
    secp.sign_ecdsa(&authorization_message(user_hash, addr), secret)
        .serialize_der()
        .to_vec()
}

struct Record {
    user_hash: [u8; USER_HASH_LENGTH],
    addr: [u8; ADDR_LENGTH],
    payload: Vec<u8>,
}

struct PendingRead {
    payload: Vec<u8>,
    offset: usize,
}

#[derive(Default)]
struct AppletState {
    present: bool,
    selected: bool,
    open_sessions: usize,
    records: Vec<Record>,
    pending: Option<PendingRead>,
}

impl AppletState {
    fn position(&self, user_hash: &[u8], addr: &[u8]) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.user_hash == user_hash && r.addr == addr)
    }
}

/// The record applet behind a single emulated reader.
pub struct EmulatedApplet {
    aid: Vec<u8>,
    auth_key: PublicKey,
    cplc: Vec<u8>,
    chunk_size: u8,
    state: Mutex<AppletState>,
}

impl EmulatedApplet {
    pub fn new(auth_key: PublicKey) -> Self {
        EmulatedApplet {
            aid: DEFAULT_APPLET_AID.to_vec(),
            auth_key,
            cplc: EMULATOR_CPLC.to_vec(),
            chunk_size: MAX_CHUNK_SIZE,
            state: Mutex::new(AppletState {
                present: true,
                ..AppletState::default()
            }),
        }
    }

    pub fn with_aid(mut self, aid: &[u8]) -> Self {
        self.aid = aid.to_vec();
        self
    }

    /// Cap on the bytes returned per read continue, to exercise multi-chunk reads.
    pub fn with_chunk_size(mut self, chunk_size: u8) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_cplc(mut self, cplc: &[u8]) -> Self {
        self.cplc = cplc.to_vec();
        self
    }

    fn state(&self) -> MutexGuard<'_, AppletState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plug or unplug the emulated card.
    pub fn set_present(&self, present: bool) {
        let mut state = self.state();
        state.present = present;
        if !present {
            state.selected = false;
            state.pending = None;
        }
    }

    pub fn record_count(&self) -> usize {
        self.state().records.len()
    }

    /// Stored payload under (user hash, address).
    pub fn record(&self, user_hash: &[u8], addr: &[u8]) -> Option<Vec<u8>> {
        let state = self.state();
        state
            .position(user_hash, addr)
            .map(|i| state.records[i].payload.clone())
    }

    /// Store a payload of any length, bypassing the store command. Returns false when the
    /// record exists or the table is full.
    pub fn insert_record(
        &self,
        user_hash: [u8; USER_HASH_LENGTH],
        addr: [u8; ADDR_LENGTH],
        payload: Vec<u8>,
    ) -> bool {
        let mut state = self.state();
        if state.records.len() >= MAX_RECORDS || state.position(&user_hash, &addr).is_some() {
            return false;
        }
        state.records.push(Record {
            user_hash,
            addr,
            payload,
        });
        true
    }

    /// Sessions connected and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    fn connect(&self) -> Result<(), SeError> {
        let mut state = self.state();
        if !state.present {
            return Err(SeError::Transport("No readers are connected.".to_string()));
        }
        state.selected = false;
        state.pending = None;
        state.open_sessions += 1;
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.state();
        state.open_sessions = state.open_sessions.saturating_sub(1);
        state.selected = false;
        state.pending = None;
    }

    fn process(&self, raw: &[u8]) -> Result<Vec<u8>, SeError> {
        let mut state = self.state();
        if !state.present {
            return Err(SeError::Transport("Card removed".to_string()));
        }
        let response = match CommandView::parse(raw) {
            Ok(cmd) => self.dispatch(&mut state, &cmd),
            Err(e) => {
                debug!("Emulator rejected command: {e}");
                ResponseApdu::status(sw::WRONG_LENGTH)
            }
        };
        Ok(response.to_bytes())
    }

    fn dispatch(&self, state: &mut AppletState, cmd: &CommandView) -> ResponseApdu {
        if [cmd.cla, cmd.ins, cmd.p1, cmd.p2] == SELECT_CLA_INS_P1P2 {
            state.pending = None;
            state.selected = cmd.data == self.aid;
            return if state.selected {
                ResponseApdu::status(sw::SUCCESS)
            } else {
                ResponseApdu::status(sw::FILE_NOT_FOUND)
            };
        }
        if cmd.cla != CLA_PROPRIETARY {
            return ResponseApdu::status(sw::CLA_NOT_SUPPORTED);
        }
        // the card manager answers GET DATA whether or not the applet is selected
        if cmd.ins == INS_GET_DATA {
            return self.get_data(cmd);
        }
        if !state.selected {
            return ResponseApdu::status(sw::CLA_NOT_SUPPORTED);
        }
        match cmd.ins {
            INS_STORE_DATA => store(state, &cmd.data),
            INS_READ_INIT => self.read_init(state, &cmd.data),
            INS_READ_CONTINUE => self.read_continue(state, cmd.le.unwrap_or(0)),
            INS_READ_FINALIZE => {
                state.pending = None;
                ResponseApdu::status(sw::SUCCESS)
            }
            INS_DELETE_DATA => self.delete(state, &cmd.data),
            _ => ResponseApdu::status(sw::INS_NOT_SUPPORTED),
        }
    }

    fn get_data(&self, cmd: &CommandView) -> ResponseApdu {
        if [cmd.p1, cmd.p2] != CPLC_TAG {
            return ResponseApdu::status(sw::RECORD_NOT_FOUND);
        }
        let mut data = CPLC_TAG.to_vec();
        data.push(self.cplc.len() as u8);
        data.extend_from_slice(&self.cplc);
        ResponseApdu::success(data)
    }

    fn authorized(&self, user_hash: &[u8], addr: &[u8], sig: &[u8]) -> bool {
        let secp = Secp256k1::verification_only();
        match Signature::from_der(sig) {
            Ok(sig) => secp
                .verify_ecdsa(&authorization_message(user_hash, addr), &sig, &self.auth_key)
                .is_ok(),
            Err(_) => false,
        }
    }

    fn read_init(&self, state: &mut AppletState, data: &[u8]) -> ResponseApdu {
        let Some((user_hash, addr, sig)) = split_read_init(data) else {
            return ResponseApdu::status(sw::WRONG_LENGTH);
        };
        let Some(i) = state.position(user_hash, addr) else {
            return ResponseApdu::status(sw::RECORD_NOT_FOUND);
        };
        if !self.authorized(user_hash, addr, sig) {
            return ResponseApdu::status(sw::SECURITY_STATUS_NOT_SATISFIED);
        }
        let payload = state.records[i].payload.clone();
        let total = (payload.len() as u16).to_be_bytes();
        state.pending = Some(PendingRead { payload, offset: 0 });
        ResponseApdu::success(total.to_vec())
    }

    fn read_continue(&self, state: &mut AppletState, le: u8) -> ResponseApdu {
        let Some(pending) = state.pending.as_mut() else {
            return ResponseApdu::status(sw::CONDITIONS_NOT_SATISFIED);
        };
        let remaining = pending.payload.len() - pending.offset;
        let n = remaining.min(le as usize).min(self.chunk_size as usize);
        let chunk = pending.payload[pending.offset..pending.offset + n].to_vec();
        pending.offset += n;
        let remaining = pending.payload.len() - pending.offset;
        if remaining == 0 {
            state.pending = None;
            ResponseApdu::success(chunk)
        } else {
            ResponseApdu::new(chunk, sw::more_data(remaining))
        }
    }

    fn delete(&self, state: &mut AppletState, data: &[u8]) -> ResponseApdu {
        let fixed = USER_HASH_LENGTH + ADDR_LENGTH;
        if data.len() < fixed + MIN_SIGNATURE_LENGTH || data.len() > fixed + MAX_SIGNATURE_LENGTH
        {
            return ResponseApdu::status(sw::WRONG_LENGTH);
        }
        let (user_hash, rest) = data.split_at(USER_HASH_LENGTH);
        let (addr, sig) = rest.split_at(ADDR_LENGTH);
        let Some(i) = state.position(user_hash, addr) else {
            return ResponseApdu::status(sw::RECORD_NOT_FOUND);
        };
        if !self.authorized(user_hash, addr, sig) {
            return ResponseApdu::status(sw::SECURITY_STATUS_NOT_SATISFIED);
        }
        state.records.remove(i);
        ResponseApdu::success(vec![i as u8, state.records.len() as u8])
    }
}

fn store(state: &mut AppletState, data: &[u8]) -> ResponseApdu {
    if data.len() != USER_HASH_LENGTH + ADDR_LENGTH + MESSAGE_LENGTH {
        return ResponseApdu::status(sw::WRONG_LENGTH);
    }
    let (user_hash, rest) = data.split_at(USER_HASH_LENGTH);
    let (addr, payload) = rest.split_at(ADDR_LENGTH);
    if state.position(user_hash, addr).is_some() {
        return ResponseApdu::status(sw::FILE_ALREADY_EXISTS);
    }
    if state.records.len() >= MAX_RECORDS {
        return ResponseApdu::status(sw::FILE_FULL);
    }
    let mut record = Record {
        user_hash: [0; USER_HASH_LENGTH],
        addr: [0; ADDR_LENGTH],
        payload: payload.to_vec(),
    };
    record.user_hash.copy_from_slice(user_hash);
    record.addr.copy_from_slice(addr);
    state.records.push(record);
    let count = state.records.len();
    ResponseApdu::success(vec![(count - 1) as u8, count as u8])
}

/// `len | user_hash | len | addr | len | sig`
fn split_read_init(data: &[u8]) -> Option<(&[u8], &[u8], &[u8])> {
    let mut fields = Vec::with_capacity(3);
    let mut rest = data;
    for _ in 0..3 {
        let (len, tail) = rest.split_first()?;
        if tail.len() < *len as usize {
            return None;
        }
        let (field, tail) = tail.split_at(*len as usize);
        fields.push(field);
        rest = tail;
    }
    let (user_hash, addr, sig) = (fields[0], fields[1], fields[2]);
    if !rest.is_empty()
        || user_hash.len() != USER_HASH_LENGTH
        || addr.len() != ADDR_LENGTH
        || !(MIN_SIGNATURE_LENGTH..=MAX_SIGNATURE_LENGTH).contains(&sig.len())
    {
        return None;
    }
    Some((user_hash, addr, sig))
}

/// Connects to an [`EmulatedApplet`] the way the PC/SC connector connects to a reader.
#[derive(Clone)]
pub struct EmulatorConnector {
    applet: Arc<EmulatedApplet>,
    aid: Vec<u8>,
}

impl EmulatorConnector {
    pub fn new(applet: Arc<EmulatedApplet>) -> Self {
        EmulatorConnector {
            applet,
            aid: DEFAULT_APPLET_AID.to_vec(),
        }
    }

    /// AID sent in SELECT, which need not match the applet's.
    pub fn with_aid(mut self, aid: &[u8]) -> Self {
        self.aid = aid.to_vec();
        self
    }

    pub fn applet(&self) -> &Arc<EmulatedApplet> {
        &self.applet
    }

    fn connect(&self) -> Result<EmulatorSession, SeError> {
        self.applet.connect()?;
        Ok(EmulatorSession {
            applet: self.applet.clone(),
            open: true,
        })
    }
}

#[async_trait]
impl SeConnector for EmulatorConnector {
    type Session = EmulatorSession;

    async fn open(&self) -> Result<EmulatorSession, SeError> {
        let select = AppletSelect::new(&self.aid)?;
        let session = self.connect()?;
        let response = transmit(&session, &select).await?;
        if !response.is_success() {
            return Err(SeError::Protocol { sw: response.sw });
        }
        Ok(session)
    }

    async fn open_card(&self) -> Result<EmulatorSession, SeError> {
        self.connect()
    }
}

pub struct EmulatorSession {
    applet: Arc<EmulatedApplet>,
    open: bool,
}

impl EmulatorSession {
    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.applet.disconnect();
        }
    }
}

#[async_trait]
impl SeTransport for EmulatorSession {
    async fn transmit_apdu(&self, command_apdu: Vec<u8>) -> Result<Vec<u8>, SeError> {
        if !self.open {
            return Err(SeError::Transport("Card is not connected".to_string()));
        }
        self.applet.process(&command_apdu)
    }
}

impl SeSession for EmulatorSession {
    fn close(mut self) -> Result<(), SeError> {
        self.release();
        Ok(())
    }
}

impl Drop for EmulatorSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::envelope::WrapKey;
    use crate::record;
    use secp256k1::rand::thread_rng;

    pub(crate) fn test_applet() -> (Arc<EmulatedApplet>, SecretKey) {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut thread_rng());
        (Arc::new(EmulatedApplet::new(public)), secret)
    }

    const USER_HASH: [u8; 32] = [0x11; 32];
    const ADDR: [u8; 20] = [0x22; 20];

    #[tokio::test]
    async fn test_store_then_read() {
        let (applet, secret) = test_applet();
        let connector = EmulatorConnector::new(applet.clone());
        let session = connector.open().await.unwrap();
        let key = WrapKey::from_slice(&[0x5A; 32]).unwrap();
        let slot = record::store(&session, &USER_HASH, &ADDR, &key).await.unwrap();
        assert_eq!(slot, record::RecordCount { index: 0, count: 1 });

        let sig = sign_authorization(&secret, &USER_HASH, &ADDR);
        let read = record::read(&session, &USER_HASH, &ADDR, &sig).await.unwrap();
        assert_eq!(read, key);
        session.close().unwrap();
        assert_eq!(applet.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_tampered_signature_is_unauthorized() {
        let (applet, secret) = test_applet();
        let connector = EmulatorConnector::new(applet.clone());
        let session = connector.open().await.unwrap();
        let key = WrapKey::from_slice(&[0x5A; 32]).unwrap();
        record::store(&session, &USER_HASH, &ADDR, &key).await.unwrap();

        let mut sig = sign_authorization(&secret, &USER_HASH, &ADDR);
        let last = sig.len() - 1;
        sig[last] ^= 0x01;
        let err = record::read(&session, &USER_HASH, &ADDR, &sig).await.unwrap_err();
        assert_eq!(err, SeError::Unauthorized);

        // signed for another address
        let sig = sign_authorization(&secret, &USER_HASH, &[0x33; 20]);
        let err = record::delete(&session, &USER_HASH, &ADDR, &sig).await.unwrap_err();
        assert_eq!(err, SeError::Unauthorized);
        assert_eq!(applet.record_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_then_read_not_found() {
        let (applet, secret) = test_applet();
        let connector = EmulatorConnector::new(applet.clone());
        let session = connector.open().await.unwrap();
        let key = WrapKey::from_slice(&[0x5A; 32]).unwrap();
        record::store(&session, &USER_HASH, &ADDR, &key).await.unwrap();
        let sig = sign_authorization(&secret, &USER_HASH, &ADDR);

        let slot = record::delete(&session, &USER_HASH, &ADDR, &sig).await.unwrap();
        assert_eq!(slot, record::RecordCount { index: 0, count: 0 });
        let err = record::read(&session, &USER_HASH, &ADDR, &sig).await.unwrap_err();
        assert_eq!(
            err,
            SeError::Protocol {
                sw: sw::RECORD_NOT_FOUND
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_store_keeps_first() {
        let (applet, _) = test_applet();
        let connector = EmulatorConnector::new(applet.clone());
        let session = connector.open().await.unwrap();
        let first = WrapKey::from_slice(&[0x01; 32]).unwrap();
        let second = WrapKey::from_slice(&[0x02; 32]).unwrap();
        record::store(&session, &USER_HASH, &ADDR, &first).await.unwrap();
        let err = record::store(&session, &USER_HASH, &ADDR, &second)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SeError::Protocol {
                sw: sw::FILE_ALREADY_EXISTS
            }
        );
        assert_eq!(applet.record(&USER_HASH, &ADDR), Some(vec![0x01; 32]));
    }

    #[tokio::test]
    async fn test_store_when_full() {
        let (applet, _) = test_applet();
        for i in 0..MAX_RECORDS {
            assert!(applet.insert_record([i as u8; 32], ADDR, vec![0; 32]));
        }
        let connector = EmulatorConnector::new(applet.clone());
        let session = connector.open().await.unwrap();
        let key = WrapKey::from_slice(&[0x01; 32]).unwrap();
        let err = record::store(&session, &[0xEE; 32], &ADDR, &key)
            .await
            .unwrap_err();
        assert_eq!(err, SeError::Protocol { sw: sw::FILE_FULL });
    }

    #[tokio::test]
    async fn test_multi_chunk_read() {
        let (applet, secret) = test_applet();
        let payload: Vec<u8> = (0..600u16).map(|i| i as u8).collect();
        assert!(applet.insert_record(USER_HASH, ADDR, payload.clone()));
        let connector = EmulatorConnector::new(applet.clone());
        let session = connector.open().await.unwrap();
        let sig = sign_authorization(&secret, &USER_HASH, &ADDR);
        let read = record::read_payload(&session, &USER_HASH, &ADDR, &sig)
            .await
            .unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn test_small_chunks() {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut thread_rng());
        let applet = Arc::new(EmulatedApplet::new(public).with_chunk_size(7));
        let connector = EmulatorConnector::new(applet.clone());
        let session = connector.open().await.unwrap();
        let key = WrapKey::from_slice(&[0x77; 32]).unwrap();
        record::store(&session, &USER_HASH, &ADDR, &key).await.unwrap();
        let sig = sign_authorization(&secret, &USER_HASH, &ADDR);
        let read = record::read(&session, &USER_HASH, &ADDR, &sig).await.unwrap();
        assert_eq!(read, key);
    }

    #[tokio::test]
    async fn test_select_and_cplc() {
        let (applet, _) = test_applet();
        let connector = EmulatorConnector::new(applet.clone()).with_aid(&[0xA0, 0, 0, 0, 0x01]);
        let err = connector.open().await.err().unwrap();
        assert_eq!(
            err,
            SeError::Protocol {
                sw: sw::FILE_NOT_FOUND
            }
        );
        assert_eq!(applet.open_sessions(), 0);

        let session = connector.open_card().await.unwrap();
        assert_eq!(record::get_cplc(&session).await.unwrap(), EMULATOR_CPLC);
        // applet commands need a selected applet
        let key = WrapKey::from_slice(&[0x01; 32]).unwrap();
        let err = record::store(&session, &USER_HASH, &ADDR, &key)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SeError::Protocol {
                sw: sw::CLA_NOT_SUPPORTED
            }
        );
    }

    #[tokio::test]
    async fn test_unplugged() {
        let (applet, _) = test_applet();
        let connector = EmulatorConnector::new(applet.clone());
        let session = connector.open().await.unwrap();
        applet.set_present(false);
        let err = record::get_cplc(&session).await.unwrap_err();
        assert!(matches!(err, SeError::Transport(_)));
        drop(session);
        assert!(matches!(
            connector.open().await.err().unwrap(),
            SeError::Transport(_)
        ));
        applet.set_present(true);
        assert!(connector.open().await.is_ok());
        assert_eq!(applet.open_sessions(), 0);
    }
}
