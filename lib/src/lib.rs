//! Offline signer: keeps MPC key shares encrypted at rest, with the wrap key for each share
//! held on a secure element that only releases it for a valid authorization signature.

pub extern crate secp256k1;

pub mod api;
pub mod apdu;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod orchestrator;
pub mod record;
pub mod runner;
pub mod transport;

#[cfg(any(test, feature = "emulator"))]
pub mod emulator;
#[cfg(feature = "pcsc")]
pub mod pcsc;

pub use api::{handle, serve, Request, Response};
pub use config::Config;
pub use envelope::WrapKey;
pub use error::{Error, ErrorKind};
pub use orchestrator::{KeygenOutput, KeygenParams, Orchestrator, SignParams};
pub use record::RecordCount;
pub use transport::{SeConnector, SeSession, SeTransport};
