use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Errors building or parsing APDUs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApduError {
    #[error("Command data too long: {0} bytes, max 255")]
    DataTooLong(usize),
    #[error("Invalid AID length: {0} bytes, expected 5 to 16")]
    InvalidAid(usize),
    #[error("Malformed command APDU: {0}")]
    Malformed(String),
}

/// Errors talking to the secure element.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeError {
    #[error("Transport: {0}")]
    Transport(String),
    #[error("Secure element returned status word 0x{sw:04X}")]
    Protocol { sw: u16 },
    #[error("Signature rejected by secure element")]
    Unauthorized,
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Malformed response (status word 0x{sw:04X}): {reason}")]
    MalformedResponse { sw: u16, reason: String },
    #[error(transparent)]
    Apdu(#[from] ApduError),
}

#[cfg(feature = "pcsc")]
impl From<pcsc::Error> for SeError {
    fn from(e: pcsc::Error) -> Self {
        SeError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key length: {0} bytes")]
    InvalidKeyLength(usize),
    #[error("Ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed: authentication tag mismatch")]
    Decrypt,
    #[error("Compression: {0}")]
    Compression(String),
    #[error("Decompression: {0}")]
    Decompression(String),
    #[error("Invalid public key format: {0}")]
    InvalidPublicKeyFormat(String),
    #[error("Public key is not a curve point: {0}")]
    PublicKey(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl From<secp256k1::Error> for CryptoError {
    fn from(e: secp256k1::Error) -> Self {
        CryptoError::PublicKey(e.to_string())
    }
}

/// Errors running the MPC executables.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    #[error("Executable not found: {0}")]
    BinaryNotFound(String),
    #[error("I/O: {0}")]
    Io(String),
    #[error("Process exited with code {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("Process timed out after {0:?}")]
    Timeout(Duration),
    #[error("Process cancelled")]
    Cancelled,
}

impl From<std::io::Error> for RunnerError {
    fn from(e: std::io::Error) -> Self {
        RunnerError::Io(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Invalid share: {0}")]
    InvalidShare(String),
    #[error("Invalid signing output: {0}")]
    InvalidSignature(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to read config: {0}")]
    Io(String),
    #[error("Unable to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Error categories reported to API callers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InputInvalid,
    SeTransport,
    SeProtocol,
    Unauthorized,
    SubprocessFailed,
    Timeout,
    CryptoFailed,
    IoFailed,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InputInvalid => "InputInvalid",
            ErrorKind::SeTransport => "SeTransport",
            ErrorKind::SeProtocol => "SeProtocol",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::SubprocessFailed => "SubprocessFailed",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::CryptoFailed => "CryptoFailed",
            ErrorKind::IoFailed => "IoFailed",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the orchestrator operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    InputInvalid(String),
    #[error("{0}")]
    SeTransport(String),
    #[error("Secure element returned status word 0x{sw:04X}")]
    SeProtocol { sw: u16 },
    #[error("Signature rejected by secure element")]
    Unauthorized,
    #[error("Process exited with code {exit_code:?}: {stderr}")]
    SubprocessFailed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    CryptoFailed(String),
    #[error("{0}")]
    IoFailed(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InputInvalid(_) => ErrorKind::InputInvalid,
            Error::SeTransport(_) => ErrorKind::SeTransport,
            Error::SeProtocol { .. } => ErrorKind::SeProtocol,
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::SubprocessFailed { .. } => ErrorKind::SubprocessFailed,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::CryptoFailed(_) => ErrorKind::CryptoFailed,
            Error::IoFailed(_) => ErrorKind::IoFailed,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<ApduError> for Error {
    fn from(e: ApduError) -> Self {
        Error::InputInvalid(e.to_string())
    }
}

impl From<SeError> for Error {
    fn from(e: SeError) -> Self {
        match e {
            SeError::Transport(msg) => Error::SeTransport(msg),
            SeError::Protocol { sw } => Error::SeProtocol { sw },
            SeError::MalformedResponse { sw, .. } => Error::SeProtocol { sw },
            SeError::Unauthorized => Error::Unauthorized,
            SeError::InvalidInput(msg) => Error::InputInvalid(msg),
            SeError::Apdu(e) => e.into(),
        }
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidKeyLength(_)
            | CryptoError::InvalidPublicKeyFormat(_)
            | CryptoError::InvalidAddress(_) => Error::InputInvalid(e.to_string()),
            _ => Error::CryptoFailed(e.to_string()),
        }
    }
}

impl From<RunnerError> for Error {
    fn from(e: RunnerError) -> Self {
        match e {
            RunnerError::BinaryNotFound(_) | RunnerError::Io(_) => Error::IoFailed(e.to_string()),
            RunnerError::Failed { exit_code, stderr } => {
                Error::SubprocessFailed { exit_code, stderr }
            }
            RunnerError::Timeout(_) => Error::Timeout(e.to_string()),
            RunnerError::Cancelled => Error::Cancelled,
        }
    }
}

impl From<EnvelopeError> for Error {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::Crypto(e) => e.into(),
            e => Error::CryptoFailed(e.to_string()),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::InputInvalid(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoFailed(e.to_string())
    }
}
