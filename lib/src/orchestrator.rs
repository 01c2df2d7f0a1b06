use crate::apdu::{MAX_SIGNATURE_LENGTH, MIN_SIGNATURE_LENGTH};
use crate::config::Config;
use crate::crypto::{decode_address, derive_address, random_bytes, user_hash};
use crate::envelope::{
    convert_signature, extract_pubkey, normalize_sign_data, open_share, seal_share, WrapKey,
};
use crate::error::Error;
use crate::record::{self, RecordCount};
use crate::runner::Runner;
use crate::transport::{SeConnector, SeSession};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroize;

/// Distributed key generation for one party.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeygenParams {
    pub threshold: u16,
    pub parties: u16,
    /// 1-based index of this party.
    pub index: u16,
    pub user_name: String,
    /// Share file name inside `temp_dir`, generated when absent.
    #[serde(default)]
    pub filename: Option<String>,
}

impl KeygenParams {
    fn validate(&self) -> Result<(), Error> {
        if self.threshold < 1 {
            return Err(invalid("threshold must be at least 1"));
        }
        if self.parties < 2 {
            return Err(invalid("number of parties must be at least 2"));
        }
        if self.threshold >= self.parties {
            return Err(invalid("threshold must be less than the number of parties"));
        }
        if self.index < 1 || self.index > self.parties {
            return Err(invalid(format!(
                "index must be between 1 and {}",
                self.parties
            )));
        }
        if self.user_name.is_empty() {
            return Err(invalid("user name is empty"));
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct KeygenOutput {
    /// EIP-55 address of the group public key.
    pub address: String,
    /// Encrypted share, only openable with the wrap key held by the secure element.
    pub envelope: Vec<u8>,
}

impl fmt::Debug for KeygenOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeygenOutput")
            .field("address", &self.address)
            .field("envelope", &format!("<{} bytes>", self.envelope.len()))
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct SignParams {
    /// Comma separated indices of the signing parties.
    pub parties: String,
    pub message: String,
    pub user_name: String,
    pub address: String,
    #[serde(rename = "encrypted_key", with = "crate::api::base64_bytes")]
    pub envelope: Vec<u8>,
    /// DER authorization signature over `sha256(user_name) || address`.
    #[serde(with = "crate::api::base64_bytes")]
    pub signature: Vec<u8>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl fmt::Debug for SignParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignParams")
            .field("parties", &self.parties)
            .field("message", &self.message)
            .field("user_name", &self.user_name)
            .field("address", &self.address)
            .field("envelope", &format!("<{} bytes>", self.envelope.len()))
            .field("signature", &hex::encode(&self.signature))
            .field("filename", &self.filename)
            .finish()
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InputInvalid(msg.into())
}

/// Canonical form of a comma separated party list: at least two distinct positive indices.
pub fn parse_parties(csv: &str) -> Result<String, Error> {
    let mut seen = HashSet::new();
    let mut parties = Vec::new();
    for part in csv.split(',') {
        let part = part.trim();
        let index: u16 = part
            .parse()
            .map_err(|_| invalid(format!("party '{part}' is not a positive integer")))?;
        if index == 0 {
            return Err(invalid("party indices start at 1"));
        }
        if !seen.insert(index) {
            return Err(invalid(format!("party {index} is listed twice")));
        }
        parties.push(index.to_string());
    }
    if parties.len() < 2 {
        return Err(invalid("signing needs at least 2 parties"));
    }
    Ok(parties.join(","))
}

fn check_user_name(user_name: &str) -> Result<(), Error> {
    if user_name.is_empty() {
        return Err(invalid("user name is empty"));
    }
    Ok(())
}

fn check_signature(signature: &[u8]) -> Result<(), Error> {
    if !(MIN_SIGNATURE_LENGTH..=MAX_SIGNATURE_LENGTH).contains(&signature.len()) {
        return Err(invalid(format!(
            "signature must be {MIN_SIGNATURE_LENGTH} to {MAX_SIGNATURE_LENGTH} bytes, got {}",
            signature.len()
        )));
    }
    Ok(())
}

/// A bare file name, so that share files stay inside `temp_dir`.
fn plain_file_name(name: &str) -> Result<&str, Error> {
    let path = Path::new(name);
    match path.file_name() {
        Some(file_name) if file_name == path.as_os_str() => Ok(name),
        _ => Err(invalid(format!("'{name}' is not a plain file name"))),
    }
}

fn share_file_name(requested: &Option<String>, prefix: &str) -> Result<String, Error> {
    match requested.as_deref() {
        Some(name) if !name.is_empty() => Ok(plain_file_name(name)?.to_string()),
        _ => Ok(format!("{prefix}-{}.json", hex::encode(random_bytes(8)))),
    }
}

/// Create a file readable only by the current user. Fails when the file exists.
async fn create_private(path: &Path) -> std::io::Result<File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

async fn write_and_sync(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.sync_all().await
}

fn close_session<S: SeSession>(session: S) {
    if let Err(e) = session.close() {
        warn!("Failed to close secure element session: {e}");
    }
}

/// Runs keygen and signing against the MPC executables, keeping each share's wrap key on the
/// secure element. Secure element sessions are serialized; subprocesses may overlap.
pub struct Orchestrator<C: SeConnector> {
    config: Config,
    connector: C,
    runner: Runner,
    se_lock: Mutex<()>,
}

impl<C: SeConnector> Orchestrator<C> {
    pub fn new(config: Config, connector: C) -> Self {
        let runner = Runner::new(&config);
        Orchestrator {
            config,
            connector,
            runner,
            se_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    async fn lock_se(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, ()>, Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            guard = self.se_lock.lock() => Ok(guard),
        }
    }

    async fn share_path(&self, filename: &str) -> Result<PathBuf, Error> {
        tokio::fs::create_dir_all(&self.config.temp_dir).await?;
        Ok(self.config.temp_dir.join(filename))
    }

    /// Run keygen, seal the resulting share and store its wrap key on the secure element.
    pub async fn keygen(
        &self,
        params: &KeygenParams,
        cancel: &CancellationToken,
    ) -> Result<KeygenOutput, Error> {
        params.validate()?;
        let filename = share_file_name(&params.filename, "keygen")?;
        let path = self.share_path(&filename).await?;
        if tokio::fs::try_exists(&path).await? {
            return Err(invalid(format!("share file '{filename}' already exists")));
        }
        let share_file = TempPath::try_from_path(&path)?;

        info!(
            "Keygen for {} as party {} of {} (threshold {})",
            params.user_name, params.index, params.parties, params.threshold
        );
        self.runner
            .run_keygen(params.threshold, params.parties, params.index, &path, cancel)
            .await?;

        let mut share = tokio::fs::read(&path).await?;
        let sealed = extract_pubkey(&share).and_then(|pubkey| {
            let (wrap_key, envelope) = seal_share(&share)?;
            Ok((pubkey, wrap_key, envelope))
        });
        share.zeroize();
        share_file.close()?;
        let (pubkey, wrap_key, envelope) = sealed?;
        let address = derive_address(&pubkey)?;
        let addr = decode_address(&address)?;
        debug!("Group public key {pubkey} has address {address}");

        let slot = {
            let _guard = self.lock_se(cancel).await?;
            let session = self.connector.open().await?;
            let result =
                record::store(&session, &user_hash(&params.user_name), &addr, &wrap_key).await;
            close_session(session);
            result?
        };
        info!(
            "Stored wrap key for {address} in slot {}, {} records held",
            slot.index, slot.count
        );
        Ok(KeygenOutput { address, envelope })
    }

    /// Recover the share with the secure element's wrap key and run signing with it.
    pub async fn sign(
        &self,
        params: &SignParams,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        check_user_name(&params.user_name)?;
        let addr = decode_address(&params.address)?;
        let parties = parse_parties(&params.parties)?;
        let message = normalize_sign_data(&params.message);
        if message.is_empty() {
            return Err(invalid("message is empty"));
        }
        if params.envelope.is_empty() {
            return Err(invalid("encrypted key is empty"));
        }
        check_signature(&params.signature)?;
        let filename = share_file_name(&params.filename, "share")?;

        info!("Signing for {} with parties {parties}", params.user_name);
        let wrap_key: WrapKey = {
            let _guard = self.lock_se(cancel).await?;
            let session = self.connector.open().await?;
            let result = record::read(
                &session,
                &user_hash(&params.user_name),
                &addr,
                &params.signature,
            )
            .await;
            close_session(session);
            result?
        };
        let mut share = open_share(&wrap_key, &params.envelope)?;
        drop(wrap_key);

        let path = match self.share_path(&filename).await {
            Ok(path) => path,
            Err(e) => {
                share.zeroize();
                return Err(e);
            }
        };
        let written = match create_private(&path).await {
            Ok(mut file) => match TempPath::try_from_path(&path) {
                Ok(share_file) => write_and_sync(&mut file, &share).await.map(|_| share_file),
                Err(e) => {
                    let _ = tokio::fs::remove_file(&path).await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };
        share.zeroize();
        let share_file = written?;

        let output = self
            .runner
            .run_signing(&parties, message, &path, cancel)
            .await?;
        share_file.close()?;
        let signature = convert_signature(&output)?;
        info!("Signed message for {}", params.user_name);
        Ok(signature)
    }

    /// Remove the record for (user name, address). Needs a valid authorization signature.
    pub async fn delete(
        &self,
        user_name: &str,
        address: &str,
        signature: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RecordCount, Error> {
        check_user_name(user_name)?;
        let addr = decode_address(address)?;
        check_signature(signature)?;

        let _guard = self.lock_se(cancel).await?;
        let session = self.connector.open().await?;
        let result = record::delete(&session, &user_hash(user_name), &addr, signature).await;
        close_session(session);
        let slot = result?;
        info!(
            "Deleted record for {address} from slot {}, {} records held",
            slot.index, slot.count
        );
        Ok(slot)
    }

    /// Card Production Life Cycle data of the connected card.
    pub async fn get_cplc(&self, cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
        let _guard = self.lock_se(cancel).await?;
        let session = self.connector.open_card().await?;
        let result = record::get_cplc(&session).await;
        close_session(session);
        Ok(result?)
    }
}

#[cfg(feature = "pcsc")]
impl Orchestrator<crate::pcsc::PcscConnector> {
    /// Orchestrator for the PC/SC reader and applet named in `config`.
    pub fn with_pcsc(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let aid = config.applet_aid_bytes()?;
        let connector = crate::pcsc::PcscConnector::new(config.card_reader_name.clone(), aid);
        Ok(Orchestrator::new(config, connector))
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test {
    use super::*;
    use crate::emulator::test::test_applet;
    use crate::emulator::{sign_authorization, EmulatedApplet, EmulatorConnector};
    use crate::envelope::test::share_json;
    use crate::error::ErrorKind;
    use crate::runner::test::install_script;
    use secp256k1::SecretKey;
    use std::sync::Arc;

    pub(crate) const SIGNING_OUTPUT: &str = r#"{"r":{"curve":"secp256k1","scalar":[1,2,3]},"s":{"curve":"secp256k1","scalar":[4,5,6]},"recid":1}"#;

    pub(crate) struct Fixture {
        pub(crate) root: tempfile::TempDir,
        pub(crate) applet: Arc<EmulatedApplet>,
        pub(crate) secret: SecretKey,
        pub(crate) orchestrator: Orchestrator<EmulatorConnector>,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            Self::with_timeout(10)
        }

        pub(crate) fn with_timeout(timeout: u64) -> Self {
            let root = tempfile::tempdir().unwrap();
            let config = Config {
                bin_dir: root.path().join("bin"),
                temp_dir: root.path().join("temp"),
                timeout,
                ..Config::default()
            };
            let bin_dir = config.bin_dir.clone();
            let record = |name: &str| root.path().join(name).display().to_string();
            install_script(
                &bin_dir,
                "gg20_keygen",
                &format!(
                    r#"echo "$@" > "{args}"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift ;;
  esac
  shift
done
cat > "$out" <<'JSON'
{share}
JSON"#,
                    args = record("keygen.args"),
                    share = share_json()
                ),
            );
            install_script(
                &bin_dir,
                "gg20_signing",
                &format!(
                    r#"echo "$@" > "{args}"
share=""
while [ $# -gt 0 ]; do
  case "$1" in
    --local-share) share="$2"; shift ;;
  esac
  shift
done
echo "$share" > "{share_record}"
grep -q y_sum_s "$share" || exit 4
ls -l "$share" | grep -q '^-rw-------' || exit 5
echo '{output}'"#,
                    args = record("signing.args"),
                    share_record = record("signing.share"),
                    output = SIGNING_OUTPUT
                ),
            );
            let (applet, secret) = test_applet();
            let orchestrator = Orchestrator::new(config, EmulatorConnector::new(applet.clone()));
            Fixture {
                root,
                applet,
                secret,
                orchestrator,
            }
        }

        pub(crate) fn temp_entries(&self) -> Vec<String> {
            match std::fs::read_dir(self.root.path().join("temp")) {
                Ok(entries) => entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect(),
                Err(_) => Vec::new(),
            }
        }

        pub(crate) fn recorded(&self, name: &str) -> Option<String> {
            std::fs::read_to_string(self.root.path().join(name))
                .ok()
                .map(|s| s.trim().to_string())
        }

        pub(crate) fn authorize(&self, user_name: &str, address: &str) -> Vec<u8> {
            sign_authorization(
                &self.secret,
                &user_hash(user_name),
                &decode_address(address).unwrap(),
            )
        }

        pub(crate) fn keygen_params(user_name: &str) -> KeygenParams {
            KeygenParams {
                threshold: 1,
                parties: 3,
                index: 1,
                user_name: user_name.to_string(),
                filename: None,
            }
        }

        pub(crate) fn sign_params(&self, user_name: &str, output: &KeygenOutput) -> SignParams {
            SignParams {
                parties: "1,2".to_string(),
                message: "0xdeadbeef".to_string(),
                user_name: user_name.to_string(),
                address: output.address.clone(),
                envelope: output.envelope.clone(),
                signature: self.authorize(user_name, &output.address),
                filename: None,
            }
        }
    }

    #[tokio::test]
    async fn test_keygen_then_sign() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        let output = fixture
            .orchestrator
            .keygen(&Fixture::keygen_params("alice"), &cancel)
            .await
            .unwrap();
        assert_eq!(output.address, "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf");
        assert!(fixture.temp_entries().is_empty());
        assert_eq!(fixture.applet.open_sessions(), 0);

        let args = fixture.recorded("keygen.args").unwrap();
        assert!(args.starts_with(
            "--address http://127.0.0.1:8000 --threshold 1 --number-of-parties 3 --index 1 --output "
        ));
        assert!(args.ends_with("--room default"));

        // the secure element holds the key that opens the envelope
        let wrap_key = fixture
            .applet
            .record(&user_hash("alice"), &decode_address(&output.address).unwrap())
            .unwrap();
        let wrap_key = WrapKey::from_slice(&wrap_key).unwrap();
        let share = open_share(&wrap_key, &output.envelope).unwrap();
        let share: serde_json::Value = serde_json::from_slice(&share).unwrap();
        assert!(share["y_sum_s"]["point"].is_array());

        let signature = fixture
            .orchestrator
            .sign(&fixture.sign_params("alice", &output), &cancel)
            .await
            .unwrap();
        assert_eq!(
            signature,
            format!(
                "0x{}010203{}0405061c",
                "00".repeat(29),
                "00".repeat(29)
            )
        );
        let args = fixture.recorded("signing.args").unwrap();
        assert!(args.starts_with(
            "--address http://127.0.0.1:8000 --parties 1,2 --data-to-sign deadbeef --local-share "
        ));
        let share_path = fixture.recorded("signing.share").unwrap();
        assert!(!Path::new(&share_path).exists());
        assert!(fixture.temp_entries().is_empty());
        assert_eq!(fixture.applet.open_sessions(), 0);
        // signing leaves the record in place
        assert_eq!(fixture.applet.record_count(), 1);
    }

    #[tokio::test]
    async fn test_tampered_envelope() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        let output = fixture
            .orchestrator
            .keygen(&Fixture::keygen_params("alice"), &cancel)
            .await
            .unwrap();
        let mut params = fixture.sign_params("alice", &output);
        params.envelope[20] ^= 0x01;
        let err = fixture.orchestrator.sign(&params, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoFailed);
        assert!(fixture.recorded("signing.args").is_none());
        assert!(fixture.temp_entries().is_empty());
    }

    #[tokio::test]
    async fn test_sign_with_wrong_authorization() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        let output = fixture
            .orchestrator
            .keygen(&Fixture::keygen_params("alice"), &cancel)
            .await
            .unwrap();
        let mut params = fixture.sign_params("alice", &output);
        params.signature = fixture.authorize("mallory", &output.address);
        let err = fixture.orchestrator.sign(&params, &cancel).await.unwrap_err();
        assert_eq!(err, Error::Unauthorized);

        let params = fixture.sign_params("bob", &output);
        let err = fixture.orchestrator.sign(&params, &cancel).await.unwrap_err();
        assert_eq!(err, Error::SeProtocol { sw: 0x6A83 });
        assert_eq!(fixture.applet.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_second_keygen_for_same_user_fails() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        let params = Fixture::keygen_params("alice");
        let first = fixture.orchestrator.keygen(&params, &cancel).await.unwrap();
        let stored = fixture
            .applet
            .record(&user_hash("alice"), &decode_address(&first.address).unwrap());
        let err = fixture
            .orchestrator
            .keygen(&params, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, Error::SeProtocol { sw: 0x6A89 });
        assert_eq!(
            fixture
                .applet
                .record(&user_hash("alice"), &decode_address(&first.address).unwrap()),
            stored
        );
        assert!(fixture.temp_entries().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_keygen() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        let alice = Fixture::keygen_params("alice");
        let bob = Fixture::keygen_params("bob");
        let (a, b) = tokio::join!(
            fixture.orchestrator.keygen(&alice, &cancel),
            fixture.orchestrator.keygen(&bob, &cancel)
        );
        assert_eq!(a.unwrap().address, b.unwrap().address);
        assert_eq!(fixture.applet.record_count(), 2);
        assert_eq!(fixture.applet.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        let output = fixture
            .orchestrator
            .keygen(&Fixture::keygen_params("alice"), &cancel)
            .await
            .unwrap();
        let sig = fixture.authorize("alice", &output.address);
        let slot = fixture
            .orchestrator
            .delete("alice", &output.address, &sig, &cancel)
            .await
            .unwrap();
        assert_eq!(slot, RecordCount { index: 0, count: 0 });

        let err = fixture
            .orchestrator
            .sign(&fixture.sign_params("alice", &output), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, Error::SeProtocol { sw: 0x6A83 });
    }

    #[tokio::test]
    async fn test_get_cplc() {
        let fixture = Fixture::new();
        let cplc = fixture
            .orchestrator
            .get_cplc(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cplc, crate::emulator::EMULATOR_CPLC);
    }

    #[tokio::test]
    async fn test_card_unplugged() {
        let fixture = Fixture::new();
        fixture.applet.set_present(false);
        let err = fixture
            .orchestrator
            .get_cplc(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SeTransport);
        fixture.applet.set_present(true);
        assert!(fixture
            .orchestrator
            .get_cplc(&CancellationToken::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_keygen_validation() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        let base = Fixture::keygen_params("alice");
        let cases = [
            KeygenParams {
                threshold: 0,
                ..base.clone()
            },
            KeygenParams {
                threshold: 3,
                ..base.clone()
            },
            KeygenParams {
                parties: 1,
                ..base.clone()
            },
            KeygenParams {
                index: 0,
                ..base.clone()
            },
            KeygenParams {
                index: 4,
                ..base.clone()
            },
            KeygenParams {
                user_name: String::new(),
                ..base.clone()
            },
            KeygenParams {
                filename: Some("../share.json".to_string()),
                ..base.clone()
            },
            KeygenParams {
                filename: Some("..".to_string()),
                ..base.clone()
            },
        ];
        for params in cases {
            let err = fixture.orchestrator.keygen(&params, &cancel).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InputInvalid, "{params:?}");
        }
        assert!(fixture.recorded("keygen.args").is_none());
        assert_eq!(fixture.applet.record_count(), 0);
    }

    #[tokio::test]
    async fn test_sign_validation() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        let output = KeygenOutput {
            address: "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf".to_string(),
            envelope: vec![0xAA; 64],
        };
        let base = fixture.sign_params("alice", &output);
        let cases = [
            SignParams {
                parties: "1".to_string(),
                ..base.clone()
            },
            SignParams {
                parties: "1,1".to_string(),
                ..base.clone()
            },
            SignParams {
                parties: "0,2".to_string(),
                ..base.clone()
            },
            SignParams {
                parties: "a,b".to_string(),
                ..base.clone()
            },
            SignParams {
                message: "0x".to_string(),
                ..base.clone()
            },
            SignParams {
                user_name: String::new(),
                ..base.clone()
            },
            SignParams {
                address: "0x1234".to_string(),
                ..base.clone()
            },
            SignParams {
                envelope: vec![],
                ..base.clone()
            },
            SignParams {
                signature: vec![0x30; 4],
                ..base.clone()
            },
        ];
        for params in cases {
            let err = fixture.orchestrator.sign(&params, &cancel).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InputInvalid, "{params:?}");
        }
        assert_eq!(fixture.applet.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_signing_failure_cleans_up() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        let output = fixture
            .orchestrator
            .keygen(&Fixture::keygen_params("alice"), &cancel)
            .await
            .unwrap();
        install_script(
            &fixture.orchestrator.config().bin_dir,
            "gg20_signing",
            "echo 'party 2 unreachable' >&2; exit 2",
        );
        let err = fixture
            .orchestrator
            .sign(&fixture.sign_params("alice", &output), &cancel)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::SubprocessFailed {
                exit_code: Some(2),
                stderr: "party 2 unreachable".to_string()
            }
        );
        assert!(fixture.temp_entries().is_empty());
    }

    #[tokio::test]
    async fn test_keygen_timeout_and_cancel() {
        let fixture = Fixture::with_timeout(1);
        install_script(
            &fixture.orchestrator.config().bin_dir,
            "gg20_keygen",
            "sleep 30",
        );
        let params = KeygenParams {
            filename: Some("alice.json".to_string()),
            ..Fixture::keygen_params("alice")
        };
        let err = fixture
            .orchestrator
            .keygen(&params, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(fixture.temp_entries().is_empty());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fixture
            .orchestrator
            .keygen(&params, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Cancelled);
        let err = fixture.orchestrator.get_cplc(&cancel).await.unwrap_err();
        assert_eq!(err, Error::Cancelled);
        assert!(fixture.temp_entries().is_empty());
    }

    #[tokio::test]
    async fn test_keygen_output_without_share() {
        let fixture = Fixture::new();
        install_script(
            &fixture.orchestrator.config().bin_dir,
            "gg20_keygen",
            "exit 0",
        );
        let err = fixture
            .orchestrator
            .keygen(&Fixture::keygen_params("alice"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailed);
        assert_eq!(fixture.applet.record_count(), 0);
    }

    #[tokio::test]
    async fn test_keygen_keeps_existing_file() {
        let fixture = Fixture::new();
        let ran = fixture.root.path().join("keygen.ran");
        install_script(
            &fixture.orchestrator.config().bin_dir,
            "gg20_keygen",
            &format!("touch \"{}\"; exit 1", ran.display()),
        );
        let temp_dir = fixture.root.path().join("temp");
        std::fs::create_dir_all(&temp_dir).unwrap();
        let existing = temp_dir.join("keep.json");
        std::fs::write(&existing, "unrelated").unwrap();

        let mut params = Fixture::keygen_params("alice");
        params.filename = Some("keep.json".to_string());
        let err = fixture
            .orchestrator
            .keygen(&params, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InputInvalid);
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "unrelated");
        assert!(!ran.exists());
    }

    #[test]
    fn test_parse_parties() {
        assert_eq!(parse_parties("1,2").unwrap(), "1,2");
        assert_eq!(parse_parties(" 3, 1 ,2").unwrap(), "3,1,2");
        assert!(parse_parties("").is_err());
        assert!(parse_parties("1,").is_err());
        assert!(parse_parties("1,-2").is_err());
    }

    #[test]
    fn test_plain_file_name() {
        assert!(plain_file_name("share.json").is_ok());
        assert!(plain_file_name("dir/share.json").is_err());
        assert!(plain_file_name("/share.json").is_err());
        assert!(plain_file_name(".").is_err());
        let generated = share_file_name(&None, "keygen").unwrap();
        assert!(generated.starts_with("keygen-") && generated.ends_with(".json"));
        assert_ne!(generated, share_file_name(&None, "keygen").unwrap());
    }

    #[tokio::test]
    async fn test_create_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("share.json");
        let mut file = create_private(&path).await.unwrap();
        write_and_sync(&mut file, b"{}").await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(create_private(&path).await.is_err());
    }
}
