use crate::apdu::{DEFAULT_APPLET_AID, MAX_AID_LENGTH, MIN_AID_LENGTH};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const KEYGEN_BIN: &str = "gg20_keygen";
pub const SIGNING_BIN: &str = "gg20_signing";

/// Client configuration, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug: bool,
    /// Substring of the reader name. Empty selects the first reader.
    pub card_reader_name: String,
    /// Applet AID as hex.
    pub applet_aid: String,
    /// Share files and materialized executables.
    pub temp_dir: PathBuf,
    /// Directory holding the platform specific MPC executables.
    pub bin_dir: PathBuf,
    pub keygen_bin: String,
    pub signing_bin: String,
    /// Coordination server the MPC executables talk to.
    pub manager_addr: String,
    /// Subprocess timeout in seconds.
    pub timeout: u64,
    pub log_dir: String,
    pub log_file: String,
    pub log_max_size: u64,
    pub log_max_backups: u32,
    pub log_max_age: u32,
    pub log_compress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: false,
            card_reader_name: String::new(),
            applet_aid: hex::encode_upper(DEFAULT_APPLET_AID),
            temp_dir: PathBuf::from("./temp"),
            bin_dir: PathBuf::from("./bin"),
            keygen_bin: KEYGEN_BIN.to_string(),
            signing_bin: SIGNING_BIN.to_string(),
            manager_addr: "http://127.0.0.1:8000".to_string(),
            timeout: DEFAULT_TIMEOUT_SECS,
            log_dir: String::new(),
            log_file: "offline-signer.log".to_string(),
            log_max_size: 10,
            log_max_backups: 10,
            log_max_age: 30,
            log_compress: true,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        // an empty document deserializes to unit, not a map
        if contents.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.applet_aid_bytes()?;
        if self.timeout == 0 {
            return Err(ConfigError::Invalid("timeout must be positive".to_string()));
        }
        if self.keygen_bin.is_empty() || self.signing_bin.is_empty() {
            return Err(ConfigError::Invalid(
                "keygen_bin and signing_bin must be set".to_string(),
            ));
        }
        if self.manager_addr.is_empty() {
            return Err(ConfigError::Invalid("manager_addr must be set".to_string()));
        }
        Ok(())
    }

    pub fn applet_aid_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let cleaned: String = self
            .applet_aid
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let aid = hex::decode(&cleaned)
            .map_err(|e| ConfigError::Invalid(format!("applet_aid: {e}")))?;
        if !(MIN_AID_LENGTH..=MAX_AID_LENGTH).contains(&aid.len()) {
            return Err(ConfigError::Invalid(format!(
                "applet_aid must be {MIN_AID_LENGTH} to {MAX_AID_LENGTH} bytes, got {}",
                aid.len()
            )));
        }
        Ok(aid)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Log file path, when file logging is configured.
    pub fn log_path(&self) -> Option<PathBuf> {
        if self.log_dir.is_empty() {
            None
        } else {
            Some(Path::new(&self.log_dir).join(&self.log_file))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.applet_aid, "A000000062CF0101");
        assert_eq!(config.applet_aid_bytes().unwrap(), DEFAULT_APPLET_AID);
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert_eq!(config.temp_dir, PathBuf::from("./temp"));
        assert_eq!(config.bin_dir, PathBuf::from("./bin"));
        assert_eq!(config.manager_addr, "http://127.0.0.1:8000");
        assert!(config.log_path().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
debug: true
card_reader_name: "ACR122"
applet_aid: "a0 00 00 00 62 cf 01 02"
temp_dir: /var/tmp/signer
timeout: 5
log_dir: /var/log/signer
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.debug);
        assert_eq!(config.card_reader_name, "ACR122");
        assert_eq!(
            config.applet_aid_bytes().unwrap(),
            vec![0xA0, 0x00, 0x00, 0x00, 0x62, 0xCF, 0x01, 0x02]
        );
        assert_eq!(config.temp_dir, PathBuf::from("/var/tmp/signer"));
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.bin_dir, PathBuf::from("./bin"));
        assert_eq!(
            config.log_path(),
            Some(PathBuf::from("/var/log/signer/offline-signer.log"))
        );
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::from_yaml("applet_aid: \"A0\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_yaml("applet_aid: \"XYZ\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_yaml("timeout: 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_yaml("timeout: soon"),
            Err(ConfigError::Parse(_))
        ));
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "manager_addr: \"http://10.0.0.2:8000\"\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.manager_addr, "http://10.0.0.2:8000");
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.yaml")),
            Err(ConfigError::Io(_))
        ));
    }
}
