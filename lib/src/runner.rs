use crate::config::Config;
use crate::error::RunnerError;
use log::{debug, error, info};
use std::borrow::Cow;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Prefix of executables materialized for a single run.
pub const EXEC_PREFIX: &str = "mpc-exec-";

/// `(file name, contents)` of the executables compiled in with the `embedded-binaries`
/// feature. Empty without it.
pub static EMBEDDED_BINARIES: &[(&str, &[u8])] =
    include!(concat!(env!("OUT_DIR"), "/embedded_binaries.rs"));

/// `<base>_<os>_<arch>[.exe]` using Go's platform names, matching how the MPC executables are
/// built.
pub fn platform_binary_name(base: &str) -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64",
        other => other,
    };
    format!("{base}_{os}_{arch}{}", std::env::consts::EXE_SUFFIX)
}

/// Runs the keygen and signing executables. Embedded executables are used first, then
/// `bin_dir`.
#[derive(Debug, Clone)]
pub struct Runner {
    embedded: &'static [(&'static str, &'static [u8])],
    bin_dir: PathBuf,
    exec_dir: PathBuf,
    keygen_bin: String,
    signing_bin: String,
    manager_addr: String,
    timeout: Duration,
}

impl Runner {
    pub fn new(config: &Config) -> Self {
        Runner {
            embedded: EMBEDDED_BINARIES,
            bin_dir: config.bin_dir.clone(),
            exec_dir: config.temp_dir.clone(),
            keygen_bin: config.keygen_bin.clone(),
            signing_bin: config.signing_bin.clone(),
            manager_addr: config.manager_addr.clone(),
            timeout: config.timeout(),
        }
    }

    /// Replace the embedded executables.
    pub fn with_embedded(mut self, embedded: &'static [(&'static str, &'static [u8])]) -> Self {
        self.embedded = embedded;
        self
    }

    pub fn keygen_args(&self, threshold: u16, parties: u16, index: u16, output: &Path) -> Vec<OsString> {
        vec![
            "--address".into(),
            self.manager_addr.clone().into(),
            "--threshold".into(),
            threshold.to_string().into(),
            "--number-of-parties".into(),
            parties.to_string().into(),
            "--index".into(),
            index.to_string().into(),
            "--output".into(),
            output.as_os_str().to_owned(),
            "--room".into(),
            "default".into(),
        ]
    }

    pub fn signing_args(&self, parties: &str, data: &str, local_share: &Path) -> Vec<OsString> {
        vec![
            "--address".into(),
            self.manager_addr.clone().into(),
            "--parties".into(),
            parties.into(),
            "--data-to-sign".into(),
            data.into(),
            "--local-share".into(),
            local_share.as_os_str().to_owned(),
        ]
    }

    /// Run keygen, which writes the local share to `output`.
    pub async fn run_keygen(
        &self,
        threshold: u16,
        parties: u16,
        index: u16,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, RunnerError> {
        info!("Starting keygen: threshold {threshold}, parties {parties}, index {index}");
        let args = self.keygen_args(threshold, parties, index, output);
        self.run(&self.keygen_bin, args, cancel).await
    }

    /// Run signing with the share at `local_share`, returning its stdout.
    pub async fn run_signing(
        &self,
        parties: &str,
        data: &str,
        local_share: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, RunnerError> {
        info!("Starting signing with parties {parties}");
        let args = self.signing_args(parties, data, local_share);
        self.run(&self.signing_bin, args, cancel).await
    }

    /// Materialize the platform executable for `base`, run it and remove it again.
    pub async fn run(
        &self,
        base: &str,
        args: Vec<OsString>,
        cancel: &CancellationToken,
    ) -> Result<String, RunnerError> {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }
        let exe = self.materialize(base).await?;
        debug!("Running {} {:?}", exe.display(), args);

        let started = Instant::now();
        let child = spawn(&exe, &args).await?;
        // dropping the child future kills the process
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                info!("{base} cancelled after {:?}", started.elapsed());
                return Err(RunnerError::Cancelled);
            }
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(output) => output?,
                Err(_) => {
                    error!("{base} timed out after {:?}", self.timeout);
                    return Err(RunnerError::Timeout(self.timeout));
                }
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            info!("{base} finished in {:?}", started.elapsed());
            Ok(stdout)
        } else {
            error!(
                "{base} failed after {:?} with {}",
                started.elapsed(),
                output.status
            );
            Err(RunnerError::Failed {
                exit_code: output.status.code(),
                stderr: stderr.trim().to_string(),
            })
        }
    }

    /// Copy the executable into a uniquely named file. The file is removed when the returned
    /// path is dropped.
    async fn materialize(&self, base: &str) -> Result<TempPath, RunnerError> {
        let name = platform_binary_name(base);
        let embedded = self.embedded.iter().find(|(n, _)| *n == name.as_str());
        let payload: Cow<'static, [u8]> = match embedded {
            Some(&(_, bytes)) => {
                debug!("Using embedded {name}");
                Cow::Borrowed(bytes)
            }
            None => {
                let source = self.bin_dir.join(&name);
                let bytes = tokio::fs::read(&source).await.map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => {
                        RunnerError::BinaryNotFound(source.display().to_string())
                    }
                    _ => RunnerError::Io(format!("{}: {e}", source.display())),
                })?;
                Cow::Owned(bytes)
            }
        };

        tokio::fs::create_dir_all(&self.exec_dir).await?;
        let exec_dir = self.exec_dir.clone();
        tokio::task::spawn_blocking(move || write_executable(&exec_dir, &payload))
            .await
            .map_err(|e| RunnerError::Io(format!("writing {name}: {e}")))?
    }
}

fn write_executable(dir: &Path, payload: &[u8]) -> Result<TempPath, RunnerError> {
    let mut file = tempfile::Builder::new()
        .prefix(EXEC_PREFIX)
        .suffix(std::env::consts::EXE_SUFFIX)
        .tempfile_in(dir)?;
    file.write_all(payload)?;
    file.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))?;
    }
    // close the write handle before exec
    Ok(file.into_temp_path())
}

async fn spawn(exe: &Path, args: &[OsString]) -> Result<Child, RunnerError> {
    let mut attempts = 0;
    loop {
        let result = Command::new(exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        match result {
            Ok(child) => return Ok(child),
            // a concurrent fork can briefly hold the freshly written file open (ETXTBSY)
            Err(e) if e.raw_os_error() == Some(26) && cfg!(unix) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20 * attempts)).await;
            }
            Err(e) => return Err(RunnerError::Io(format!("{}: {e}", exe.display()))),
        }
    }
}
