use anyhow::Context;
use std::env;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Writes the table of MPC executables compiled into the library. With the
/// `embedded-binaries` feature every `binaries/<base>_<os>_<arch>[.exe]` built for the target
/// platform is included, otherwise the table is empty.
fn main() -> anyhow::Result<()> {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=MPC_BINARIES_DIR");

    let mut table = String::from("&[\n");
    if env::var_os("CARGO_FEATURE_EMBEDDED_BINARIES").is_some() {
        let dir = match env::var_os("MPC_BINARIES_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(env::var("CARGO_MANIFEST_DIR")?).join("binaries"),
        };
        println!("cargo:rerun-if-changed={}", dir.display());

        let suffix = platform_suffix(
            &env::var("CARGO_CFG_TARGET_OS")?,
            &env::var("CARGO_CFG_TARGET_ARCH")?,
        );
        let mut found = 0;
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("reading MPC binaries from {}", dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(&suffix) || !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path().canonicalize()?;
            writeln!(
                table,
                "    ({name:?}, include_bytes!({:?}) as &[u8]),",
                path.display().to_string()
            )?;
            found += 1;
        }
        if found == 0 {
            anyhow::bail!("no MPC binaries ending in {suffix} in {}", dir.display());
        }
    }
    table.push(']');

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    std::fs::write(out_dir.join("embedded_binaries.rs"), table)?;
    Ok(())
}

/// `_<os>_<arch>[.exe]` with Go's platform names.
fn platform_suffix(os: &str, arch: &str) -> String {
    let os = match os {
        "macos" => "darwin",
        other => other,
    };
    let arch = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64",
        other => other,
    };
    let exe = if os == "windows" { ".exe" } else { "" };
    format!("_{os}_{arch}{exe}")
}
