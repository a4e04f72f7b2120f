// ns-updater: firmware/binary self-update backing the rc=4 upgrade hook.
//
// Checks GitHub Releases for a newer version, downloads and verifies the
// release archive, and stages the replacement binary for atomic
// replacement of the running process.

use std::io::Write;
use std::path::{Path, PathBuf};

use semver::Version;
use sha2::{Digest, Sha256};
use tracing::info;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Status of an update check / download cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate,
    Available { version: String },
    Downloaded { version: String },
}

// ---------------------------------------------------------------------------
// UpdateChecker
// ---------------------------------------------------------------------------

/// Checks for, downloads, and applies updates from GitHub Releases.
///
/// Releases are tagged per-client-type, e.g. `netsender-v0.1.0`, with
/// assets named like `netsender-v0.1.0-x86_64-unknown-linux-gnu.tar.gz`.
pub struct UpdateChecker {
    repo_owner: String,
    repo_name: String,
    client_type: String,
    current_version: Version,
}

impl UpdateChecker {
    /// Create a new `UpdateChecker`.
    ///
    /// # Errors
    ///
    /// Returns an error if `current_version_str` is not valid semver.
    pub fn new(
        repo_owner: impl Into<String>,
        repo_name: impl Into<String>,
        client_type: impl Into<String>,
        current_version_str: &str,
    ) -> Result<Self, semver::Error> {
        let current_version = Version::parse(current_version_str)?;
        Ok(Self {
            repo_owner: repo_owner.into(),
            repo_name: repo_name.into(),
            client_type: client_type.into(),
            current_version,
        })
    }

    /// Check GitHub for a newer release of this client type.
    ///
    /// # Errors
    ///
    /// Returns an error if the GitHub API call fails.
    pub async fn check(&self) -> Result<UpdateStatus, Box<dyn std::error::Error + Send + Sync>> {
        let owner = self.repo_owner.clone();
        let name = self.repo_name.clone();
        let client_type = self.client_type.clone();
        let current = self.current_version.clone();

        tokio::task::spawn_blocking(move || check_blocking(&owner, &name, &client_type, &current))
            .await?
    }

    /// Download the release matching `version`, verify its checksum, and
    /// stage the binary next to the running executable.
    ///
    /// Returns the path to the staged binary.
    ///
    /// # Errors
    ///
    /// Returns an error if the release cannot be found, downloaded, or
    /// verified.
    pub async fn download(
        &self,
        version: &str,
    ) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
        let owner = self.repo_owner.clone();
        let name = self.repo_name.clone();
        let client_type = self.client_type.clone();
        let version = version.to_owned();

        tokio::task::spawn_blocking(move || download_blocking(&owner, &name, &client_type, &version))
            .await?
    }

    /// Replace the running binary with the staged binary and exit the
    /// process. The reconciliation loop calls this after pushing
    /// `md=Completed` via the vars endpoint (§4.4 step 7).
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement fails.
    pub fn apply_and_exit(
        staged_path: &Path,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(path = %staged_path.display(), "replacing running binary with staged upgrade");
        self_replace::self_replace(staged_path)?;
        let _ = std::fs::remove_file(staged_path);
        info!("binary replaced successfully — exiting for restart");
        std::process::exit(0);
    }
}

// ---------------------------------------------------------------------------
// Helpers – tag parsing
// ---------------------------------------------------------------------------

fn parse_version_from_tag(tag: &str, client_type: &str) -> Option<Version> {
    let prefix = format!("{client_type}-v");
    let version_str = tag.strip_prefix(&prefix)?;
    Version::parse(version_str).ok()
}

fn stage_root_dir(exe_dir: &Path) -> PathBuf {
    stage_root_dir_from(std::env::var_os("NS_UPDATER_STAGE_DIR"), exe_dir)
}

fn stage_root_dir_from(env_value: Option<std::ffi::OsString>, exe_dir: &Path) -> PathBuf {
    match env_value {
        Some(v) if !v.is_empty() => PathBuf::from(v),
        _ => exe_dir.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Blocking implementations (run inside spawn_blocking)
// ---------------------------------------------------------------------------

fn check_blocking(
    repo_owner: &str,
    repo_name: &str,
    client_type: &str,
    current_version: &Version,
) -> Result<UpdateStatus, Box<dyn std::error::Error + Send + Sync>> {
    tracing::debug!(
        client_type,
        current = %current_version,
        "checking for updates"
    );

    let releases = self_update::backends::github::ReleaseList::configure()
        .repo_owner(repo_owner)
        .repo_name(repo_name)
        .build()?
        .fetch()?;

    let mut best: Option<(Version, String)> = None;
    for release in &releases {
        if let Some(ver) = parse_version_from_tag(&release.version, client_type) {
            if best.as_ref().is_none_or(|(v, _)| ver > *v) {
                best = Some((ver, release.version.clone()));
            }
        }
    }

    match best {
        Some((ver, _tag)) if ver > *current_version => {
            info!(latest = %ver, current = %current_version, "update available");
            Ok(UpdateStatus::Available {
                version: ver.to_string(),
            })
        }
        _ => {
            tracing::debug!("already up to date");
            Ok(UpdateStatus::UpToDate)
        }
    }
}

fn download_blocking(
    repo_owner: &str,
    repo_name: &str,
    client_type: &str,
    version: &str,
) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
    let tag = format!("{client_type}-v{version}");
    let target = self_update::get_target();

    info!(tag = %tag, target = %target, "downloading release");

    let releases = self_update::backends::github::ReleaseList::configure()
        .repo_owner(repo_owner)
        .repo_name(repo_name)
        .build()?
        .fetch()?;

    let release = releases
        .iter()
        .find(|r| r.version == tag)
        .ok_or_else(|| format!("release not found for tag {tag}"))?;

    let asset = select_archive_asset(&release.assets, target)
        .ok_or_else(|| format!("no archive asset found for target {target} in release {tag}"))?;

    let current_exe = std::env::current_exe()?;
    let exe_dir = current_exe
        .parent()
        .ok_or("cannot determine executable directory")?;
    let stage_root = stage_root_dir(exe_dir);
    std::fs::create_dir_all(&stage_root)?;
    let tmp_dir = tempfile::tempdir_in(&stage_root)?;
    let tmp_archive = tmp_dir.path().join(&asset.name);

    {
        let mut out = std::fs::File::create(&tmp_archive)?;
        self_update::Download::from_url(&asset.download_url)
            .set_header(reqwest::header::ACCEPT, "application/octet-stream".parse()?)
            .download_to(&mut out)?;
        out.flush()?;
    }

    verify_sha256(&release.assets, &asset.name, &tmp_archive)?;

    let extract_dir = tmp_dir.path().join("extracted");
    std::fs::create_dir_all(&extract_dir)?;
    self_update::Extract::from_source(&tmp_archive).extract_into(&extract_dir)?;

    let staged_bin = find_extracted_binary(&extract_dir, client_type)?;

    let staged_path = stage_root.join(format!(".{client_type}-staged"));
    std::fs::copy(&staged_bin, &staged_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&staged_path, std::fs::Permissions::from_mode(0o755))?;
    }

    info!(path = %staged_path.display(), "binary staged successfully");
    Ok(staged_path)
}

/// Download the `.sha256` sidecar and verify the archive's hash. The
/// sidecar is required — there is no "trust the archive" fallback.
fn verify_sha256(
    assets: &[self_update::update::ReleaseAsset],
    asset_name: &str,
    archive_path: &Path,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let sha_asset_name = format!("{asset_name}.sha256");

    let sha_asset = assets
        .iter()
        .find(|a| a.name == sha_asset_name)
        .ok_or_else(|| format!("missing required sha256 sidecar asset: {sha_asset_name}"))?;

    let mut sha_buf: Vec<u8> = Vec::new();
    self_update::Download::from_url(&sha_asset.download_url)
        .set_header(reqwest::header::ACCEPT, "application/octet-stream".parse()?)
        .download_to(&mut sha_buf)?;

    let sha_text = String::from_utf8(sha_buf)?;
    let expected_hash = sha_text
        .split_whitespace()
        .next()
        .ok_or("empty .sha256 sidecar file")?
        .to_lowercase();

    let archive_bytes = std::fs::read(archive_path)?;
    let actual_hash = hex::encode(Sha256::digest(&archive_bytes));

    if actual_hash != expected_hash {
        return Err(format!("sha256 mismatch: expected {expected_hash}, got {actual_hash}").into());
    }

    info!("sha256 verification passed");
    Ok(())
}

fn select_archive_asset<'a>(
    assets: &'a [self_update::update::ReleaseAsset],
    target: &str,
) -> Option<&'a self_update::update::ReleaseAsset> {
    assets.iter().find(|asset| {
        let name = asset.name.as_str();
        name.contains(target) && is_supported_archive_name(name)
    })
}

fn is_supported_archive_name(name: &str) -> bool {
    if name.to_ascii_lowercase().ends_with(".tar.gz") {
        return true;
    }
    std::path::Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

fn find_extracted_binary(
    extract_dir: &Path,
    client_type: &str,
) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
    let exe_name = format!("{client_type}.exe");

    for entry in std::fs::read_dir(extract_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name == client_type || name == exe_name {
                    return Ok(path);
                }
            }
        }
    }

    for entry in std::fs::read_dir(extract_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() {
            return Ok(path);
        }
    }

    Err(format!("no binary found in extracted archive for {client_type}").into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
