//! File layout of the storage directory, and the staged writes that keep a batch's files consistent.
//!
//! Issuance writes the primary domain's key and certificate to staged paths (`<domain>.key.new`,
//! `<domain>.crt.new`). The other domains of the batch get byte copies of these staged files. Only once every staged
//! file exists are they renamed onto their final names, so a failed cycle leaves every final file untouched. A failed
//! rename rolls back the ones before it.

use crate::util::{CERT_FILE_MODE, KEY_FILE_MODE};
use anyhow::{Context, bail};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

const STAGED_SUFFIX: &str = ".new";
const BACKUP_SUFFIX: &str = ".old";

#[derive(Debug, Clone)]
pub struct Storage {
    directory: PathBuf,
}

impl Storage {
    pub fn new(directory: PathBuf) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.directory.join(format!("{domain}.key"))
    }

    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.directory.join(format!("{domain}.crt"))
    }

    pub fn staged_key_path(&self, domain: &str) -> PathBuf {
        self.directory.join(format!("{domain}.key{STAGED_SUFFIX}"))
    }

    pub fn staged_cert_path(&self, domain: &str) -> PathBuf {
        self.directory.join(format!("{domain}.crt{STAGED_SUFFIX}"))
    }

    /// Copies the staged key and certificate of the batch's first domain to the staged paths of every other domain.
    ///
    /// Stops at the first failing copy.
    pub fn replicate(&self, domains: &[String]) -> anyhow::Result<()> {
        let Some((primary, secondaries)) = domains.split_first() else {
            return Ok(());
        };
        let src_key = self.staged_key_path(primary);
        let src_cert = self.staged_cert_path(primary);
        for domain in secondaries {
            copy_with_mode(&src_key, &self.staged_key_path(domain), KEY_FILE_MODE)?;
            copy_with_mode(&src_cert, &self.staged_cert_path(domain), CERT_FILE_MODE)?;
            debug!("Replicated certificate of {primary} to {domain}");
        }
        Ok(())
    }

    /// Moves every staged file of the batch onto its final name.
    ///
    /// Existing final files are first moved aside to `<name>.old`. If any step fails, the files installed so far are
    /// removed and the old ones put back, so the batch's final files are either all replaced or all unchanged.
    pub fn commit(&self, domains: &[String]) -> anyhow::Result<()> {
        let moves: Vec<(PathBuf, PathBuf)> = domains
            .iter()
            .flat_map(|domain| {
                [
                    (self.staged_key_path(domain), self.key_path(domain)),
                    (self.staged_cert_path(domain), self.cert_path(domain)),
                ]
            })
            .collect();
        for (_, target) in &moves {
            ensure_replaceable(target)?;
        }

        let mut backed_up = Vec::new();
        for (_, target) in &moves {
            match std::fs::rename(target, backup_path(target)) {
                Ok(()) => backed_up.push(target.as_path()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    roll_back(&[], &backed_up);
                    return Err(e).context(format!("Moving {} aside failed", target.display()));
                }
            }
        }

        let mut installed = Vec::new();
        for (staged, target) in &moves {
            if let Err(e) = std::fs::rename(staged, target) {
                roll_back(&installed, &backed_up);
                return Err(e).context(format!(
                    "Moving {} to {} failed",
                    staged.display(),
                    target.display()
                ));
            }
            installed.push(target.as_path());
        }

        for target in backed_up {
            let backup = backup_path(target);
            if let Err(e) = std::fs::remove_file(&backup) {
                warn!("Could not remove previous file {}: {e}", backup.display());
            }
        }
        Ok(())
    }

    /// Deletes whatever staged files of the batch exist. Failures are only logged.
    pub fn discard(&self, domains: &[String]) {
        for domain in domains {
            for staged in [self.staged_key_path(domain), self.staged_cert_path(domain)] {
                match std::fs::remove_file(&staged) {
                    Ok(()) => debug!("Removed staged file {}", staged.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Could not remove staged file {}: {e}", staged.display()),
                }
            }
        }
    }
}

fn backup_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Fails unless `target` is absent or a regular file
fn ensure_replaceable(target: &Path) -> anyhow::Result<()> {
    match std::fs::symlink_metadata(target) {
        Ok(metadata) if metadata.is_file() => Ok(()),
        Ok(_) => bail!("{} exists and is not a regular file", target.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(format!("Inspecting {} failed", target.display())),
    }
}

/// Undoes a partial commit: removes `installed` files and moves the backups of `backed_up` files back into place
fn roll_back(installed: &[&Path], backed_up: &[&Path]) {
    for target in installed {
        if let Err(e) = std::fs::remove_file(target) {
            error!("Could not remove partially committed file {}: {e}", target.display());
        }
    }
    for target in backed_up {
        let backup = backup_path(target);
        if let Err(e) = std::fs::rename(&backup, target) {
            error!("Could not restore {} from {}: {e}", target.display(), backup.display());
        }
    }
}

fn copy_with_mode(src: &Path, dst: &Path, mode: u32) -> anyhow::Result<()> {
    let mut source = File::open(src).context(format!("Opening {} failed", src.display()))?;
    let mut destination = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(dst)
        .context(format!("Creating {} failed", dst.display()))?;
    std::io::copy(&mut source, &mut destination)
        .context(format!("Copying {} to {} failed", src.display(), dst.display()))?;
    destination.sync_all()?;
    Ok(())
}
