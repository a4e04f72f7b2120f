//! Log-return adapter (C5).
//!
//! Piggybacks rotated log backup files onto the poll body as synthetic
//! `T0` pins, and deletes each file only once an upload has been
//! confirmed accepted (no `er` in the response). At-least-once, not
//! exactly-once: a crash between "server accepted" and "file deleted"
//! re-uploads the same bytes next cycle, which the server is expected
//! to dedup.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ns_pins::Pin;

/// The reserved pin name log-return uploads ride on (§6 "Reserved pin
/// names": `T0` = log upload).
pub const LOG_RETURN_PIN_NAME: &str = "T0";
const LOG_RETURN_MIME_TYPE: &str = "text/plain";

pub struct LogReturnAdapter {
    dir: PathBuf,
    prefix: String,
}

/// A backup file offered to the server on a poll cycle, paired with the
/// pin built from its contents so the caller can confirm or retain it
/// once the response arrives.
pub struct OfferedBackup {
    pub path: PathBuf,
    pub pin: Pin,
}

impl LogReturnAdapter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        LogReturnAdapter {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// List rotated backup files matching the configured prefix, oldest
    /// first by filename.
    pub fn enumerate_backups(&self) -> io::Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&self.prefix))
            {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Read each backup and build its `T0` pin. Offered only when the
    /// caller's configured input pins include `T0` (§4.5 — the caller
    /// checks this before calling `offer`).
    pub fn offer(&self) -> io::Result<Vec<OfferedBackup>> {
        let mut offered = Vec::new();
        for path in self.enumerate_backups()? {
            let contents = fs::read(&path)?;
            let mut pin = Pin::unset(LOG_RETURN_PIN_NAME);
            pin.set_data(contents, Some(LOG_RETURN_MIME_TYPE.to_owned()));
            offered.push(OfferedBackup { path, pin });
        }
        Ok(offered)
    }

    /// Mark every offered backup as accepted: delete the source file (or
    /// move it to `backups/` under the log directory when `retain` is
    /// set, for operator inspection).
    pub fn confirm_accepted(&self, offered: &[OfferedBackup], retain: bool) -> io::Result<()> {
        if retain {
            let archive_dir = self.dir.join("backups");
            fs::create_dir_all(&archive_dir)?;
            for item in offered {
                let dest = archive_dir.join(item.path.file_name().unwrap_or_default());
                fs::rename(&item.path, dest)?;
            }
        } else {
            for item in offered {
                fs::remove_file(&item.path)?;
            }
        }
        Ok(())
    }

    /// `T0` is only relevant when it is among the configured input pins.
    pub fn is_enabled(input_pin_names: &[impl AsRef<str>]) -> bool {
        input_pin_names
            .iter()
            .any(|n| n.as_ref() == LOG_RETURN_PIN_NAME)
    }
}
