//! Inline-or-file policy for command output.
//!
//! Output up to [`SPILLOVER_THRESHOLD`] bytes travels back to the controller
//! inline. Anything larger is written to a uniquely named file in the spool
//! directory and only the absolute path is returned. The broker never
//! deletes a file it handed out; whoever reads the file removes it.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Largest payload returned inline, in bytes.
pub const SPILLOVER_THRESHOLD: usize = 65_000;

/// Permission bits for spilled files (`rw-rw----`).
pub const SPILL_FILE_MODE: u32 = 0o660;

/// Permission bits for the spool directory when the broker creates it.
pub const SPOOL_DIR_MODE: u32 = 0o770;

const SPILL_PREFIX: &str = "result-";
const SPILL_SUFFIX: &str = ".out";

/// Failure to spill a large result to disk.
#[derive(Debug, Error)]
pub enum SpilloverError {
    /// Could not allocate a file in the spool directory.
    #[error("failed to create spool file in {}: {source}", dir.display())]
    Create {
        /// Spool directory that was targeted.
        dir: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The file was created but writing or finalizing it failed.
    #[error("failed to write spool file {}: {source}", path.display())]
    Write {
        /// Path of the partially written file (already removed).
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The spool directory itself could not be prepared.
    #[error("failed to prepare spool directory {}: {source}", dir.display())]
    SpoolDir {
        /// Spool directory path.
        dir: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Outcome of applying the spillover policy to one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Payload small enough to return in the response.
    Inline(Vec<u8>),
    /// Payload written to this absolute path.
    Spilled(PathBuf),
}

impl CommandResult {
    /// Inline bytes, if the result was not spilled.
    pub fn inline(&self) -> Option<&[u8]> {
        match self {
            Self::Inline(bytes) => Some(bytes),
            Self::Spilled(_) => None,
        }
    }

    /// Spill file path, if the result was spilled.
    pub fn filename(&self) -> Option<&Path> {
        match self {
            Self::Inline(_) => None,
            Self::Spilled(path) => Some(path),
        }
    }
}

/// Writes oversized results into a fixed spool directory.
#[derive(Debug, Clone)]
pub struct ResultSpillover {
    spool_dir: PathBuf,
}

impl ResultSpillover {
    /// Create a spillover targeting `spool_dir`. Nothing touches disk yet.
    pub fn new(spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
        }
    }

    /// The configured spool directory.
    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Create the spool directory (mode `rwxrwx---`) if it does not exist.
    ///
    /// An existing directory keeps whatever mode the operator gave it.
    pub fn ensure_spool_dir(&self) -> Result<(), SpilloverError> {
        let dir_err = |source| SpilloverError::SpoolDir {
            dir: self.spool_dir.clone(),
            source,
        };
        if self.spool_dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.spool_dir).map_err(dir_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.spool_dir, fs::Permissions::from_mode(SPOOL_DIR_MODE))
                .map_err(dir_err)?;
        }
        debug!(dir = %self.spool_dir.display(), "created spool directory");
        Ok(())
    }

    /// Apply the policy to `payload`.
    ///
    /// Payloads of at most [`SPILLOVER_THRESHOLD`] bytes come back inline.
    /// Larger ones are written with `O_EXCL` name allocation, so concurrent
    /// calls never collide. A failed write removes the partial file and
    /// reports [`SpilloverError`].
    pub fn apply(&self, payload: Vec<u8>) -> Result<CommandResult, SpilloverError> {
        if payload.len() <= SPILLOVER_THRESHOLD {
            return Ok(CommandResult::Inline(payload));
        }

        let dir = std::path::absolute(&self.spool_dir).map_err(|source| SpilloverError::Create {
            dir: self.spool_dir.clone(),
            source,
        })?;
        let mut temp = tempfile::Builder::new()
            .prefix(SPILL_PREFIX)
            .suffix(SPILL_SUFFIX)
            .tempfile_in(&dir)
            .map_err(|source| SpilloverError::Create {
                dir: dir.clone(),
                source,
            })?;
        let path = temp.path().to_path_buf();
        let write_err = |source| SpilloverError::Write {
            path: path.clone(),
            source,
        };

        // Explicit chmod so the process umask cannot strip group access.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(SPILL_FILE_MODE))
                .map_err(write_err)?;
        }
        temp.write_all(&payload).map_err(write_err)?;
        temp.as_file().sync_all().map_err(write_err)?;
        let (_file, path) = temp.keep().map_err(|e| write_err(e.error))?;

        debug!(path = %path.display(), bytes = payload.len(), "spilled command result");
        Ok(CommandResult::Spilled(path))
    }

    /// Remove a spill file nobody will ever collect.
    ///
    /// Only files inside this spool directory are removed. Returns `true`
    /// when a file was deleted.
    pub fn discard(&self, result: &CommandResult) -> bool {
        let Some(path) = result.filename() else {
            return false;
        };
        let inside_spool = std::path::absolute(&self.spool_dir)
            .is_ok_and(|dir| path.parent() == Some(dir.as_path()));
        if !inside_spool {
            warn!(path = %path.display(), "refusing to discard file outside the spool directory");
            return false;
        }
        match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to discard spill file");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn spool() -> (tempfile::TempDir, ResultSpillover) {
        let dir = tempfile::tempdir().unwrap();
        let spillover = ResultSpillover::new(dir.path());
        (dir, spillover)
    }

    #[test]
    fn at_threshold_is_inline() {
        let (_dir, spillover) = spool();
        let payload = vec![b'x'; SPILLOVER_THRESHOLD];
        let result = spillover.apply(payload.clone()).unwrap();
        assert_eq!(result.inline(), Some(payload.as_slice()));
        assert!(result.filename().is_none());
    }

    #[test]
    fn empty_payload_is_inline() {
        let (_dir, spillover) = spool();
        let result = spillover.apply(Vec::new()).unwrap();
        assert_eq!(result, CommandResult::Inline(Vec::new()));
    }

    #[test]
    fn one_past_threshold_spills() {
        let (dir, spillover) = spool();
        let payload: Vec<u8> = (0..=SPILLOVER_THRESHOLD).map(|i| (i % 251) as u8).collect();
        assert_eq!(payload.len(), 65_001);

        let result = spillover.apply(payload.clone()).unwrap();
        assert!(result.inline().is_none());
        let path = result.filename().unwrap();
        assert!(path.is_absolute());
        assert_eq!(path.parent(), Some(dir.path()));
        assert_eq!(fs::read(path).unwrap(), payload);
    }

    #[cfg(unix)]
    #[test]
    fn spilled_file_mode_is_rw_rw() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, spillover) = spool();
        let result = spillover.apply(vec![0; SPILLOVER_THRESHOLD + 1]).unwrap();
        let mode = fs::metadata(result.filename().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, SPILL_FILE_MODE);
    }

    #[test]
    fn spilled_file_name_has_prefix() {
        let (_dir, spillover) = spool();
        let result = spillover.apply(vec![1; 70_000]).unwrap();
        let name = result.filename().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(SPILL_PREFIX));
        assert!(name.ends_with(SPILL_SUFFIX));
    }

    #[test]
    fn missing_spool_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let spillover = ResultSpillover::new(dir.path().join("gone"));
        let err = spillover.apply(vec![0; 100_000]).unwrap_err();
        assert_matches!(err, SpilloverError::Create { .. });
    }

    #[test]
    fn small_payload_ignores_missing_spool_dir() {
        let spillover = ResultSpillover::new("/nonexistent/fleetplex/spool");
        assert!(spillover.apply(vec![0; 10]).is_ok());
    }

    #[test]
    fn concurrent_spills_never_collide() {
        let (_dir, spillover) = spool();
        let spillover = Arc::new(spillover);
        let handles: Vec<_> = (0..16u8)
            .map(|i| {
                let s = Arc::clone(&spillover);
                std::thread::spawn(move || s.apply(vec![i; 66_000]).unwrap())
            })
            .collect();
        let paths: HashSet<PathBuf> = handles
            .into_iter()
            .map(|h| h.join().unwrap().filename().unwrap().to_path_buf())
            .collect();
        assert_eq!(paths.len(), 16);
        for path in &paths {
            let bytes = fs::read(path).unwrap();
            assert_eq!(bytes.len(), 66_000);
            assert!(bytes.iter().all(|b| *b == bytes[0]));
        }
    }

    #[test]
    fn spilled_file_survives_apply() {
        let (_dir, spillover) = spool();
        let result = spillover.apply(vec![7; 80_000]).unwrap();
        drop(spillover);
        assert!(result.filename().unwrap().exists());
    }

    #[test]
    fn ensure_spool_dir_creates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a").join("spool");
        let spillover = ResultSpillover::new(&target);
        spillover.ensure_spool_dir().unwrap();
        assert!(target.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&target).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, SPOOL_DIR_MODE);
        }
        spillover.ensure_spool_dir().unwrap();
    }

    #[test]
    fn discard_removes_spilled_file() {
        let (_dir, spillover) = spool();
        let result = spillover.apply(vec![3; 70_000]).unwrap();
        let path = result.filename().unwrap().to_path_buf();
        assert!(spillover.discard(&result));
        assert!(!path.exists());
        assert!(!spillover.discard(&result));
    }

    #[test]
    fn discard_ignores_inline_result() {
        let (_dir, spillover) = spool();
        assert!(!spillover.discard(&CommandResult::Inline(b"ok".to_vec())));
    }

    #[test]
    fn discard_refuses_foreign_path() {
        let (_dir, spillover) = spool();
        let other = tempfile::NamedTempFile::new().unwrap();
        let foreign = CommandResult::Spilled(other.path().to_path_buf());
        assert!(!spillover.discard(&foreign));
        assert!(other.path().exists());
    }

    #[test]
    fn error_display_names_path() {
        let err = SpilloverError::Create {
            dir: PathBuf::from("/var/run/fleetplex"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/var/run/fleetplex"));
        assert!(msg.contains("denied"));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn exactly_one_side_populated(len in (SPILLOVER_THRESHOLD - 64)..(SPILLOVER_THRESHOLD + 64), byte in any::<u8>()) {
                let (_dir, spillover) = spool();
                let payload = vec![byte; len];
                let result = spillover.apply(payload.clone()).unwrap();
                if len <= SPILLOVER_THRESHOLD {
                    prop_assert_eq!(result.inline(), Some(payload.as_slice()));
                } else {
                    let path = result.filename().unwrap();
                    prop_assert_eq!(fs::read(path).unwrap(), payload);
                }
            }
        }
    }
}
