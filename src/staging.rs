//! Cross-process staging of the payload into the cache directory.
//!
//! Each `(identifier, attempt)` pair owns a slot:
//! `apps/<identifier>/<attempt>` holds the extracted tree and
//! `locks/<identifier>/<attempt>` exists while an extraction is in flight.
//! An app dir without a lock is complete and reused as is. A locked slot is
//! never waited on; the next attempt is tried instead.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
    error::StagingError,
    extract::{extract_with, ExtractOptions},
    footer::Config,
    progress::{Progress, TICK_INTERVAL},
    settings::Settings,
};


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLocation {
    pub app_dir: PathBuf,
    pub lock_dir: PathBuf,
}

impl StagingLocation {
    pub fn new(temp_dir: &Path, identifier: &str, attempt: u64) -> Self {
        let attempt = attempt.to_string();
        StagingLocation {
            app_dir: temp_dir.join("apps").join(identifier).join(&attempt),
            lock_dir: temp_dir.join("locks").join(identifier).join(&attempt),
        }
    }
}

enum Claim {
    Reuse(PathBuf),
    Extract(StagingLocation),
}

/// Returns the directory holding the fully extracted application,
/// unpacking the payload first if no completed slot exists.
pub fn prepare(settings: &Settings, config: &Config, payload: &[u8]) -> Result<PathBuf, StagingError> {
    prepare_with(settings, config, payload, &ExtractOptions::default(), io::stderr())
}

pub fn prepare_with<W>(
    settings: &Settings,
    config: &Config,
    payload: &[u8],
    options: &ExtractOptions,
    progress_sink: W,
) -> Result<PathBuf, StagingError>
where
    W: Write + Send + 'static,
{
    let slot = match claim(&settings.temp_dir, &config.identifier)? {
        Claim::Reuse(app_dir) => return Ok(app_dir),
        Claim::Extract(slot) => slot,
    };

    let progress = config.message()
        .map(|message| Progress::start(message, TICK_INTERVAL, progress_sink));

    let result = fs::create_dir_all(&slot.app_dir)
        .map_err(|source| StagingError::CreateApp { path: slot.app_dir.clone(), source })
        .and_then(|_| extract_with(payload, &slot.app_dir, options).map_err(StagingError::from));

    if let Some(progress) = progress {
        progress.stop()
    }

    match result {
        Ok(()) => {
            if let Err(err) = fs::remove_dir_all(&slot.lock_dir) {
                warn!(lock = %slot.lock_dir.display(), "failed to release lock: {err}");
            }
            info!(app_dir = %slot.app_dir.display(), "payload extracted");
            Ok(slot.app_dir)
        }
        Err(err) => {
            warn!(app_dir = %slot.app_dir.display(), "extraction failed, cleaning up: {err}");
            let _ = fs::remove_dir_all(&slot.app_dir);
            let _ = fs::remove_dir_all(&slot.lock_dir);
            Err(err)
        }
    }
}

fn claim(temp_dir: &Path, identifier: &str) -> Result<Claim, StagingError> {
    let mut attempt = 0u64;
    loop {
        let slot = StagingLocation::new(temp_dir, identifier, attempt);
        if slot.app_dir.is_dir() {
            if !slot.lock_dir.exists() {
                debug!(attempt, app_dir = %slot.app_dir.display(), "reusing extracted application");
                return Ok(Claim::Reuse(slot.app_dir))
            }
            debug!(attempt, "slot locked by another extraction, advancing");
            attempt += 1;
            continue
        }
        // Not an exclusive claim: two racing processes may both land here
        // for the same attempt and extract the same content side by side.
        fs::create_dir_all(&slot.lock_dir)
            .map_err(|source| StagingError::CreateLock { path: slot.lock_dir.clone(), source })?;
        debug!(attempt, lock = %slot.lock_dir.display(), "claimed slot");
        return Ok(Claim::Extract(slot))
    }
}
