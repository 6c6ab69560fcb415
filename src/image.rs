//! Splits the running artifact into its footer descriptor and payload.
//!
//! Layout: `[stub] "\nCAXACAXACAXA\n" [payload] "\n" [json footer]`

use std::{env::current_exe, fs};

use tracing::debug;

use crate::{
    error::{CaxaError, CaxaResult, ImageError},
    footer::Config,
};


pub const SEPARATOR: &[u8] = b"\nCAXACAXACAXA\n";

#[derive(Debug)]
pub struct SelfImage<'a> {
    pub config: Config,
    pub payload: &'a [u8],
}

/// Reads the current executable from disk.
pub fn read_self() -> CaxaResult<Vec<u8>> {
    let path = current_exe().map_err(CaxaError::SelfExe)?;
    debug!(path = %path.display(), "reading self image");
    fs::read(&path).map_err(|source| CaxaError::SelfRead { path, source })
}

pub fn split(data: &[u8]) -> Result<SelfImage<'_>, ImageError> {
    let footer_idx = data.iter()
        .rposition(|&b| b == b'\n')
        .ok_or(ImageError::FooterMissing)?;
    let config = Config::parse(&data[footer_idx + 1..])?;

    // The stub itself precedes the payload, so search backwards from the footer
    let payload_start = rfind(&data[..footer_idx], SEPARATOR)
        .ok_or(ImageError::SeparatorMissing)? + SEPARATOR.len();
    let payload = &data[payload_start..footer_idx];

    debug!(
        identifier = %config.identifier,
        payload_start,
        payload_len = payload.len(),
        "split self image"
    );
    Ok(SelfImage { config, payload })
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
