//! Destination path derivation for remote URLs
//!
//! Every URL maps to `<temp_dir>/<md5(url) as lowercase hex>/<decoded last path segment>`.
//! The hash directory keeps two URLs that share a file name apart, and the mapping is a
//! pure function of the URL string, so re-queuing a URL lands on the same partial file.

use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{Error, Result};

/// File name used when the URL has no usable path segment
const FALLBACK_FILE_NAME: &str = "download";

/// Characters that cannot appear in a file name on at least one supported platform
const RESERVED_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Where a URL's bytes are written locally
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    /// The parsed URL
    pub url: Url,
    /// Full path of the output file
    pub path: PathBuf,
    /// Decoded file name (also the default display name)
    pub file_name: String,
}

impl Destination {
    /// The hash-named directory holding the file
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(&self.path)
    }
}

/// Parse a URL, rejecting anything that is not absolute and hierarchical
pub fn parse_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim()).map_err(|e| Error::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    if parsed.cannot_be_a_base() {
        return Err(Error::InvalidUrl {
            url: url.to_string(),
            reason: "URL has no hierarchical path".to_string(),
        });
    }

    Ok(parsed)
}

/// Compute the local destination for `url` under `base`
///
/// # Examples
///
/// ```
/// use enclosure_dl::paths::derive_destination;
/// use std::path::Path;
///
/// let url = "http://example.com/feeds/My%20Show.mp3";
/// let dest = derive_destination(Path::new("/tmp/dl"), url).unwrap();
/// assert_eq!(dest.file_name, "My Show.mp3");
/// assert!(dest.path.starts_with("/tmp/dl"));
/// assert!(dest.path.ends_with("My Show.mp3"));
/// ```
pub fn derive_destination(base: &Path, url: &str) -> Result<Destination> {
    let parsed = parse_url(url)?;
    let dir_name = url_hash(url.trim());
    let file_name = file_name_for(&parsed);

    Ok(Destination {
        path: base.join(dir_name).join(&file_name),
        url: parsed,
        file_name,
    })
}

/// Lowercase hex MD5 of the URL string
///
/// [`derive_destination`] hashes the string with surrounding whitespace trimmed, the same
/// form [`parse_url`] accepts.
pub fn url_hash(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

/// Percent-decoded, filesystem-safe last non-empty path segment
fn file_name_for(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()));

    let Some(segment) = segment else {
        return FALLBACK_FILE_NAME.to_string();
    };

    let decoded = match urlencoding::decode(segment) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(segment.as_bytes()))
            .into_owned(),
    };

    sanitize_file_name(&decoded)
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if RESERVED_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}
