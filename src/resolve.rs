//! Maps a listing entry to a directly fetchable URL and a local filename.
//!
//! Both functions are pure: listing and download call them independently
//! and must agree.

use url::Url;

use crate::error::{Error, Result};
use crate::fs::sanitize_filename;
use crate::platform::{PlatformSource, SourceKind};
use crate::source::ListingEntry;

/// Host serving raw repository content.
pub const RAW_GITHUB_BASE: &str = "https://raw.githubusercontent.com";

fn encode_path(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn parse(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))
}

/// Resolves `entry` of `platform` to a concrete download URL.
///
/// 1. GitHub tree sources map to `raw.githubusercontent.com/{owner}/{repo}/{branch}/{reference}`.
/// 2. GitHub blob sources map to the blob's own file on the raw host.
/// 3. Anything else joins the reference onto the source URL.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] if the source URL is not absolute.
pub fn resolve(platform: &PlatformSource, entry: &ListingEntry) -> Result<String> {
    let url = match platform.kind()? {
        SourceKind::GithubTree {
            owner,
            repo,
            branch,
            ..
        } => parse(&format!(
            "{RAW_GITHUB_BASE}/{owner}/{repo}/{branch}/{}",
            encode_path(&entry.reference)
        ))?,
        SourceKind::GithubBlob {
            owner,
            repo,
            branch,
            path,
        } => parse(&format!(
            "{RAW_GITHUB_BASE}/{owner}/{repo}/{branch}/{}",
            encode_path(&path)
        ))?,
        SourceKind::HtmlIndex => {
            let mut base = parse(&platform.source_url)?;
            if !base.path().ends_with('/') {
                let path = format!("{}/", base.path());
                base.set_path(&path);
            }
            base.join(&encode_path(&entry.reference))
                .map_err(|e| Error::InvalidUrl(format!("{}: {e}", entry.reference)))?
        }
    };
    Ok(url.to_string())
}

/// Filesystem-safe local filename for `entry`: the reference's last path
/// segment, sanitised.
///
/// References are already decoded names, so a literal `%` is kept.
#[must_use]
pub fn local_filename(entry: &ListingEntry) -> String {
    let last = entry
        .reference
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or(entry.display_name.as_str());
    sanitize_filename(last)
}
