//! Source adapters: turn a remote listing page into [`ListingEntry`] values.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ListingConfig;
use crate::error::{Error, Result};
use crate::platform::{PlatformSource, SourceKind};
use crate::transport::Transport;

static GITHUB_PAYLOAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)<script type="application/json" data-target="react-app\.embeddedData">(.*?)</script>"#,
    )
    .expect("valid regex")
});

static ANNOTATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*(?:\([^)]*\)|\[[^\]]*\])").expect("valid regex"));

/// One downloadable file discovered in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    /// Cleaned-up name for display.
    pub display_name: String,
    /// Source-specific reference: a bare filename for HTML indexes, a
    /// repository-relative path for GitHub.
    pub reference: String,
}

impl ListingEntry {
    pub fn new(display_name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            reference: reference.into(),
        }
    }
}

/// Files and subfolders found in one GitHub tree page.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GithubTree {
    pub files: Vec<ListingEntry>,
    /// Repository-relative paths of directory entries.
    pub folders: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EmbeddedData {
    payload: Payload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Payload {
    tree: Tree,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Tree {
    items: Vec<TreeItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TreeItem {
    name: String,
    path: String,
    #[serde(rename = "contentType")]
    content_type: String,
}

/// Strips a known extension, then region/release annotations such as
/// `(USA)` or `[!]`. Unknown extensions are kept.
///
/// Used for HTML index hrefs, which arrive percent-encoded.
#[must_use]
pub fn clean_display_name(filename: &str, extensions: &[String]) -> String {
    let decoded = percent_decode(filename);
    let stem = strip_extension(&decoded, extensions);

    let stripped = ANNOTATION_RE.replace_all(stem, "");
    let stripped = stripped.trim();
    if stripped.is_empty() {
        stem.trim().to_string()
    } else {
        stripped.to_string()
    }
}

/// Strips a known extension (case-insensitively) and nothing else.
///
/// GitHub entries keep their names otherwise verbatim, annotations included.
#[must_use]
pub fn strip_extension<'a>(filename: &'a str, extensions: &[String]) -> &'a str {
    let stem_len = extensions
        .iter()
        .filter_map(|ext| {
            let start = filename.len().checked_sub(ext.len() + 1)?;
            let tail = filename.get(start..)?;
            (tail.starts_with('.') && tail[1..].eq_ignore_ascii_case(ext)).then_some(start)
        })
        .min()
        .unwrap_or(filename.len());
    &filename[..stem_len]
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s).map_or_else(|_| s.to_string(), std::borrow::Cow::into_owned)
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn anchor_regex(extensions: &[String]) -> Result<Regex> {
    let alternatives = extensions
        .iter()
        .map(|ext| regex::escape(ext))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r#"(?i)href\s*=\s*["']([^"']*\.(?:{alternatives}))["']"#))
        .map_err(|e| Error::Config(format!("invalid extension list: {e}")))
}

/// Extracts entries from a plain HTML directory index, in document order.
///
/// Parent links (`../`) and absolute links are skipped, except GitHub
/// `/blob/` links whose last segment is used.
///
/// # Errors
///
/// Returns [`Error::Config`] if the extension list does not form a valid pattern.
pub fn parse_html_index(html: &str, extensions: &[String]) -> Result<Vec<ListingEntry>> {
    let re = anchor_regex(extensions)?;

    Ok(re
        .captures_iter(html)
        .filter_map(|caps| {
            let target = caps.get(1)?.as_str();
            if target.starts_with("../") {
                return None;
            }
            let reference = if target.starts_with('/') {
                if !target.contains("/blob/") {
                    return None;
                }
                last_segment(target)
            } else {
                target
            };
            let reference = percent_decode(reference);
            Some(ListingEntry {
                display_name: clean_display_name(&reference, extensions),
                reference,
            })
        })
        .collect())
}

/// Extracts file and folder entries from a GitHub tree page's embedded JSON.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the embedded payload is missing or not JSON.
pub fn parse_github_tree(html: &str, extensions: &[String]) -> Result<GithubTree> {
    let payload = GITHUB_PAYLOAD_RE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| Error::Parse("GitHub tree payload not found".to_string()))?;

    let data: EmbeddedData = serde_json::from_str(payload.as_str())
        .map_err(|e| Error::Parse(format!("GitHub tree payload: {e}")))?;

    let mut tree = GithubTree::default();
    for item in data.payload.tree.items {
        match item.content_type.as_str() {
            "file" => {
                let name = if item.name.is_empty() {
                    last_segment(&item.path).to_string()
                } else {
                    item.name
                };
                tree.files.push(ListingEntry {
                    display_name: strip_extension(&name, extensions).to_string(),
                    reference: item.path,
                });
            }
            "directory" if !item.path.is_empty() => tree.folders.push(item.path),
            _ => {}
        }
    }
    Ok(tree)
}

/// Fetches and normalises a platform's listing.
///
/// Entries come back in discovery order with no deduplication.
///
/// # Errors
///
/// Returns [`Error::SourceUnreachable`] or [`Error::Status`] when the page
/// cannot be fetched and [`Error::Parse`] when it has an unexpected shape.
pub async fn fetch_listing(
    transport: &dyn Transport,
    platform: &PlatformSource,
    config: &ListingConfig,
) -> Result<Vec<ListingEntry>> {
    match platform.kind()? {
        SourceKind::HtmlIndex => {
            let html = transport.get_text(&platform.source_url).await?;
            parse_html_index(&html, &config.extensions)
        }
        SourceKind::GithubTree {
            owner,
            repo,
            branch,
            ..
        } => {
            let html = transport.get_text(&platform.source_url).await?;
            let tree = parse_github_tree(&html, &config.extensions)?;
            let mut entries = tree.files;

            if config.recurse_subfolders {
                for folder in tree.folders {
                    let url = format!("https://github.com/{owner}/{repo}/tree/{branch}/{folder}");
                    log::debug!("Descending into {url}");
                    let html = transport.get_text(&url).await?;
                    entries.extend(parse_github_tree(&html, &config.extensions)?.files);
                }
            }
            Ok(entries)
        }
        SourceKind::GithubBlob { path, .. } => {
            let display_name = strip_extension(last_segment(&path), &config.extensions).to_string();
            Ok(vec![ListingEntry {
                display_name,
                reference: path,
            }])
        }
    }
}
