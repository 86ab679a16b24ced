//! Configured remote sources and the platform catalog export.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

const GITHUB_HOSTS: [&str; 2] = ["github.com", "www.github.com"];

/// A configured remote source plus its local destination folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSource {
    /// Identifier used in requests and as the cache key.
    pub id: String,
    /// Human-readable platform name.
    pub display_name: String,
    /// Listing page URL (HTML index or GitHub tree/blob URL).
    pub source_url: String,
    /// Folder under the storage root that receives downloads.
    pub destination_folder: String,
}

impl PlatformSource {
    /// Creates a platform whose display name and folder derive from `id`.
    pub fn new(id: impl Into<String>, source_url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            destination_folder: default_folder(&id),
            source_url: source_url.into(),
            id,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Sets the destination folder.
    #[must_use]
    pub fn with_destination_folder(mut self, folder: impl Into<String>) -> Self {
        self.destination_folder = folder.into();
        self
    }

    /// Classifies the source URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the source URL does not parse.
    pub fn kind(&self) -> Result<SourceKind> {
        SourceKind::classify(&self.source_url)
    }
}

/// Folder name used when none is configured: lowercase, spaces removed.
#[must_use]
pub fn default_folder(id: &str) -> String {
    id.to_lowercase().replace(' ', "")
}

/// How a platform's source URL must be listed and resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// `github.com/{owner}/{repo}/tree/{branch}/{folder}` web URL.
    GithubTree {
        owner: String,
        repo: String,
        branch: String,
        folder: String,
    },
    /// `github.com/{owner}/{repo}/blob/{branch}/{path}` web URL of one file.
    GithubBlob {
        owner: String,
        repo: String,
        branch: String,
        path: String,
    },
    /// Anything else is treated as a plain HTML directory index.
    HtmlIndex,
}

impl SourceKind {
    /// Classifies a source URL by host and path shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `source_url` is not an absolute URL.
    pub fn classify(source_url: &str) -> Result<Self> {
        let url = Url::parse(source_url)
            .map_err(|e| Error::InvalidUrl(format!("{source_url}: {e}")))?;

        let is_github = url
            .host_str()
            .is_some_and(|host| GITHUB_HOSTS.contains(&host));
        if !is_github {
            return Ok(Self::HtmlIndex);
        }

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            [owner, repo, "tree", branch, rest @ ..] => Ok(Self::GithubTree {
                owner: (*owner).to_string(),
                repo: (*repo).to_string(),
                branch: (*branch).to_string(),
                folder: decode_segments(rest),
            }),
            [owner, repo, "blob", branch, rest @ ..] if !rest.is_empty() => Ok(Self::GithubBlob {
                owner: (*owner).to_string(),
                repo: (*repo).to_string(),
                branch: (*branch).to_string(),
                path: decode_segments(rest),
            }),
            _ => Ok(Self::HtmlIndex),
        }
    }
}

/// Joins URL path segments into a plain repository path.
fn decode_segments(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|seg| urlencoding::decode(seg).map_or_else(|_| (*seg).to_string(), std::borrow::Cow::into_owned))
        .collect::<Vec<_>>()
        .join("/")
}

/// The platform table shipped with the binary.
#[must_use]
pub fn default_platforms() -> Vec<PlatformSource> {
    vec![
        PlatformSource::new("pico-8", "https://github.com/amosjerbi/fetcher/tree/main/pico-8")
            .with_display_name("PICO-8"),
    ]
}

/// One row of the catalog document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub folder: String,
}

/// `{name, folder}` per configured platform, for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCatalog {
    pub platforms: Vec<CatalogEntry>,
}

impl PlatformCatalog {
    /// Builds the catalog from configured platforms.
    #[must_use]
    pub fn from_platforms(platforms: &[PlatformSource]) -> Self {
        Self {
            platforms: platforms
                .iter()
                .map(|p| CatalogEntry {
                    name: p.id.clone(),
                    folder: p.destination_folder.clone(),
                })
                .collect(),
        }
    }

    /// The hardcoded catalog used when generation fails.
    #[must_use]
    pub fn fallback() -> Self {
        Self::from_platforms(&default_platforms())
    }

    /// Builds the catalog, falling back to the default set when the platform
    /// table could not be produced or is empty.
    #[must_use]
    pub fn generate(platforms: Result<&[PlatformSource]>) -> Self {
        match platforms {
            Ok(list) if !list.is_empty() => Self::from_platforms(list),
            Ok(_) => {
                log::warn!("No platforms configured, using default catalog");
                Self::fallback()
            }
            Err(e) => {
                log::error!("Platform catalog generation failed: {e}");
                Self::fallback()
            }
        }
    }

    /// Returns the folder for a platform name, if catalogued.
    #[must_use]
    pub fn folder_for(&self, name: &str) -> Option<&str> {
        self.platforms
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.folder.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_github_tree() {
        let kind = SourceKind::classify("https://github.com/amosjerbi/fetcher/tree/main/pico-8").unwrap();
        assert_eq!(
            kind,
            SourceKind::GithubTree {
                owner: "amosjerbi".to_string(),
                repo: "fetcher".to_string(),
                branch: "main".to_string(),
                folder: "pico-8".to_string(),
            }
        );
    }

    #[test]
    fn classifies_github_blob() {
        let kind =
            SourceKind::classify("https://github.com/amosjerbi/fetcher/blob/main/pico-8/romnix.p8.png")
                .unwrap();
        assert_eq!(
            kind,
            SourceKind::GithubBlob {
                owner: "amosjerbi".to_string(),
                repo: "fetcher".to_string(),
                branch: "main".to_string(),
                path: "pico-8/romnix.p8.png".to_string(),
            }
        );
    }

    #[test]
    fn other_hosts_are_html_indexes() {
        assert_eq!(
            SourceKind::classify("https://myrient.erista.me/files/No-Intro/Nintendo%20-%20Game%20Boy/")
                .unwrap(),
            SourceKind::HtmlIndex
        );
        // A bare repository URL has no tree/blob segment to rewrite.
        assert_eq!(
            SourceKind::classify("https://github.com/amosjerbi/fetcher").unwrap(),
            SourceKind::HtmlIndex
        );
    }

    #[test]
    fn relative_url_is_rejected() {
        assert!(matches!(
            SourceKind::classify("files/roms"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn default_folder_strips_spaces() {
        assert_eq!(default_folder("Game Boy"), "gameboy");
        let p = PlatformSource::new("Game Boy", "https://example.com/gb/");
        assert_eq!(p.destination_folder, "gameboy");
        assert_eq!(p.display_name, "Game Boy");
    }

    #[test]
    fn catalog_lists_name_and_folder() {
        let platforms = vec![
            PlatformSource::new("pico-8", "https://example.com/p8/"),
            PlatformSource::new("gb", "https://example.com/gb/").with_destination_folder("gb-roms"),
        ];
        let catalog = PlatformCatalog::generate(Ok(&platforms));
        assert_eq!(catalog.platforms.len(), 2);
        assert_eq!(catalog.folder_for("gb"), Some("gb-roms"));

        let json = serde_json::to_value(&catalog).unwrap();
        assert_eq!(json["platforms"][0]["name"], "pico-8");
        assert_eq!(json["platforms"][0]["folder"], "pico-8");
    }

    #[test]
    fn catalog_falls_back_on_failure_or_empty() {
        let failed = PlatformCatalog::generate(Err(Error::Config("bad toml".to_string())));
        assert_eq!(failed, PlatformCatalog::fallback());

        let empty = PlatformCatalog::generate(Ok(&[]));
        assert_eq!(empty, PlatformCatalog::fallback());
        assert_eq!(empty.folder_for("pico-8"), Some("pico-8"));
    }
}
