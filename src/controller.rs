//! Presentation-facing state machine.
//!
//! Front-ends feed [`Event`]s in and execute the [`Effect`]s that come out.
//! The controller never performs I/O itself, so a terminal UI, a handheld
//! frontend, or a test can all drive it the same way.

use std::collections::BTreeSet;

use crate::bulk::{BulkState, BulkStatus};
use crate::progress::{ProgressRecord, ProgressStatus};
use crate::source::ListingEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Platforms,
    FileList,
    Downloading,
    BulkDownloading,
}

/// Input to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PlatformChosen(String),
    ListingReady(Vec<ListingEntry>),
    ListingFailed(String),
    ToggleSelection(usize),
    DownloadRequested(usize),
    BulkRequested,
    Progress(ProgressRecord),
    Bulk(BulkStatus),
    Cancel,
    Back,
}

/// Work the front-end must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    FetchListing {
        platform_id: String,
    },
    Download {
        platform_id: String,
        entry: ListingEntry,
    },
    Bulk {
        platform_id: String,
        entries: Vec<ListingEntry>,
    },
    CancelBulk,
}

#[derive(Debug, Clone)]
pub struct Controller {
    screen: Screen,
    platform: Option<String>,
    entries: Vec<ListingEntry>,
    loading: bool,
    selected: BTreeSet<usize>,
    progress: Option<ProgressRecord>,
    bulk: Option<BulkStatus>,
    message: Option<String>,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            screen: Screen::Platforms,
            platform: None,
            entries: Vec::new(),
            loading: false,
            selected: BTreeSet::new(),
            progress: None,
            bulk: None,
            message: None,
        }
    }

    #[must_use]
    pub const fn screen(&self) -> Screen {
        self.screen
    }

    #[must_use]
    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    #[must_use]
    pub fn entries(&self) -> &[ListingEntry] {
        &self.entries
    }

    #[must_use]
    pub const fn is_loading(&self) -> bool {
        self.loading
    }

    #[must_use]
    pub const fn selected(&self) -> &BTreeSet<usize> {
        &self.selected
    }

    #[must_use]
    pub const fn progress(&self) -> Option<&ProgressRecord> {
        self.progress.as_ref()
    }

    #[must_use]
    pub const fn bulk(&self) -> Option<&BulkStatus> {
        self.bulk.as_ref()
    }

    /// Last status line for the user (errors, completion summaries).
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Applies `event` and returns the effect to run, if any. Events that do
    /// not apply to the current screen are ignored.
    pub fn handle(&mut self, event: Event) -> Option<Effect> {
        match (self.screen, event) {
            (Screen::Platforms, Event::PlatformChosen(platform_id)) => {
                self.screen = Screen::FileList;
                self.platform = Some(platform_id.clone());
                self.entries.clear();
                self.selected.clear();
                self.loading = true;
                self.message = None;
                Some(Effect::FetchListing { platform_id })
            }
            (Screen::FileList, Event::ListingReady(entries)) => {
                self.entries = entries;
                self.loading = false;
                None
            }
            (Screen::FileList, Event::ListingFailed(error)) => {
                self.entries.clear();
                self.loading = false;
                self.message = Some(error);
                None
            }
            (Screen::FileList, Event::ToggleSelection(index)) if index < self.entries.len() => {
                if !self.selected.remove(&index) {
                    self.selected.insert(index);
                }
                None
            }
            (Screen::FileList, Event::DownloadRequested(index)) => {
                let entry = self.entries.get(index)?.clone();
                let platform_id = self.platform.clone()?;
                self.screen = Screen::Downloading;
                self.progress = None;
                self.message = None;
                Some(Effect::Download { platform_id, entry })
            }
            (Screen::FileList, Event::BulkRequested) => {
                if self.selected.is_empty() {
                    self.message = Some("No files selected".to_string());
                    return None;
                }
                let platform_id = self.platform.clone()?;
                let entries = self
                    .selected
                    .iter()
                    .filter_map(|&i| self.entries.get(i).cloned())
                    .collect();
                self.screen = Screen::BulkDownloading;
                self.bulk = None;
                self.message = None;
                Some(Effect::Bulk {
                    platform_id,
                    entries,
                })
            }
            (Screen::FileList, Event::Back) => {
                self.screen = Screen::Platforms;
                self.platform = None;
                self.entries.clear();
                self.selected.clear();
                self.loading = false;
                None
            }
            (Screen::Downloading, Event::Progress(record)) => {
                if record.status.is_terminal() {
                    self.message = Some(match (&record.status, &record.error) {
                        (ProgressStatus::Error, Some(error)) => format!("Download failed: {error}"),
                        (ProgressStatus::Error, None) => "Download failed".to_string(),
                        _ => record.completion.as_ref().map_or_else(
                            || "Download complete".to_string(),
                            |c| format!("Downloaded {}", c.filename),
                        ),
                    });
                    self.screen = Screen::FileList;
                }
                self.progress = Some(record);
                None
            }
            (Screen::BulkDownloading, Event::Bulk(status)) => {
                if matches!(status.state, BulkState::Completed | BulkState::Cancelled) {
                    let verb = if status.state == BulkState::Cancelled {
                        "Cancelled"
                    } else {
                        "Finished"
                    };
                    self.message = Some(format!(
                        "{verb}: {} succeeded, {} failed",
                        status.success_count, status.failed_count
                    ));
                    self.selected.clear();
                    self.screen = Screen::FileList;
                }
                self.bulk = Some(status);
                None
            }
            (Screen::BulkDownloading, Event::Cancel) => Some(Effect::CancelBulk),
            (screen, event) => {
                log::debug!("Ignoring {event:?} on {screen:?}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Completion;
    use std::path::PathBuf;

    fn entries() -> Vec<ListingEntry> {
        vec![
            ListingEntry::new("romnix", "pico-8/romnix.p8.png"),
            ListingEntry::new("celeste", "pico-8/celeste.p8.png"),
            ListingEntry::new("celeste", "pico-8/celeste-2.p8.png"),
        ]
    }

    fn on_file_list() -> Controller {
        let mut c = Controller::new();
        c.handle(Event::PlatformChosen("pico-8".to_string()));
        c.handle(Event::ListingReady(entries()));
        c
    }

    #[test]
    fn choosing_platform_requests_listing() {
        let mut c = Controller::new();
        let effect = c.handle(Event::PlatformChosen("pico-8".to_string()));
        assert_eq!(
            effect,
            Some(Effect::FetchListing {
                platform_id: "pico-8".to_string()
            })
        );
        assert_eq!(c.screen(), Screen::FileList);
        assert!(c.is_loading());

        c.handle(Event::ListingReady(entries()));
        assert!(!c.is_loading());
        assert_eq!(c.entries().len(), 3);
    }

    #[test]
    fn listing_failure_shows_empty_list_with_message() {
        let mut c = Controller::new();
        c.handle(Event::PlatformChosen("pico-8".to_string()));
        c.handle(Event::ListingFailed("HTTP 503".to_string()));
        assert_eq!(c.screen(), Screen::FileList);
        assert!(c.entries().is_empty());
        assert_eq!(c.message(), Some("HTTP 503"));
        c.handle(Event::Back);
        assert_eq!(c.screen(), Screen::Platforms);
    }

    #[test]
    fn single_download_returns_to_list_on_terminal_record() {
        let mut c = on_file_list();
        let effect = c.handle(Event::DownloadRequested(0));
        assert!(matches!(effect, Some(Effect::Download { ref entry, .. }) if entry.display_name == "romnix"));
        assert_eq!(c.screen(), Screen::Downloading);

        // Navigation is locked while downloading.
        assert_eq!(c.handle(Event::Back), None);
        assert_eq!(c.screen(), Screen::Downloading);

        c.handle(Event::Progress(ProgressRecord::downloading(5, Some(10))));
        assert_eq!(c.progress().unwrap().percent, 50);

        let done = ProgressRecord::success(10).with_completion(Completion {
            file: PathBuf::from("/storage/roms/pico-8/romnix.p8.png"),
            platform: "pico-8".to_string(),
            folder: "pico-8".to_string(),
            filename: "romnix.p8.png".to_string(),
        });
        c.handle(Event::Progress(done));
        assert_eq!(c.screen(), Screen::FileList);
        assert_eq!(c.message(), Some("Downloaded romnix.p8.png"));
    }

    #[test]
    fn failed_download_reports_error() {
        let mut c = on_file_list();
        c.handle(Event::DownloadRequested(1));
        c.handle(Event::Progress(ProgressRecord::failed("HTTP 404", 0, None)));
        assert_eq!(c.screen(), Screen::FileList);
        assert_eq!(c.message(), Some("Download failed: HTTP 404"));
    }

    #[test]
    fn out_of_range_requests_are_ignored() {
        let mut c = on_file_list();
        assert_eq!(c.handle(Event::DownloadRequested(9)), None);
        c.handle(Event::ToggleSelection(9));
        assert!(c.selected().is_empty());
        assert_eq!(c.screen(), Screen::FileList);
    }

    #[test]
    fn bulk_uses_selection_in_list_order() {
        let mut c = on_file_list();
        assert_eq!(c.handle(Event::BulkRequested), None);
        assert_eq!(c.message(), Some("No files selected"));

        c.handle(Event::ToggleSelection(2));
        c.handle(Event::ToggleSelection(0));
        c.handle(Event::ToggleSelection(1));
        c.handle(Event::ToggleSelection(1));
        let Some(Effect::Bulk { entries, .. }) = c.handle(Event::BulkRequested) else {
            panic!("expected bulk effect");
        };
        assert_eq!(entries[0].reference, "pico-8/romnix.p8.png");
        assert_eq!(entries[1].reference, "pico-8/celeste-2.p8.png");
        assert_eq!(c.screen(), Screen::BulkDownloading);

        assert_eq!(c.handle(Event::Cancel), Some(Effect::CancelBulk));
        c.handle(Event::Bulk(BulkStatus {
            state: BulkState::Cancelled,
            index: 1,
            total: 2,
            success_count: 1,
            failed_count: 0,
            current: Some("romnix".to_string()),
        }));
        assert_eq!(c.screen(), Screen::FileList);
        assert_eq!(c.message(), Some("Cancelled: 1 succeeded, 0 failed"));
        assert!(c.selected().is_empty());
    }
}
