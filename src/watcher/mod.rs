//! Debounced watcher over the issue store's snapshot and journal files.
//!
//! The native `notify` callback filters by suffix at the source, so
//! unrelated files never reach the debounce loop. A single shared timer
//! coalesces each burst into one `WatchEvent::Changed`.

mod debounce;
pub mod fs;
pub mod types;

pub use fs::{DebouncedFileWatcher, WatcherConfig};
pub use types::{ChangeKind, FileChangeEvent, FileFamily, WatchEvent, WatchFilter};
