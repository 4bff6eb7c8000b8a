//! Capture detection under the watch root.

mod controller;
mod state;
mod watcher;

pub use controller::WatcherController;
pub use state::WatchState;
pub use watcher::FolderWatcher;
