//! Frontend orchestration for Tandem.
//!
//! Both orchestrators are plain state machines. The runtime feeds them
//! backend lines, process exits and timer ticks, then carries out the
//! commands and actions they queue.

pub mod playback;
pub mod scan;
pub mod session;

pub use playback::{CrashPolicy, FrontendNotification, PlaybackFrontend};
pub use scan::{
    ScanAction, ScanReport, ScanSupervisor, DEFAULT_KILL_TIMEOUT, DEFAULT_WATCHDOG,
    MAX_SUB_RESOURCES,
};
pub use session::Session;
