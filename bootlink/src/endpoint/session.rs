//! Upgrade session state.

use crate::sink::DownloadSink;

/// Session status code recorded when the channel fails mid-upgrade.
pub const CHANNEL_FAILURE_STATUS: i16 = -1000;

/// Whether image chunks currently have somewhere to go.
///
/// A session is `Active` from the moment the controller hands over its sink
/// until the terminating chunk arrives.
pub enum UpgradeSession<'s> {
    /// No upgrade in progress.
    Idle,
    /// Chunks are streamed into the bound sink.
    Active(&'s mut dyn DownloadSink),
}

impl UpgradeSession<'_> {
    /// Whether a sink is bound.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// Drop the sink binding.
    pub fn finish(&mut self) {
        *self = Self::Idle;
    }
}

impl std::fmt::Debug for UpgradeSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Active(_) => f.write_str("Active"),
        }
    }
}
