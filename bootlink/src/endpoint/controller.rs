//! Bootloader controller seam.
//!
//! The controller owns the bootloader state machine, image validation and
//! flashing. The endpoint only reads its state and asks for transitions.

use std::time::Duration;

use crate::protocol::messages::{BootloaderState, SoftwareVersion};
use crate::sink::DownloadSink;

/// Metadata of the installed application image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AppInfo {
    /// Major version.
    pub major_version: u8,
    /// Minor version.
    pub minor_version: u8,
    /// VCS commit the image was built from.
    pub vcs_commit: u32,
    /// CRC64 of the image.
    pub image_crc: u64,
    /// Built in release configuration.
    pub release_build: bool,
    /// Built from a modified working tree.
    pub dirty_build: bool,
    /// Build time (UTC seconds), if the build recorded one.
    pub build_timestamp_utc: Option<u32>,
}

impl AppInfo {
    /// Software version record reported in node info.
    pub fn software_version(&self) -> SoftwareVersion {
        SoftwareVersion {
            major: self.major_version,
            minor: self.minor_version,
            vcs_commit_id: Some(self.vcs_commit),
            image_crc: Some(self.image_crc),
            release_build: self.release_build,
            dirty_build: self.dirty_build,
            build_timestamp_utc: self.build_timestamp_utc,
        }
    }
}

/// Read-only view of the controller.
///
/// This is all the endpoint can see while the controller is busy running an
/// upgrade.
pub trait ControllerView {
    /// Current bootloader state.
    fn state(&self) -> BootloaderState;

    /// Time since the device started.
    fn monotonic_uptime(&self) -> Duration;

    /// Installed application, if any.
    fn app_info(&self) -> Option<AppInfo>;
}

/// Bootloader controller operations.
pub trait BootloaderController: ControllerView {
    /// Cancel a pending boot.
    fn cancel_boot(&mut self);

    /// Boot the application as soon as possible.
    fn request_boot(&mut self);

    /// Run an application upgrade.
    ///
    /// Blocks until the upgrade is over. The controller is expected to enter
    /// [`BootloaderState::AppUpgradeInProgress`], call
    /// [`ImageDownloader::download_image`] exactly once with its sink, and
    /// leave that state before returning. Returns the controller's own result
    /// code.
    fn upgrade_app(&mut self, downloader: &mut dyn ImageDownloader) -> i16;
}

/// The image transfer half of an upgrade, provided by the endpoint.
pub trait ImageDownloader {
    /// Stream image chunks into `sink` until the transfer is over.
    ///
    /// Returns 0 on success or the negative code of the failure.
    fn download_image(&mut self, sink: &mut dyn DownloadSink, view: &dyn ControllerView) -> i16;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_info_software_version() {
        let info = AppInfo {
            major_version: 2,
            minor_version: 7,
            vcs_commit: 0xDEAD_BEEF,
            image_crc: 0x0123_4567_89AB_CDEF,
            release_build: true,
            dirty_build: false,
            build_timestamp_utc: None,
        };

        let sw = info.software_version();
        assert_eq!(sw.major, 2);
        assert_eq!(sw.minor, 7);
        assert_eq!(sw.vcs_commit_id, Some(0xDEAD_BEEF));
        assert_eq!(sw.image_crc, Some(0x0123_4567_89AB_CDEF));
        assert!(sw.release_build);
        assert!(!sw.dirty_build);
        assert_eq!(sw.build_timestamp_utc, None);
    }
}
