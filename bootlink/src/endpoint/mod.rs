//! Framed-protocol bootloader endpoint.
//!
//! The endpoint services a [`Platform`] byte channel, feeds every received
//! byte into a [`FrameCodec`] and answers the standard requests on behalf of a
//! [`BootloaderController`].
//!
//! ## Upgrade Flow
//!
//! ```text
//! Host                      Endpoint                    Controller
//!  | -- status(Upgrade) -->   |                              |
//!  |                          | ---- upgrade_app(self) ----> |
//!  |                          | <--- download_image(sink) -- |
//!  | <-- status(Upgrade) ---  |                              |
//!  | -- image data (256) -->  | ---- accept_chunk ---------> |
//!  | <-- echo -------------   |                              |
//!  | -- image data (<256) ->  | ---- accept_chunk ---------> |
//!  | <-- echo -------------   | ---- status code ----------> |
//!  |                          | <--- return ---------------- |
//! ```
//!
//! The upgrade session is a nested run of the same polling loop. While it
//! runs, the controller is only visible through [`ControllerView`].

mod controller;
mod platform;
mod session;

use std::time::Duration;

use log::{debug, trace, warn};

pub use controller::{AppInfo, BootloaderController, ControllerView, ImageDownloader};
pub use platform::Platform;
pub use session::{CHANNEL_FAILURE_STATUS, UpgradeSession};

use crate::channel::{ChannelError, ChannelResult, IO_BYTE_TIMEOUT};
use crate::protocol::frame::{Frame, FrameCodec, ParserOutput, STANDARD_FRAME_TYPE_CODE};
use crate::protocol::messages::{
    BootloaderState, BootloaderStatus, CommandStatus, DeviceManagementCommand, ImageData,
    ImageType, MAX_COA_LENGTH, MAX_IMAGE_DATA_LENGTH, NodeInfo, NodeMode, Request, Response,
    SoftwareVersion,
};
use crate::sink::DownloadSink;

/// Shortest external watchdog timeout the endpoint can keep alive.
pub const MIN_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(3);

/// Endpoint configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EndpointConfig {
    /// Timeout of every single-byte channel operation.
    pub io_byte_timeout: Duration,
    /// Also run the certificate of authenticity path for application chunks.
    pub coa_fallthrough: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            io_byte_timeout: IO_BYTE_TIMEOUT,
            coa_fallthrough: false,
        }
    }
}

/// Framed-protocol endpoint.
pub struct Endpoint<C, P, K> {
    controller: C,
    link: Link<P, K>,
}

/// Everything except the controller, so the controller can call back in.
struct Link<P, K> {
    platform: P,
    codec: K,
    config: EndpointConfig,
    node_info: NodeInfo,
    download_reached: bool,
    status_code: i16,
    last_upgrade_status: Option<i16>,
    emit_failed: bool,
}

/// Who requests are served for.
enum Context<'c, 's> {
    /// The controller is idle and may be asked for transitions.
    Normal(&'c mut dyn BootloaderController),
    /// The controller is running an upgrade.
    Upgrade {
        view: &'c dyn ControllerView,
        session: &'c mut UpgradeSession<'s>,
    },
}

impl Context<'_, '_> {
    fn state(&self) -> BootloaderState {
        match self {
            Self::Normal(controller) => controller.state(),
            Self::Upgrade { view, .. } => view.state(),
        }
    }

    fn monotonic_uptime(&self) -> Duration {
        match self {
            Self::Normal(controller) => controller.monotonic_uptime(),
            Self::Upgrade { view, .. } => view.monotonic_uptime(),
        }
    }

    fn app_info(&self) -> Option<AppInfo> {
        match self {
            Self::Normal(controller) => controller.app_info(),
            Self::Upgrade { view, .. } => view.app_info(),
        }
    }

    fn session_active(&self) -> bool {
        matches!(self, Self::Upgrade { session, .. } if session.is_active())
    }
}

impl<C, P, K> Endpoint<C, P, K>
where
    C: BootloaderController,
    P: Platform,
    K: FrameCodec,
{
    /// Create an endpoint with the default configuration.
    ///
    /// `node_info` is the identity prototype. Its mode is forced to
    /// bootloader and its software version is replaced per request by the
    /// installed application's, if any.
    pub fn new(controller: C, platform: P, codec: K, node_info: NodeInfo) -> Self {
        Self::with_config(controller, platform, codec, node_info, EndpointConfig::default())
    }

    /// Create an endpoint with custom configuration.
    pub fn with_config(
        controller: C,
        platform: P,
        codec: K,
        mut node_info: NodeInfo,
        config: EndpointConfig,
    ) -> Self {
        node_info.software_version = SoftwareVersion::default();
        node_info.mode = NodeMode::Bootloader;

        Self {
            controller,
            link: Link {
                platform,
                codec,
                config,
                node_info,
                download_reached: false,
                status_code: 0,
                last_upgrade_status: None,
                emit_failed: false,
            },
        }
    }

    /// Serve requests until [`Platform::should_exit`] returns `true`.
    pub fn run(&mut self) {
        debug!("Endpoint started");
        while !self.link.platform.should_exit() {
            // Channel failures are logged by poll; the endpoint keeps serving
            let _ = self.poll();
        }
        debug!("Endpoint stopped");
    }

    /// One loop iteration: refresh the watchdog, receive a byte, process it.
    pub fn poll(&mut self) -> ChannelResult<()> {
        self.link.poll(&mut Context::Normal(&mut self.controller))
    }

    /// Feed one byte into the codec and dispatch whatever it yields.
    pub fn process_byte(&mut self, byte: u8) {
        self.link
            .process_byte(&mut Context::Normal(&mut self.controller), byte);
    }

    /// Status code of the most recent upgrade session, if one ran.
    pub fn last_upgrade_status(&self) -> Option<i16> {
        self.link.last_upgrade_status
    }

    /// Get the controller.
    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Get the controller mutably.
    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    /// Get the platform.
    pub fn platform(&self) -> &P {
        &self.link.platform
    }

    /// Get the platform mutably.
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.link.platform
    }

    /// Take the endpoint apart.
    pub fn into_parts(self) -> (C, P, K) {
        (self.controller, self.link.platform, self.link.codec)
    }
}

impl<P: Platform, K: FrameCodec> Link<P, K> {
    fn poll(&mut self, ctx: &mut Context<'_, '_>) -> ChannelResult<()> {
        self.platform.reset_watchdog();

        match self.platform.receive(self.config.io_byte_timeout) {
            Ok(byte) => self.process_byte(ctx, byte),
            Err(ChannelError::Timeout) => {},
            Err(ChannelError::Failed) => {
                warn!("Channel receive failed");
                return Err(ChannelError::Failed);
            },
        }

        if std::mem::take(&mut self.emit_failed) {
            return Err(ChannelError::Failed);
        }
        Ok(())
    }

    fn process_byte(&mut self, ctx: &mut Context<'_, '_>, byte: u8) {
        match self.codec.process_next_byte(byte) {
            Some(ParserOutput::Frame(frame)) => {
                self.platform.reset_watchdog();
                self.process_frame(ctx, &frame);
                self.platform.reset_watchdog();
            },
            Some(ParserOutput::ExtraneousData(data)) => {
                self.platform.reset_watchdog();
                trace!("{} bytes of extraneous data", data.len());
                self.platform.process_extraneous_data(&data);
                self.platform.reset_watchdog();
            },
            None => {},
        }
    }

    fn process_frame(&mut self, ctx: &mut Context<'_, '_>, frame: &Frame) {
        let request = if frame.is_standard() {
            Request::try_decode(&frame.payload)
        } else {
            None
        };

        match request {
            Some(Request::NodeInfo) => self.process_node_info_request(ctx),
            Some(Request::DeviceManagement(command)) => {
                self.process_device_management_request(command);
            },
            Some(Request::BootloaderStatus { desired_state }) => {
                self.process_status_request(ctx, desired_state);
            },
            Some(Request::ImageData(request)) => self.process_image_data_request(ctx, &request),
            None => {
                trace!(
                    "Unhandled frame: type 0x{:02X}, {} bytes",
                    frame.type_code,
                    frame.payload.len()
                );
                self.platform.process_unhandled_frame(frame);
            },
        }
    }

    fn process_node_info_request(&mut self, ctx: &Context<'_, '_>) {
        let mut info = self.node_info.clone();
        if let Some(app) = ctx.app_info() {
            info.software_version = app.software_version();
        }
        self.send(&Response::NodeInfo(info));
    }

    fn process_device_management_request(&mut self, command: DeviceManagementCommand) {
        let status = if command == DeviceManagementCommand::LaunchBootloader {
            // Already running the bootloader
            CommandStatus::Ok
        } else {
            self.platform.process_unhandled_command(command)
        };
        debug!("Device management command {command:?}: {status:?}");
        self.send(&Response::DeviceManagement { command, status });
    }

    fn process_status_request(&mut self, ctx: &mut Context<'_, '_>, desired: BootloaderState) {
        trace!("Status request, desired state {desired:?}");

        match desired {
            BootloaderState::BootCancelled => {
                if let Context::Normal(controller) = ctx {
                    controller.cancel_boot();
                }
                self.send_status(ctx);
            },
            BootloaderState::AppUpgradeInProgress => {
                if let Context::Normal(controller) = ctx {
                    self.download_reached = false;
                    self.status_code = 0;

                    // Blocks until the upgrade is over
                    let result = controller.upgrade_app(self);
                    debug!("Upgrade finished, controller returned {result}");

                    if !self.download_reached {
                        self.send_status(ctx);
                    }
                } else {
                    self.send_status(ctx);
                }
            },
            BootloaderState::ReadyToBoot => {
                if let Context::Normal(controller) = ctx {
                    controller.request_boot();
                }
                self.send_status(ctx);
            },
            BootloaderState::NoAppToBoot | BootloaderState::BootDelay => {},
        }
    }

    /// Reply with the controller's state.
    ///
    /// # Panics
    ///
    /// Panics if the controller reports `AppUpgradeInProgress` without a bound
    /// download sink, or any other state while one is bound.
    fn send_status(&mut self, ctx: &Context<'_, '_>) {
        let state = ctx.state();
        let session_active = ctx.session_active();
        assert_eq!(
            state == BootloaderState::AppUpgradeInProgress,
            session_active,
            "controller reports {state:?} but the upgrade session is {}",
            if session_active { "active" } else { "idle" }
        );

        self.send(&Response::BootloaderStatus(BootloaderStatus {
            timestamp: ctx.monotonic_uptime(),
            state,
        }));
    }

    fn process_image_data_request(&mut self, ctx: &mut Context<'_, '_>, request: &ImageData) {
        let mut response = ImageData {
            image_offset: request.image_offset,
            image_type: request.image_type,
            data: Vec::new(),
        };

        let write_coa = match request.image_type {
            ImageType::Application => {
                self.accept_application_chunk(ctx, request, &mut response);
                self.config.coa_fallthrough
            },
            ImageType::CertificateOfAuthenticity => true,
        };
        if write_coa {
            self.write_coa(request, &mut response);
        }

        self.send(&Response::ImageData(response));
    }

    fn accept_application_chunk(
        &mut self,
        ctx: &mut Context<'_, '_>,
        request: &ImageData,
        response: &mut ImageData,
    ) {
        let Context::Upgrade { session, .. } = ctx else {
            trace!("Application chunk outside of an upgrade");
            return;
        };
        let UpgradeSession::Active(sink) = &mut **session else {
            return;
        };

        // Offsets are not checked; the controller validates the whole image
        if !request.data.is_empty() {
            let result = sink.accept_chunk(&request.data);
            if result >= 0 {
                response.data.clone_from(&request.data);
                self.status_code = 0;
            } else {
                warn!(
                    "Sink rejected chunk at offset {} with code {result}",
                    request.image_offset
                );
                self.status_code = result;
            }
        }

        if request.data.len() < MAX_IMAGE_DATA_LENGTH {
            debug!(
                "Last chunk received at offset {} ({} bytes)",
                request.image_offset,
                request.data.len()
            );
            session.finish();
        }
    }

    fn write_coa(&mut self, request: &ImageData, response: &mut ImageData) {
        if request.image_offset != 0 || request.data.len() >= MAX_COA_LENGTH {
            debug!(
                "Ignoring certificate of authenticity: offset {}, {} bytes",
                request.image_offset,
                request.data.len()
            );
            return;
        }

        let mut read_back = vec![0u8; MAX_IMAGE_DATA_LENGTH];
        let result = self
            .platform
            .write_and_read_back_coa(&request.data, &mut read_back);
        match usize::try_from(result) {
            Ok(len) => {
                read_back.truncate(len);
                response.data = read_back;
            },
            Err(_) => {
                warn!("Certificate of authenticity write-back failed with code {result}");
                response.data.clear();
            },
        }
    }

    /// Encode and emit one reply. Replies are best effort.
    fn send(&mut self, response: &Response) {
        let bytes = self
            .codec
            .encode(STANDARD_FRAME_TYPE_CODE, &response.encode());

        for byte in bytes {
            if let Err(e) = self.platform.emit(byte, self.config.io_byte_timeout) {
                warn!("Reply dropped: {e}");
                if !e.is_timeout() {
                    self.emit_failed = true;
                }
                return;
            }
        }
    }
}

impl<P: Platform, K: FrameCodec> ImageDownloader for Link<P, K> {
    fn download_image(&mut self, sink: &mut dyn DownloadSink, view: &dyn ControllerView) -> i16 {
        assert!(
            !self.download_reached,
            "download_image called twice in one upgrade"
        );
        assert_eq!(self.status_code, 0, "stale upgrade status code");

        let mut session = UpgradeSession::Active(sink);
        let mut ctx = Context::Upgrade {
            view,
            session: &mut session,
        };

        self.download_reached = true;
        debug!("Upgrade session started");
        self.send_status(&ctx);

        while !self.platform.should_exit() && ctx.session_active() && self.status_code >= 0 {
            if self.poll(&mut ctx).is_err() {
                self.status_code = CHANNEL_FAILURE_STATUS;
            }
        }

        session.finish();
        debug!("Upgrade session ended with status {}", self.status_code);
        self.last_upgrade_status = Some(self.status_code);
        self.status_code
    }
}
