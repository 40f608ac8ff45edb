//! Standard message set carried inside framed-protocol frames.
//!
//! ## Payload Format
//!
//! Every standard payload starts with a little-endian message id:
//!
//! ```text
//! +------------+------------------------------+
//! | Message ID |            Fields            |
//! +------------+------------------------------+
//! |  2 bytes   |   message specific, LE       |
//! +------------+------------------------------+
//! ```
//!
//! | ID | Message                              | Fields                                  |
//! |----|--------------------------------------|-----------------------------------------|
//! | 0  | NodeInfo                             | empty (request) / full record (response)|
//! | 5  | DeviceManagementCommandRequest       | command u16                             |
//! | 6  | DeviceManagementCommandResponse      | command u16, status u8                  |
//! | 7  | BootloaderStatusRequest              | desired_state u8                        |
//! | 8  | BootloaderStatusResponse             | timestamp_ns u64, flags u64, state u8   |
//! | 9  | BootloaderImageDataRequest           | offset u64, type u8, data (<= 256)      |
//! | 10 | BootloaderImageDataResponse          | offset u64, type u8, data (<= 256)      |
//!
//! Decoders are strict. A wrong id, a truncated payload, an unknown enum value
//! or an oversized variable field makes the decoder return `None`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::time::Duration;

/// Message identifiers.
pub mod message_id {
    /// Node info request (empty) and response (full record).
    pub const NODE_INFO: u16 = 0;
    /// Device management command request.
    pub const DEVICE_MANAGEMENT_COMMAND_REQUEST: u16 = 5;
    /// Device management command response.
    pub const DEVICE_MANAGEMENT_COMMAND_RESPONSE: u16 = 6;
    /// Bootloader status request.
    pub const BOOTLOADER_STATUS_REQUEST: u16 = 7;
    /// Bootloader status response.
    pub const BOOTLOADER_STATUS_RESPONSE: u16 = 8;
    /// Bootloader image data request.
    pub const BOOTLOADER_IMAGE_DATA_REQUEST: u16 = 9;
    /// Bootloader image data response.
    pub const BOOTLOADER_IMAGE_DATA_RESPONSE: u16 = 10;
}

/// Largest image data field. An application chunk shorter than this ends the upgrade.
pub const MAX_IMAGE_DATA_LENGTH: usize = 256;

/// Largest certificate of authenticity the protocol can carry.
pub const MAX_COA_LENGTH: usize = 255;

/// Width of the fixed string fields in the node info record.
pub const NODE_INFO_STRING_LENGTH: usize = 80;

/// Size of the node info record without the certificate of authenticity.
const NODE_INFO_FIXED_LENGTH: usize = 20 + 2 + 2 + 16 + 4 * NODE_INFO_STRING_LENGTH;

/// Bootloader state as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum BootloaderState {
    /// No valid application is installed.
    NoAppToBoot = 0,
    /// A valid application will be started once the boot delay expires.
    BootDelay = 1,
    /// The boot delay was cancelled; waiting for instructions.
    BootCancelled = 2,
    /// An image is being received.
    AppUpgradeInProgress = 3,
    /// The application is about to be started.
    ReadyToBoot = 4,
}

impl TryFrom<u8> for BootloaderState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NoAppToBoot),
            1 => Ok(Self::BootDelay),
            2 => Ok(Self::BootCancelled),
            3 => Ok(Self::AppUpgradeInProgress),
            4 => Ok(Self::ReadyToBoot),
            other => Err(other),
        }
    }
}

/// Kind of image carried by an image data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ImageType {
    /// Application firmware, streamed in chunks during an upgrade.
    Application = 0,
    /// Certificate of authenticity, written in one piece.
    CertificateOfAuthenticity = 1,
}

impl TryFrom<u8> for ImageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Application),
            1 => Ok(Self::CertificateOfAuthenticity),
            other => Err(other),
        }
    }
}

/// Device management commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
pub enum DeviceManagementCommand {
    /// Restart the device.
    Restart = 0,
    /// Power the device off.
    PowerOff = 1,
    /// Restore factory defaults.
    FactoryReset = 2,
    /// Print a short diagnostic report.
    PrintDiagnosticsBrief = 3,
    /// Print a full diagnostic report.
    PrintDiagnosticsVerbose = 4,
    /// Enter the bootloader.
    LaunchBootloader = 5,
}

impl TryFrom<u16> for DeviceManagementCommand {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Restart),
            1 => Ok(Self::PowerOff),
            2 => Ok(Self::FactoryReset),
            3 => Ok(Self::PrintDiagnosticsBrief),
            4 => Ok(Self::PrintDiagnosticsVerbose),
            5 => Ok(Self::LaunchBootloader),
            other => Err(other),
        }
    }
}

/// Outcome of a device management command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum CommandStatus {
    /// Command executed.
    Ok = 0,
    /// Command not supported.
    BadCommand = 1,
    /// Command supported but cannot be executed now.
    MaybeLater = 2,
}

impl TryFrom<u8> for CommandStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::BadCommand),
            2 => Ok(Self::MaybeLater),
            other => Err(other),
        }
    }
}

/// Operating mode reported in node info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum NodeMode {
    /// Running the application.
    #[default]
    Normal = 0,
    /// Running the bootloader.
    Bootloader = 1,
}

impl TryFrom<u8> for NodeMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Bootloader),
            other => Err(other),
        }
    }
}

/// Software version sub-record of node info.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SoftwareVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// VCS commit identifier, if known.
    pub vcs_commit_id: Option<u32>,
    /// CRC64 of the image, if known.
    pub image_crc: Option<u64>,
    /// Built in release configuration.
    pub release_build: bool,
    /// Built from a modified working tree.
    pub dirty_build: bool,
    /// Build time (UTC seconds), if valid.
    pub build_timestamp_utc: Option<u32>,
}

mod sw_flags {
    pub const VCS_COMMIT_ID_VALID: u16 = 1 << 0;
    pub const IMAGE_CRC_VALID: u16 = 1 << 1;
    pub const RELEASE_BUILD: u16 = 1 << 2;
    pub const DIRTY_BUILD: u16 = 1 << 3;
    pub const BUILD_TIMESTAMP_VALID: u16 = 1 << 4;
}

/// Hardware version sub-record of node info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HardwareVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

/// Node identity record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeInfo {
    /// Software version.
    pub software_version: SoftwareVersion,
    /// Hardware version.
    pub hardware_version: HardwareVersion,
    /// Operating mode.
    pub mode: NodeMode,
    /// 128-bit unique identifier.
    pub globally_unique_id: [u8; 16],
    /// Node name (at most 80 bytes on the wire).
    pub node_name: String,
    /// Node description (at most 80 bytes on the wire).
    pub node_description: String,
    /// Build environment description (at most 80 bytes on the wire).
    pub build_environment_description: String,
    /// Runtime environment description (at most 80 bytes on the wire).
    pub runtime_environment_description: String,
    /// Certificate of authenticity (at most 255 bytes).
    pub certificate_of_authenticity: Vec<u8>,
}

/// Image data exchanged in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageData {
    /// Byte offset of `data` within the image.
    pub image_offset: u64,
    /// Image kind.
    pub image_type: ImageType,
    /// Chunk contents, at most [`MAX_IMAGE_DATA_LENGTH`] bytes.
    pub data: Vec<u8>,
}

/// Status report sent in reply to a bootloader status request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BootloaderStatus {
    /// Monotonic uptime of the device.
    pub timestamp: Duration,
    /// Current bootloader state.
    pub state: BootloaderState,
}

/// Requests the endpoint understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Identity query.
    NodeInfo,
    /// Device management command.
    DeviceManagement(DeviceManagementCommand),
    /// State transition request combined with a status poll.
    BootloaderStatus {
        /// Requested state.
        desired_state: BootloaderState,
    },
    /// Image chunk.
    ImageData(ImageData),
}

/// Responses the endpoint sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Identity report.
    NodeInfo(NodeInfo),
    /// Device management result.
    DeviceManagement {
        /// The command being answered.
        command: DeviceManagementCommand,
        /// Result of the command.
        status: CommandStatus,
    },
    /// Status report.
    BootloaderStatus(BootloaderStatus),
    /// Image chunk echo or read-back.
    ImageData(ImageData),
}

fn expect_id(rd: &mut &[u8], id: u16) -> Option<()> {
    (rd.read_u16::<LittleEndian>().ok()? == id).then_some(())
}

fn try_decode_node_info_request(payload: &[u8]) -> Option<Request> {
    let mut rd = payload;
    expect_id(&mut rd, message_id::NODE_INFO)?;
    rd.is_empty().then_some(Request::NodeInfo)
}

fn try_decode_device_management_request(payload: &[u8]) -> Option<Request> {
    let mut rd = payload;
    expect_id(&mut rd, message_id::DEVICE_MANAGEMENT_COMMAND_REQUEST)?;
    let command = DeviceManagementCommand::try_from(rd.read_u16::<LittleEndian>().ok()?).ok()?;
    rd.is_empty()
        .then_some(Request::DeviceManagement(command))
}

fn try_decode_status_request(payload: &[u8]) -> Option<Request> {
    let mut rd = payload;
    expect_id(&mut rd, message_id::BOOTLOADER_STATUS_REQUEST)?;
    let desired_state = BootloaderState::try_from(rd.read_u8().ok()?).ok()?;
    rd.is_empty()
        .then_some(Request::BootloaderStatus { desired_state })
}

fn try_decode_image_data(payload: &[u8], id: u16) -> Option<ImageData> {
    let mut rd = payload;
    expect_id(&mut rd, id)?;
    let image_offset = rd.read_u64::<LittleEndian>().ok()?;
    let image_type = ImageType::try_from(rd.read_u8().ok()?).ok()?;
    if rd.len() > MAX_IMAGE_DATA_LENGTH {
        return None;
    }
    Some(ImageData {
        image_offset,
        image_type,
        data: rd.to_vec(),
    })
}

impl Request {
    /// Decode a standard payload.
    ///
    /// Decoders are tried in order: node info, device management, bootloader
    /// status, image data. The first one that accepts the payload wins.
    pub fn try_decode(payload: &[u8]) -> Option<Self> {
        try_decode_node_info_request(payload)
            .or_else(|| try_decode_device_management_request(payload))
            .or_else(|| try_decode_status_request(payload))
            .or_else(|| {
                try_decode_image_data(payload, message_id::BOOTLOADER_IMAGE_DATA_REQUEST)
                    .map(Request::ImageData)
            })
    }

    /// Encode this request into a standard payload.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::NodeInfo => {
                buf.write_u16::<LittleEndian>(message_id::NODE_INFO).unwrap();
            },
            Self::DeviceManagement(command) => {
                buf.write_u16::<LittleEndian>(message_id::DEVICE_MANAGEMENT_COMMAND_REQUEST)
                    .unwrap();
                buf.write_u16::<LittleEndian>(*command as u16).unwrap();
            },
            Self::BootloaderStatus { desired_state } => {
                buf.write_u16::<LittleEndian>(message_id::BOOTLOADER_STATUS_REQUEST)
                    .unwrap();
                buf.push(*desired_state as u8);
            },
            Self::ImageData(data) => {
                encode_image_data(&mut buf, message_id::BOOTLOADER_IMAGE_DATA_REQUEST, data);
            },
        }
        buf
    }
}

#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
fn encode_image_data(buf: &mut Vec<u8>, id: u16, data: &ImageData) {
    buf.write_u16::<LittleEndian>(id).unwrap();
    buf.write_u64::<LittleEndian>(data.image_offset).unwrap();
    buf.push(data.image_type as u8);
    let len = data.data.len().min(MAX_IMAGE_DATA_LENGTH);
    buf.extend_from_slice(&data.data[..len]);
}

fn write_fixed_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(NODE_INFO_STRING_LENGTH);
    buf.extend_from_slice(&bytes[..len]);
    buf.resize(buf.len() + NODE_INFO_STRING_LENGTH - len, 0);
}

fn read_fixed_string(rd: &mut &[u8]) -> Option<String> {
    let buf: &[u8] = *rd;
    if buf.len() < NODE_INFO_STRING_LENGTH {
        return None;
    }
    let (field, rest) = buf.split_at(NODE_INFO_STRING_LENGTH);
    *rd = rest;
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    Some(String::from_utf8_lossy(&field[..end]).into_owned())
}

impl NodeInfo {
    /// Encode the full record including its message id.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let sw = &self.software_version;
        let mut flags = 0u16;
        if sw.vcs_commit_id.is_some() {
            flags |= sw_flags::VCS_COMMIT_ID_VALID;
        }
        if sw.image_crc.is_some() {
            flags |= sw_flags::IMAGE_CRC_VALID;
        }
        if sw.release_build {
            flags |= sw_flags::RELEASE_BUILD;
        }
        if sw.dirty_build {
            flags |= sw_flags::DIRTY_BUILD;
        }
        if sw.build_timestamp_utc.is_some() {
            flags |= sw_flags::BUILD_TIMESTAMP_VALID;
        }

        let mut buf = Vec::with_capacity(2 + NODE_INFO_FIXED_LENGTH + MAX_COA_LENGTH);
        buf.write_u16::<LittleEndian>(message_id::NODE_INFO).unwrap();
        buf.push(sw.major);
        buf.push(sw.minor);
        buf.write_u16::<LittleEndian>(flags).unwrap();
        buf.write_u32::<LittleEndian>(sw.vcs_commit_id.unwrap_or(0)).unwrap();
        buf.write_u32::<LittleEndian>(sw.build_timestamp_utc.unwrap_or(0))
            .unwrap();
        buf.write_u64::<LittleEndian>(sw.image_crc.unwrap_or(0)).unwrap();
        buf.push(self.hardware_version.major);
        buf.push(self.hardware_version.minor);
        buf.push(self.mode as u8);
        buf.push(0); // reserved
        buf.extend_from_slice(&self.globally_unique_id);
        write_fixed_string(&mut buf, &self.node_name);
        write_fixed_string(&mut buf, &self.node_description);
        write_fixed_string(&mut buf, &self.build_environment_description);
        write_fixed_string(&mut buf, &self.runtime_environment_description);
        let coa_len = self.certificate_of_authenticity.len().min(MAX_COA_LENGTH);
        buf.extend_from_slice(&self.certificate_of_authenticity[..coa_len]);
        buf
    }

    /// Decode a full record including its message id.
    pub fn try_decode(payload: &[u8]) -> Option<Self> {
        let mut rd = payload;
        expect_id(&mut rd, message_id::NODE_INFO)?;
        if rd.len() < NODE_INFO_FIXED_LENGTH || rd.len() > NODE_INFO_FIXED_LENGTH + MAX_COA_LENGTH {
            return None;
        }

        let major = rd.read_u8().ok()?;
        let minor = rd.read_u8().ok()?;
        let flags = rd.read_u16::<LittleEndian>().ok()?;
        let vcs = rd.read_u32::<LittleEndian>().ok()?;
        let timestamp = rd.read_u32::<LittleEndian>().ok()?;
        let crc = rd.read_u64::<LittleEndian>().ok()?;
        let software_version = SoftwareVersion {
            major,
            minor,
            vcs_commit_id: (flags & sw_flags::VCS_COMMIT_ID_VALID != 0).then_some(vcs),
            image_crc: (flags & sw_flags::IMAGE_CRC_VALID != 0).then_some(crc),
            release_build: flags & sw_flags::RELEASE_BUILD != 0,
            dirty_build: flags & sw_flags::DIRTY_BUILD != 0,
            build_timestamp_utc: (flags & sw_flags::BUILD_TIMESTAMP_VALID != 0)
                .then_some(timestamp),
        };

        let hardware_version = HardwareVersion {
            major: rd.read_u8().ok()?,
            minor: rd.read_u8().ok()?,
        };
        let mode = NodeMode::try_from(rd.read_u8().ok()?).ok()?;
        let _reserved = rd.read_u8().ok()?;
        let mut globally_unique_id = [0u8; 16];
        std::io::Read::read_exact(&mut rd, &mut globally_unique_id).ok()?;

        Some(Self {
            software_version,
            hardware_version,
            mode,
            globally_unique_id,
            node_name: read_fixed_string(&mut rd)?,
            node_description: read_fixed_string(&mut rd)?,
            build_environment_description: read_fixed_string(&mut rd)?,
            runtime_environment_description: read_fixed_string(&mut rd)?,
            certificate_of_authenticity: rd.to_vec(),
        })
    }
}

impl Response {
    /// Encode this response into a standard payload.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::NodeInfo(info) => return info.encode(),
            Self::DeviceManagement { command, status } => {
                buf.write_u16::<LittleEndian>(message_id::DEVICE_MANAGEMENT_COMMAND_RESPONSE)
                    .unwrap();
                buf.write_u16::<LittleEndian>(*command as u16).unwrap();
                buf.push(*status as u8);
            },
            Self::BootloaderStatus(status) => {
                buf.write_u16::<LittleEndian>(message_id::BOOTLOADER_STATUS_RESPONSE)
                    .unwrap();
                // u64 nanoseconds covers 584 years of uptime
                buf.write_u64::<LittleEndian>(status.timestamp.as_nanos() as u64)
                    .unwrap();
                buf.write_u64::<LittleEndian>(0).unwrap(); // flags
                buf.push(status.state as u8);
            },
            Self::ImageData(data) => {
                encode_image_data(&mut buf, message_id::BOOTLOADER_IMAGE_DATA_RESPONSE, data);
            },
        }
        buf
    }

    /// Decode a standard payload sent by an endpoint.
    pub fn try_decode(payload: &[u8]) -> Option<Self> {
        let mut rd = payload;
        let id = rd.read_u16::<LittleEndian>().ok()?;
        match id {
            message_id::NODE_INFO => NodeInfo::try_decode(payload).map(Self::NodeInfo),
            message_id::DEVICE_MANAGEMENT_COMMAND_RESPONSE => {
                let command =
                    DeviceManagementCommand::try_from(rd.read_u16::<LittleEndian>().ok()?).ok()?;
                let status = CommandStatus::try_from(rd.read_u8().ok()?).ok()?;
                rd.is_empty()
                    .then_some(Self::DeviceManagement { command, status })
            },
            message_id::BOOTLOADER_STATUS_RESPONSE => {
                let nanos = rd.read_u64::<LittleEndian>().ok()?;
                let _flags = rd.read_u64::<LittleEndian>().ok()?;
                let state = BootloaderState::try_from(rd.read_u8().ok()?).ok()?;
                rd.is_empty().then_some(Self::BootloaderStatus(BootloaderStatus {
                    timestamp: Duration::from_nanos(nanos),
                    state,
                }))
            },
            message_id::BOOTLOADER_IMAGE_DATA_RESPONSE => {
                try_decode_image_data(payload, id).map(Self::ImageData)
            },
            _ => None,
        }
    }
}
