//! End-to-end tests driving the endpoint and the block-transfer receiver over
//! an in-memory stream.

use std::io::{self, Cursor, Read, Write};
use std::time::Duration;

use bootlink::endpoint::CHANNEL_FAILURE_STATUS;
use bootlink::protocol::crc::crc16_xmodem;
use bootlink::protocol::messages::{
    BootloaderState, BootloaderStatus, CommandStatus, DeviceManagementCommand, ImageData,
    ImageType, MAX_IMAGE_DATA_LENGTH, NodeInfo, NodeMode, Request, Response,
};
use bootlink::protocol::ymodem::{ChecksumMode, control};
use bootlink::{
    AppInfo, BootloaderController, ChannelResult, ControllerView, Endpoint, Frame,
    FrameCodec, ImageDownloader, IoChannel, ParserOutput, Platform, TimedByteChannel,
    WriterSink, YmodemConfig, YmodemReceiver,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Host input on one side, device output on the other.
struct Duplex {
    input: Cursor<Vec<u8>>,
    output: Vec<u8>,
}

impl Duplex {
    fn new(input: Vec<u8>) -> Self {
        Self {
            input: Cursor::new(input),
            output: Vec::new(),
        }
    }

    fn drained(&self) -> bool {
        self.input.position() as usize >= self.input.get_ref().len()
    }
}

impl Read for Duplex {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for Duplex {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Minimal SLIP-like codec: `0xC0 type payload 0xC0`, `0xDB` escapes.
#[derive(Default)]
struct SlipCodec {
    buf: Vec<u8>,
    in_frame: bool,
    escaped: bool,
}

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;

impl FrameCodec for SlipCodec {
    fn process_next_byte(&mut self, byte: u8) -> Option<ParserOutput> {
        if byte == END {
            let buf = std::mem::take(&mut self.buf);
            let was_in_frame = self.in_frame;
            self.in_frame = true;
            self.escaped = false;
            if !was_in_frame && !buf.is_empty() {
                return Some(ParserOutput::ExtraneousData(buf));
            }
            if was_in_frame && !buf.is_empty() {
                self.in_frame = false;
                return Some(ParserOutput::Frame(Frame::new(buf[0], &buf[1..])));
            }
            return None;
        }

        if self.in_frame && self.escaped {
            self.buf.push(byte ^ 0x20);
            self.escaped = false;
        } else if self.in_frame && byte == ESC {
            self.escaped = true;
        } else {
            self.buf.push(byte);
        }
        None
    }

    fn encode(&self, type_code: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![END];
        for &b in std::iter::once(&type_code).chain(payload) {
            if b == END || b == ESC {
                out.extend_from_slice(&[ESC, b ^ 0x20]);
            } else {
                out.push(b);
            }
        }
        out.push(END);
        out
    }
}

struct Board {
    link: IoChannel<Duplex>,
}

impl TimedByteChannel for Board {
    fn emit(&mut self, byte: u8, timeout: Duration) -> ChannelResult<()> {
        self.link.emit(byte, timeout)
    }

    fn receive(&mut self, timeout: Duration) -> ChannelResult<u8> {
        self.link.receive(timeout)
    }
}

impl Platform for Board {
    fn process_unhandled_command(&mut self, _command: DeviceManagementCommand) -> CommandStatus {
        CommandStatus::BadCommand
    }

    fn should_exit(&self) -> bool {
        self.link.get_ref().drained()
    }
}

struct FlashController {
    state: BootloaderState,
    flash: Vec<u8>,
    app: Option<AppInfo>,
}

impl ControllerView for FlashController {
    fn state(&self) -> BootloaderState {
        self.state
    }

    fn monotonic_uptime(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn app_info(&self) -> Option<AppInfo> {
        self.app
    }
}

impl BootloaderController for FlashController {
    fn cancel_boot(&mut self) {
        self.state = BootloaderState::BootCancelled;
    }

    fn request_boot(&mut self) {
        if self.app.is_some() {
            self.state = BootloaderState::ReadyToBoot;
        }
    }

    fn upgrade_app(&mut self, downloader: &mut dyn ImageDownloader) -> i16 {
        self.state = BootloaderState::AppUpgradeInProgress;
        self.app = None;

        let mut sink = WriterSink::new(Vec::new());
        let status = downloader.download_image(&mut sink, &*self);
        self.flash = sink.finish().expect("flush to memory");

        if status >= 0 {
            self.app = Some(AppInfo {
                major_version: 1,
                minor_version: 4,
                vcs_commit: 0x00AB_CDEF,
                image_crc: u64::from(crc16_xmodem(&self.flash)),
                release_build: true,
                dirty_build: false,
                build_timestamp_utc: None,
            });
            self.state = BootloaderState::BootDelay;
        } else {
            self.state = BootloaderState::NoAppToBoot;
        }
        status
    }
}

fn host_frames(requests: &[Request]) -> Vec<u8> {
    let codec = SlipCodec::default();
    requests
        .iter()
        .flat_map(|r| codec.encode(bootlink::protocol::STANDARD_FRAME_TYPE_CODE, &r.encode()))
        .collect()
}

fn upload_requests(image: &[u8]) -> Vec<Request> {
    let mut requests = vec![Request::BootloaderStatus {
        desired_state: BootloaderState::AppUpgradeInProgress,
    }];
    let mut offset = 0;
    for piece in image.chunks(MAX_IMAGE_DATA_LENGTH) {
        requests.push(Request::ImageData(ImageData {
            image_offset: offset as u64,
            image_type: ImageType::Application,
            data: piece.to_vec(),
        }));
        offset += piece.len();
    }
    if image.len() % MAX_IMAGE_DATA_LENGTH == 0 {
        requests.push(Request::ImageData(ImageData {
            image_offset: offset as u64,
            image_type: ImageType::Application,
            data: Vec::new(),
        }));
    }
    requests
}

fn decode_responses(output: &[u8]) -> Vec<Response> {
    let mut codec = SlipCodec::default();
    output
        .iter()
        .filter_map(|&b| match codec.process_next_byte(b)? {
            ParserOutput::Frame(frame) => Response::try_decode(&frame.payload),
            ParserOutput::ExtraneousData(_) => None,
        })
        .collect()
}

fn run_endpoint(input: Vec<u8>) -> (FlashController, Vec<Response>, Option<i16>) {
    let controller = FlashController {
        state: BootloaderState::BootDelay,
        flash: Vec::new(),
        app: None,
    };
    let board = Board {
        link: IoChannel::new(Duplex::new(input)),
    };
    let node_info = NodeInfo {
        node_name: "org.example.bootlink".into(),
        ..NodeInfo::default()
    };

    let mut endpoint = Endpoint::new(controller, board, SlipCodec::default(), node_info);
    endpoint.run();
    let status = endpoint.last_upgrade_status();
    let (controller, board, _) = endpoint.into_parts();
    let responses = decode_responses(&board.link.into_inner().output);
    (controller, responses, status)
}

#[test]
fn full_upgrade_then_boot() {
    init_logging();

    // Include frame delimiters in the image so escaping is exercised
    let image: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).chain([END, ESC]).collect();

    let mut requests = vec![Request::BootloaderStatus {
        desired_state: BootloaderState::BootCancelled,
    }];
    requests.extend(upload_requests(&image));
    requests.push(Request::NodeInfo);
    requests.push(Request::BootloaderStatus {
        desired_state: BootloaderState::ReadyToBoot,
    });

    let mut input = b"boot banner\r\n".to_vec();
    input.extend(host_frames(&requests));
    let (controller, responses, status) = run_endpoint(input);

    assert_eq!(status, Some(0));
    assert_eq!(controller.flash, image);
    assert_eq!(controller.state, BootloaderState::ReadyToBoot);

    let states: Vec<_> = responses
        .iter()
        .filter_map(|r| match r {
            Response::BootloaderStatus(BootloaderStatus { state, .. }) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            BootloaderState::BootCancelled,
            BootloaderState::AppUpgradeInProgress,
            BootloaderState::ReadyToBoot,
        ]
    );

    let echoed: Vec<u8> = responses
        .iter()
        .filter_map(|r| match r {
            Response::ImageData(data) => Some(data.data.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(echoed, image);

    let info = responses
        .iter()
        .find_map(|r| match r {
            Response::NodeInfo(info) => Some(info),
            _ => None,
        })
        .expect("node info reply");
    assert_eq!(info.mode, NodeMode::Bootloader);
    assert_eq!(info.node_name, "org.example.bootlink");
    assert_eq!(info.software_version.major, 1);
    assert_eq!(info.software_version.minor, 4);
    assert_eq!(info.software_version.vcs_commit_id, Some(0x00AB_CDEF));
}

#[test]
fn image_of_whole_chunks_ends_with_empty_chunk() {
    init_logging();

    let image = vec![0x5A; 2 * MAX_IMAGE_DATA_LENGTH];
    let requests = upload_requests(&image);
    assert_eq!(requests.len(), 4);

    let (controller, responses, status) = run_endpoint(host_frames(&requests));
    assert_eq!(status, Some(0));
    assert_eq!(controller.flash, image);
    assert_eq!(controller.state, BootloaderState::BootDelay);
    assert_eq!(responses.len(), 4);
}

#[test]
fn truncated_upgrade_reports_interruption() {
    init_logging();

    // The host disappears after the first chunk; the stream then fails
    let requests = upload_requests(&[0x11; 600]);
    let input = host_frames(&requests[..2]);

    struct Failing(Duplex);
    impl Read for Failing {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.drained() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
            }
            self.0.read(buf)
        }
    }
    impl Write for Failing {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingBoard {
        link: IoChannel<Failing>,
        failures: u32,
    }
    impl TimedByteChannel for FailingBoard {
        fn emit(&mut self, byte: u8, timeout: Duration) -> ChannelResult<()> {
            self.link.emit(byte, timeout)
        }

        fn receive(&mut self, timeout: Duration) -> ChannelResult<u8> {
            let result = self.link.receive(timeout);
            if result.is_err() {
                self.failures += 1;
            }
            result
        }
    }
    impl Platform for FailingBoard {
        fn process_unhandled_command(&mut self, _: DeviceManagementCommand) -> CommandStatus {
            CommandStatus::BadCommand
        }

        fn should_exit(&self) -> bool {
            self.failures > 0
        }
    }

    let controller = FlashController {
        state: BootloaderState::BootCancelled,
        flash: Vec::new(),
        app: None,
    };
    let board = FailingBoard {
        link: IoChannel::new(Failing(Duplex::new(input))),
        failures: 0,
    };
    let mut endpoint = Endpoint::new(controller, board, SlipCodec::default(), NodeInfo::default());
    endpoint.run();

    assert_eq!(endpoint.last_upgrade_status(), Some(CHANNEL_FAILURE_STATUS));
    assert_eq!(endpoint.controller().state, BootloaderState::NoAppToBoot);
    assert_eq!(endpoint.controller().flash.len(), MAX_IMAGE_DATA_LENGTH);
}

fn ymodem_block(number: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![control::STX, number, !number];
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc16_xmodem(payload).to_be_bytes());
    out
}

#[test]
fn ymodem_transfer_over_io_stream() {
    init_logging();

    let file: Vec<u8> = (0..1500u32).map(|i| (i % 200) as u8 + 0x20).collect();

    let mut header = vec![0u8; 1024];
    let info = b"app.bin\x001500\x00";
    header[..info.len()].copy_from_slice(info);

    let mut second = file[1024..].to_vec();
    second.resize(1024, 0x1A);

    let mut input = ymodem_block(0, &header);
    input.extend(ymodem_block(1, &file[..1024]));
    input.extend(ymodem_block(2, &second));
    input.push(control::EOT);

    let mut channel = IoChannel::new(Duplex::new(input));
    let config = YmodemConfig {
        mode: ChecksumMode::Crc16,
        poll_interval: Duration::from_millis(1),
        start_interval: Duration::from_millis(1),
        char_timeout: Duration::from_millis(1),
        block_timeout: Duration::from_millis(1),
        ..YmodemConfig::default()
    };

    let mut sink = WriterSink::new(Vec::new());
    let mut last_progress = None;
    let summary = YmodemReceiver::with_config(&mut channel, config)
        .with_cancel(|| false)
        .receive(&mut sink, |done, total| last_progress = Some((done, total)))
        .expect("transfer completes");

    assert_eq!(summary.blocks, 2);
    assert_eq!(summary.bytes, 1500);
    assert_eq!(summary.file.map(|f| f.name), Some("app.bin".to_string()));
    assert_eq!(last_progress, Some((1500, Some(1500))));
    assert_eq!(sink.written(), 1500);
    assert_eq!(sink.finish().expect("flush"), file);

    assert_eq!(
        channel.into_inner().output,
        vec![control::C, control::ACK, control::C, control::ACK, control::ACK, control::ACK]
    );
}
