//! Boot state detection and bring-up.
//!
//! At start-up the host cannot know what is on the other end of the UART:
//! current firmware, an older firmware, the bootloader, or a controller
//! that is halfway through a reset and still echoing. [`determine_state`]
//! probes with `version` and classifies the reply; [`bring_up`] turns the
//! answer into a HAT running current firmware, resetting and reflashing as
//! needed.
//!
//! ```text
//!                 ┌──────────── version ────────────┐
//!                 ▼                                  │ echo / blank / junk
//!           determine_state ─────────────────────────┘ (bounded)
//!     ┌──────────┬──────────┴──────────┬─────────────┐
//!  Running   NeedsUpdate           InBootloader    Unknown
//!     │          │ read image,          │            │ reset, re-probe once
//!     │          │ reset                │            │
//!     │          └──────► load ◄────────┘            └──► HatNotFound
//!     ▼                    │ reboot
//!  Listing              Reboot
//! ```
//!
//! Every loop here is bounded, so bring-up ends on its own: a silent
//! controller costs two passes of `MAX_EMPTY_READS + 1` probe timeouts plus
//! one reset.

use tracing::{debug, info, warn};

use hatlink_core::{
    HandshakeState, HatError, LinkState, Result,
    constants::{MAX_CHATTER_LINES, MAX_EMPTY_READS, MAX_HANDSHAKE_RETRIES, MAX_JUNK_LINES},
};
use hatlink_protocol::{WireEvent, commands, parse_line};

use crate::config::HatConfig;
use crate::gpio::{ResetLines, reset_hat};
use crate::link::{LinkReader, LinkWriter};
use crate::loader::{FirmwareImage, load_firmware};

/// Echo of the probe command while the controller still has echo enabled.
const PROBE_ECHO: &str = "version";

/// Outcome of one detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub state: LinkState,
    pub handshake: HandshakeState,
    /// Device negotiation chatter was seen while probing.
    pub saw_chatter: bool,
}

/// How the engine should reach the ready state once the reader runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Firmware is current: deselect, `list` and wait for four replies.
    Listing,
    /// Firmware was just uploaded: `reboot` and wait for the ports banner.
    Reboot,
}

/// Probe the controller and classify its state.
///
/// # Errors
/// `HatError::Config` without an expected firmware version, otherwise only
/// link errors; an unresponsive controller yields `LinkState::Unknown`.
pub async fn determine_state(
    reader: &mut LinkReader,
    writer: &LinkWriter,
    config: &HatConfig,
) -> Result<Detection> {
    let timing = &config.timing;
    let expected_version = config.expected_version()?;
    let mut detection = Detection {
        state: LinkState::Unknown,
        handshake: HandshakeState::NotStarted,
        saw_chatter: false,
    };
    let mut empty_reads = 0;
    let mut junk_lines = 0;
    let mut chatter_lines = 0;
    let mut retries = 0;

    writer.write_command(&commands::version()).await?;
    detection.handshake = HandshakeState::ProbeSent;

    loop {
        let Some(line) = reader.read_line(timing.probe_timeout()).await? else {
            empty_reads += 1;
            if empty_reads > MAX_EMPTY_READS {
                debug!(empty_reads, "No answer to version probe");
                break;
            }
            continue;
        };

        if line.is_empty() || line == PROBE_ECHO {
            // The controller is still echoing or mid-reset; ask again.
            retries += 1;
            detection.handshake = HandshakeState::EchoConfirmed;
            if retries > MAX_HANDSHAKE_RETRIES {
                debug!(retries, "Handshake did not settle");
                break;
            }
            writer.write_command(&commands::version()).await?;
            continue;
        }

        match parse_line(&line) {
            Some(WireEvent::FirmwareBanner { version }) => {
                detection.state = if version == Some(expected_version) {
                    LinkState::RunningFirmware
                } else {
                    info!(?version, expected_version, "Firmware version mismatch");
                    LinkState::NeedsFirmwareUpdate
                };
                break;
            }
            Some(WireEvent::BootloaderBanner) => {
                detection.state = LinkState::InBootloader;
                break;
            }
            Some(event) if event.is_connection_chatter() => {
                detection.saw_chatter = true;
                chatter_lines += 1;
                if chatter_lines > MAX_CHATTER_LINES {
                    debug!(chatter_lines, "Negotiation chatter without a banner");
                    break;
                }
            }
            _ => {
                junk_lines += 1;
                if junk_lines > MAX_JUNK_LINES {
                    debug!(junk_lines, "Too many unexpected lines");
                    break;
                }
                writer.write_command(&commands::version()).await?;
            }
        }
    }

    if detection.saw_chatter {
        debug!("Device negotiation seen, settling");
        tokio::time::sleep(timing.settle_delay()).await;
    }
    info!(state = %detection.state, "Boot state determined");
    Ok(detection)
}

/// Bring the controller to current firmware.
///
/// `image` is used for an upload if one is needed; when `None` it is read
/// from the configured paths at that point. The image is in hand before the
/// controller is reset into its bootloader, so a missing file leaves
/// running firmware alone.
///
/// # Errors
/// - `HatError::HatNotFound` if nothing recognisable answers after a reset
/// - `HatError::Firmware` if an upload fails
/// - GPIO and link errors
pub async fn bring_up(
    reader: &mut LinkReader,
    writer: &LinkWriter,
    lines: &mut dyn ResetLines,
    image: Option<&FirmwareImage>,
    config: &HatConfig,
) -> Result<StartMode> {
    let timing = &config.timing;
    let mut state = determine_state(reader, writer, config).await?.state;

    if state == LinkState::Unknown {
        warn!("HAT did not answer, resetting");
        reset_hat(lines, timing).await?;
        state = determine_state(reader, writer, config).await?.state;
    }

    match state {
        LinkState::RunningFirmware => Ok(StartMode::Listing),
        LinkState::Unknown => Err(HatError::HatNotFound),
        LinkState::NeedsFirmwareUpdate | LinkState::InBootloader => {
            let loaded;
            let image = match image {
                Some(image) => image,
                None => {
                    loaded =
                        FirmwareImage::from_files(&config.firmware_path, &config.signature_path)
                            .await?;
                    &loaded
                }
            };
            if state == LinkState::NeedsFirmwareUpdate {
                // BOOT0 held low across the reset lands in the bootloader.
                reset_hat(lines, timing).await?;
            }
            load_firmware(reader, writer, image, timing).await?;
            Ok(StartMode::Reboot)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timing;
    use crate::link;
    use crate::mock::{LineEvent, RecordingResetLines};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const VERSION: u64 = 1_636_109_636;

    fn config() -> HatConfig {
        HatConfig {
            firmware_version: Some(VERSION),
            timing: Timing {
                probe_timeout_ms: 50,
                ..Timing::default()
            },
            ..HatConfig::default()
        }
    }

    async fn detect(script: &[u8]) -> (Detection, DuplexStream) {
        let (ours, mut theirs) = tokio::io::duplex(4096);
        theirs.write_all(script).await.unwrap();
        let (mut reader, writer) = link::split(ours);
        let detection = determine_state(&mut reader, &writer, &config()).await.unwrap();
        (detection, theirs)
    }

    async fn probes_sent(theirs: &mut DuplexStream) -> usize {
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(std::time::Duration::from_millis(10), theirs.read(&mut buf))
            .await
            .map_or(0, |r| r.unwrap());
        String::from_utf8_lossy(&buf[..n]).matches("version\r").count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_firmware() {
        let (d, _) = detect(b"Firmware version: 1636109636 2021-11-05T10:53:56+00:00\r\n").await;
        assert_eq!(d.state, LinkState::RunningFirmware);
        assert_eq!(d.handshake, HandshakeState::ProbeSent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_firmware() {
        let (d, _) = detect(b"Firmware version: 1600000000 2020-01-01\r\n").await;
        assert_eq!(d.state, LinkState::NeedsFirmwareUpdate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootloader() {
        let (d, _) = detect(b"BuildHAT bootloader version 1.0\r\nBHBL> ").await;
        assert_eq!(d.state, LinkState::InBootloader);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_and_blank_lines_resend_probe() {
        let (d, mut theirs) =
            detect(b"version\r\n\r\nFirmware version: 1636109636 x\r\n").await;
        assert_eq!(d.state, LinkState::RunningFirmware);
        assert_eq!(d.handshake, HandshakeState::EchoConfirmed);
        assert_eq!(probes_sent(&mut theirs).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_junk_gives_up_as_unknown() {
        let (d, _) = detect(b"a\r\nb\r\nc\r\nd\r\ne\r\nf\r\ng\r\n").await;
        assert_eq!(d.state, LinkState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_unknown() {
        let started = tokio::time::Instant::now();
        let (d, _) = detect(b"").await;
        assert_eq!(d.state, LinkState::Unknown);
        // Four empty reads of 50ms each.
        assert!(started.elapsed() >= std::time::Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chatter_is_not_junk_and_settles() {
        let started = tokio::time::Instant::now();
        let script = b"P0: connecting to active device\r\n\
            P1: connecting to active device\r\n\
            P0: established serial communication with active ID 30\r\n\
            P2: changing baud to 115200\r\n\
            P3: connecting to active device\r\n\
            P1: connecting to active device\r\n\
            Firmware version: 1636109636 x\r\n";
        let (d, _) = detect(script).await;

        assert_eq!(d.state, LinkState::RunningFirmware);
        assert!(d.saw_chatter);
        assert!(started.elapsed() >= std::time::Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_endless_chatter_gives_up_as_unknown() {
        let script = "P0: connecting to active device\r\n"
            .repeat(MAX_CHATTER_LINES as usize + 8)
            + "Firmware version: 1636109636 x\r\n";
        let (d, _) = detect(script.as_bytes()).await;

        assert_eq!(d.state, LinkState::Unknown);
        assert!(d.saw_chatter);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_version_is_a_config_error() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let (mut reader, writer) = link::split(ours);
        let config = HatConfig {
            firmware_version: None,
            ..config()
        };
        let err = determine_state(&mut reader, &writer, &config).await.unwrap_err();
        assert!(matches!(err, HatError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_image_leaves_old_firmware_running() {
        let (ours, mut theirs) = tokio::io::duplex(4096);
        theirs
            .write_all(b"Firmware version: 1600000000 2020-01-01\r\n")
            .await
            .unwrap();
        let (mut reader, writer) = link::split(ours);
        let mut lines = RecordingResetLines::new();
        let config = HatConfig {
            firmware_path: "/nonexistent/firmware.bin".into(),
            signature_path: "/nonexistent/signature.bin".into(),
            ..config()
        };

        let err = bring_up(&mut reader, &writer, &mut lines, None, &config)
            .await
            .unwrap_err();

        assert!(matches!(err, HatError::Firmware { .. }), "{err:?}");
        assert!(lines.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bring_up_unknown_twice_is_not_found() {
        let (ours, _theirs) = tokio::io::duplex(4096);
        let (mut reader, writer) = link::split(ours);
        let mut lines = RecordingResetLines::new();

        let err = bring_up(&mut reader, &writer, &mut lines, None, &config())
            .await
            .unwrap_err();

        assert!(matches!(err, HatError::HatNotFound));
        assert!(lines.events().contains(&LineEvent::Released));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bring_up_current_firmware_lists() {
        let (ours, mut theirs) = tokio::io::duplex(4096);
        theirs
            .write_all(b"Firmware version: 1636109636 x\r\n")
            .await
            .unwrap();
        let (mut reader, writer) = link::split(ours);
        let mut lines = RecordingResetLines::new();

        let mode = bring_up(&mut reader, &writer, &mut lines, None, &config())
            .await
            .unwrap();

        assert_eq!(mode, StartMode::Listing);
        assert!(lines.events().is_empty());
    }
}
