//! Firmware upload through the HAT bootloader.
//!
//! The bootloader speaks the same line protocol as the firmware, with a
//! `BHBL>` prompt marking readiness for the next step:
//!
//! ```text
//! > clear                        < BHBL>
//! > load <len> <checksum>
//! > <STX> firmware bytes <ETX>\r  < BHBL>
//! > signature <len>
//! > <STX> signature bytes <ETX>\r < BHBL>
//! ```
//!
//! The checksum is validated by the bootloader against the same LFSR the
//! host computes in [`hatlink_protocol::checksum`].

use std::path::Path;

use bytes::Bytes;
use tracing::{debug, info, warn};

use hatlink_core::{
    HatError, Result,
    constants::{MAX_JUNK_LINES, MAX_PROMPT_POKES},
};
use hatlink_protocol::{WireEvent, checksum, commands, parse_line};

use crate::config::Timing;
use crate::link::{LinkReader, LinkWriter};

/// Firmware binary and its signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    firmware: Bytes,
    signature: Bytes,
}

impl FirmwareImage {
    pub fn new(firmware: impl Into<Bytes>, signature: impl Into<Bytes>) -> Self {
        Self {
            firmware: firmware.into(),
            signature: signature.into(),
        }
    }

    /// Read both files.
    ///
    /// # Errors
    /// Returns `HatError::Firmware` naming the file that could not be read.
    pub async fn from_files(firmware: impl AsRef<Path>, signature: impl AsRef<Path>) -> Result<Self> {
        let firmware = read_file(firmware.as_ref()).await?;
        let signature = read_file(signature.as_ref()).await?;
        Ok(Self::new(firmware, signature))
    }

    pub fn firmware(&self) -> &[u8] {
        &self.firmware
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Checksum announced with the `load` command.
    pub fn checksum(&self) -> u32 {
        checksum(&self.firmware)
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| HatError::firmware(format!("cannot read {}: {e}", path.display())))
}

/// Upload `image` to a HAT sitting in its bootloader.
///
/// # Errors
/// - `HatError::Firmware` if the bootloader stops answering with its prompt
/// - `HatError::Io` / `HatError::LinkClosed` from the link
pub async fn load_firmware(
    reader: &mut LinkReader,
    writer: &LinkWriter,
    image: &FirmwareImage,
    timing: &Timing,
) -> Result<()> {
    info!(
        firmware_len = image.firmware.len(),
        signature_len = image.signature.len(),
        "Uploading firmware"
    );

    // A prompt left over from the banner would answer the wrong step.
    for _ in 0..MAX_JUNK_LINES {
        if reader.read_line(timing.upload_pause()).await?.is_none() {
            break;
        }
    }

    writer.write_command(&commands::clear()).await?;
    wait_prompt(reader, writer, timing, "clear").await?;

    writer
        .write_command(&commands::load(image.firmware.len(), image.checksum()))
        .await?;
    tokio::time::sleep(timing.upload_pause()).await;
    writer.write_framed(&image.firmware, "firmware").await?;
    wait_prompt(reader, writer, timing, "load").await?;

    writer
        .write_command(&commands::signature(image.signature.len()))
        .await?;
    tokio::time::sleep(timing.upload_pause()).await;
    writer.write_framed(&image.signature, "signature").await?;
    wait_prompt(reader, writer, timing, "signature").await?;

    info!("Firmware upload complete");
    Ok(())
}

/// Read until the bootloader prompt. A silent bootloader is poked with a
/// bare `\r`, a bounded number of times.
async fn wait_prompt(
    reader: &mut LinkReader,
    writer: &LinkWriter,
    timing: &Timing,
    step: &str,
) -> Result<()> {
    let mut pokes = 0;
    loop {
        match reader.read_line(timing.read_timeout()).await? {
            Some(line) => {
                if parse_line(&line) == Some(WireEvent::Prompt) {
                    debug!(step, "Bootloader prompt");
                    return Ok(());
                }
            }
            None => {
                pokes += 1;
                if pokes > MAX_PROMPT_POKES {
                    return Err(HatError::firmware(format!(
                        "no bootloader prompt after {step}"
                    )));
                }
                warn!(step, pokes, "No bootloader prompt, poking");
                writer.write_command("\r").await?;
            }
        }
    }
}
