//! Common test utilities for protocol integration tests.
//!
//! Provides a canned HAT session transcript and helpers to push raw bytes
//! through a duplex stream framed with [`HatLineCodec`].

#![allow(dead_code)]

use futures::StreamExt;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::FramedRead;

use hatlink_protocol::HatLineCodec;

/// A firmware start-up as seen on the wire, CRLF-terminated.
pub const STARTUP_TRANSCRIPT: &[&str] = &[
    "Firmware version: 1636109636 2021-11-05T10:53:56+00:00",
    "P0: connected to active ID 30",
    "P1: no device detected",
    "P2: connected to active ID 40",
    "P3: connected to passive ID 8",
];

/// Create a framed reader and the raw writer feeding it.
pub fn framed_pair(buffer_size: usize) -> (FramedRead<DuplexStream, HatLineCodec>, DuplexStream) {
    let (reader, writer) = tokio::io::duplex(buffer_size);
    (FramedRead::new(reader, HatLineCodec::new()), writer)
}

/// Write `lines` CRLF-terminated.
pub async fn write_lines(writer: &mut DuplexStream, lines: &[&str]) {
    for line in lines {
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\r\n").await.unwrap();
    }
}

/// Read `count` lines, failing the test on error or early end.
pub async fn read_lines(
    framed: &mut FramedRead<DuplexStream, HatLineCodec>,
    count: usize,
) -> Vec<String> {
    let mut lines = Vec::with_capacity(count);
    for _ in 0..count {
        lines.push(framed.next().await.unwrap().unwrap());
    }
    lines
}
