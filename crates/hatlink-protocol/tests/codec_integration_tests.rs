//! Integration tests for HatLineCodec with Tokio streams.
//!
//! These tests push raw serial bytes through a duplex stream and check the
//! decoded lines and their classification.

mod common;

use futures::StreamExt;
use hatlink_core::{PortId, Value};
use hatlink_protocol::{PortStatus, WireEvent, parse_line};
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn test_startup_transcript_classifies() {
    let (mut framed, mut writer) = common::framed_pair(1024);
    common::write_lines(&mut writer, common::STARTUP_TRANSCRIPT).await;

    let lines = common::read_lines(&mut framed, common::STARTUP_TRANSCRIPT.len()).await;
    let events: Vec<WireEvent> = lines.iter().filter_map(|l| parse_line(l)).collect();

    assert_eq!(events.len(), 5);
    assert!(matches!(
        events[0],
        WireEvent::FirmwareBanner {
            version: Some(1_636_109_636)
        }
    ));
    let listing_replies = events
        .iter()
        .filter(|e| matches!(e, WireEvent::Port { status, .. } if status.is_listing_reply()))
        .count();
    assert_eq!(listing_replies, 4);
}

#[tokio::test]
async fn test_bytes_split_across_writes() {
    let (mut framed, mut writer) = common::framed_pair(64);

    writer.write_all(b"P1C0: 12 ").await.unwrap();
    writer.write_all(b"-37 ").await.unwrap();
    writer.write_all(b"180\r\n").await.unwrap();

    let line = framed.next().await.unwrap().unwrap();
    assert_eq!(
        parse_line(&line),
        Some(WireEvent::Data {
            port: PortId::new(1).unwrap(),
            values: vec![Value::Int(12), Value::Int(-37), Value::Int(180)],
        })
    );
}

#[tokio::test]
async fn test_noise_between_events_is_skipped() {
    let (mut framed, mut writer) = common::framed_pair(1024);
    common::write_lines(
        &mut writer,
        &[
            "P0: connecting to active device",
            "random negotiation noise",
            "P0: ramp done",
        ],
    )
    .await;

    let lines = common::read_lines(&mut framed, 3).await;
    let events: Vec<WireEvent> = lines.iter().filter_map(|l| parse_line(l)).collect();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[1],
        WireEvent::Port {
            port: PortId::new(0).unwrap(),
            status: PortStatus::RampDone,
        }
    );
}

#[tokio::test]
async fn test_prompt_without_newline() {
    let (mut framed, mut writer) = common::framed_pair(64);
    writer.write_all(b"\r\nBHBL> ").await.unwrap();

    let lines = common::read_lines(&mut framed, 2).await;
    assert_eq!(lines, ["", "BHBL>"]);
    assert_eq!(parse_line(&lines[1]), Some(WireEvent::Prompt));
}

#[tokio::test]
async fn test_stream_ends_on_close() {
    let (mut framed, mut writer) = common::framed_pair(64);
    writer.write_all(b"8.1 V").await.unwrap();
    drop(writer);

    assert_eq!(framed.next().await.unwrap().unwrap(), "8.1 V");
    assert!(framed.next().await.is_none());
}
