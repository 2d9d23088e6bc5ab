// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::mock_collector::MockCollector;
use pinpoint_agent::transport::{ChannelTransport, TcpTransport};
use pinpoint_agent::wire::frame::APPLICATION_REQUEST;
use pinpoint_agent::wire::{encode_frame, message_type, EmptyStruct};
use pinpoint_agent::{headers_to_metadata, metadata_to_headers, Application, Config};

fn config() -> Config {
    Config {
        app_name: "checkout".to_string(),
        agent_id: "checkout-1".to_string(),
        ..Default::default()
    }
}

fn disabled_app() -> Application {
    let (transport, _rx) = ChannelTransport::channel(1);
    let config = Config {
        enabled: false,
        ..config()
    };
    Application::new(config, Arc::new(transport)).expect("valid config")
}

#[test]
fn test_empty_struct_frame_bytes() {
    let frame = encode_frame(5, &EmptyStruct).expect("encodable");
    assert_eq!(frame.as_ref(), &[0xEF, 0x10, 0x00, 0x05, 0x00]);
}

#[test]
fn test_basic_transaction_scenario() {
    let app = disabled_app();
    let txn = app.start_transaction("GET /cart");

    let a = txn.start_segment("A", None);
    std::thread::sleep(Duration::from_millis(2));
    let b = txn.start_segment("B", Some(&a));
    std::thread::sleep(Duration::from_millis(2));
    b.end();
    std::thread::sleep(Duration::from_millis(2));
    a.end();
    txn.end();

    let mut harvest = app.harvest_buffer().take();
    assert_eq!(harvest.transactions.len(), 1);
    let record = harvest.transactions.pop_front().unwrap();
    assert_eq!(record.segments.len(), 2);
    let (seg_a, seg_b) = (&record.segments[0], &record.segments[1]);
    assert_eq!(seg_b.parent_span_id, seg_a.span_id);
    assert!(seg_a.end_time.unwrap() > seg_a.start_time);
    assert!(seg_b.end_time.unwrap() > seg_b.start_time);
}

#[test]
fn test_async_link_scenario() {
    let app = disabled_app();
    let t = app.start_transaction("parent");
    let t2 = t.new_goroutine("child");
    t.end();

    let worker = std::thread::spawn(move || {
        let seg = t2.start_segment("work", None);
        seg.end();
        t2.end();
        t2
    });
    let t2 = worker.join().unwrap();

    let records: Vec<_> = app.harvest_buffer().take().transactions.into();
    assert_eq!(records.len(), 2);
    let (parent, child) = (&records[0], &records[1]);
    assert_eq!(child.trace_id.agent_id, parent.trace_id.agent_id);
    assert_eq!(child.trace_id.start_time, parent.trace_id.start_time);
    assert_ne!(child.trace_id.sequence_id, parent.trace_id.sequence_id);
    assert_eq!(child.parent_span_id, parent.span_id);
    assert_eq!(&child.trace_id, t2.trace_id());
    assert_eq!(child.segments.len(), 1);
}

#[test]
fn test_missing_propagation_headers() {
    let metadata = headers_to_metadata(&HashMap::<String, String>::new());
    assert_eq!(metadata.parent_span_id, -1);
    assert!(metadata.trace_id_decoded.is_none());
}

#[test]
fn test_trace_continues_across_services() {
    let frontend = disabled_app();
    let backend = disabled_app();

    let caller = frontend.start_transaction("GET /");
    let call = caller.start_segment("http client", None);
    let headers = metadata_to_headers(&caller.outbound_metadata(Some(&call)));

    let callee = backend.start_transaction_with_metadata("GET /api", &headers_to_metadata(&headers));
    assert_eq!(callee.trace_id(), caller.trace_id());
    assert_eq!(callee.parent_span_id(), caller.span_id());
    call.end();
    callee.end();
    caller.end();

    let sent = frontend.harvest_buffer().take().transactions.pop_front().unwrap();
    assert_eq!(sent.segments[0].next_span_id, Some(callee.span_id()));
    let received = backend.harvest_buffer().take().transactions.pop_front().unwrap();
    assert_eq!(received.parent_app_name.as_deref(), Some("checkout"));
}

#[tokio::test]
async fn test_shutdown_delivers_frames_over_tcp() {
    let collector = MockCollector::start().await;
    let transport = TcpTransport::new(collector.addr);
    let app = Application::new(config(), Arc::new(transport)).expect("valid config");

    for i in 0..3 {
        let txn = app.start_transaction(format!("job-{i}"));
        txn.start_segment("step", None).end();
        txn.end();
    }
    app.record_custom_metric("jobs", 1.0);
    app.record_custom_metric("jobs", 2.0);

    app.shutdown(Duration::from_secs(5))
        .await
        .expect("final harvest completes");

    let frames = collector.wait_for_frames(4, Duration::from_secs(5)).await;
    assert_eq!(frames.len(), 4);
    let kinds: Vec<u16> = frames.iter().map(|f| f.message_type()).collect();
    assert_eq!(
        kinds,
        vec![
            message_type::SPAN,
            message_type::SPAN,
            message_type::SPAN,
            message_type::CUSTOM_METRIC,
        ]
    );
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.header.request_type, APPLICATION_REQUEST);
        assert_eq!(frame.header.message_id as usize, i);
        assert_eq!(&frame.payload[..2], &[0xEF, 0x10]);
        assert!(frame
            .payload
            .windows(b"checkout-1".len())
            .any(|w| w == b"checkout-1"));
    }
}

#[tokio::test]
async fn test_periodic_harvest() {
    let collector = MockCollector::start().await;
    let config = Config {
        flush_interval: Duration::from_millis(100),
        ..config()
    };
    let app = Application::new(config, Arc::new(TcpTransport::new(collector.addr)))
        .expect("valid config");

    app.start_transaction("tick").end();
    let frames = collector.wait_for_frames(1, Duration::from_secs(5)).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].message_type(), message_type::SPAN);

    app.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_unreachable_collector_does_not_block_shutdown() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = TcpTransport::new(addr)
        .with_timeouts(Duration::from_millis(200), Duration::from_millis(200));
    let app = Application::new(config(), Arc::new(transport)).expect("valid config");
    app.start_transaction("lost").end();

    assert!(app.shutdown(Duration::from_secs(5)).await.is_ok());
}
