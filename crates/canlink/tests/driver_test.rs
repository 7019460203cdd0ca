//! End-to-end tests for the CAN driver against the mock bus
//!
//! Each test builds its own driver and mock platform, brings interfaces up,
//! injects inbound frames and inspects what was written to the bus.

use std::sync::Arc;
use std::time::Duration;

use canlink::bus::mock::{MockPlatform, RecordingBitrateControl, WriteBehavior};
use canlink::{
    BringUpStage, BroadcastSink, BusError, BusFrame, CanDriver, DriverConfig, DriverError,
    InboundFrame, InterfaceConfig, InterfaceHandle, ReceiveConfig, RxHandle, RxStatsSnapshot,
    TransmitPolicy,
};
use pretty_assertions::assert_eq;
use tokio_test::{assert_err, assert_ok};
use tokio::sync::broadcast;
use tokio::time::timeout;

struct TestHarness {
    platform: Arc<MockPlatform>,
    bitrate: Arc<RecordingBitrateControl>,
    driver: CanDriver,
    frames: broadcast::Receiver<InboundFrame>,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_config(Self::fast_config())
    }

    fn fast_config() -> DriverConfig {
        DriverConfig {
            receive: ReceiveConfig {
                poll_interval_ms: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn with_config(config: DriverConfig) -> Self {
        init_tracing();
        let platform = Arc::new(MockPlatform::new(&["can0", "can1", "can2", "can3"]));
        let bitrate = Arc::new(RecordingBitrateControl::with_log(platform.call_log()));
        let sink = BroadcastSink::new(256);
        let frames = sink.subscribe();
        let driver = CanDriver::new(config, platform.clone(), Arc::new(sink))
            .with_bitrate_control(bitrate.clone());

        Self {
            platform,
            bitrate,
            driver,
            frames,
        }
    }

    async fn up(&self, handle: &str, channel: &str) -> RxHandle {
        self.driver
            .bring_up(&InterfaceHandle::new(handle), &InterfaceConfig::new(channel))
            .await
            .unwrap()
    }

    async fn next_frame(&mut self) -> InboundFrame {
        timeout(Duration::from_secs(2), self.frames.recv())
            .await
            .expect("timed out waiting for inbound frame")
            .unwrap()
    }

    async fn assert_no_frame(&mut self) {
        let res = timeout(Duration::from_millis(50), self.frames.recv()).await;
        assert!(res.is_err(), "unexpected inbound frame: {:?}", res);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "canlink=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

async fn wait_for_stats(rx: &RxHandle, pred: impl Fn(&RxStatsSnapshot) -> bool) {
    for _ in 0..400 {
        if pred(&rx.stats()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("stats condition not reached: {:?}", rx.stats());
}

// =============================================================================
// Receive
// =============================================================================

#[tokio::test]
async fn test_accept_all_delivers_extended_frame() {
    let mut h = TestHarness::new();
    let rx = h.up("A", "can0").await;

    let conn = h.platform.connection("can0").unwrap();
    assert_eq!(conn.filter(), None);
    conn.inject(BusFrame::extended(0x123, &[1, 2, 3, 4]).unwrap());

    let frame = h.next_frame().await;
    assert_eq!(frame.interface, InterfaceHandle::new("A"));
    assert_eq!(frame.id, 0x123);
    assert_eq!(frame.len(), 4);
    assert_eq!(frame.data(), &[1, 2, 3, 4]);

    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_remote_frame_is_dropped_and_loop_continues() {
    let mut h = TestHarness::new();
    let rx = h.up("A", "can0").await;
    let conn = h.platform.connection("can0").unwrap();

    conn.inject(BusFrame::new(0xC000_0123, &[]).unwrap());
    h.assert_no_frame().await;
    assert_eq!(rx.stats().remote_frames, 1);

    conn.inject(BusFrame::extended(0x124, &[5]).unwrap());
    let frame = h.next_frame().await;
    assert_eq!(frame.id, 0x124);
    assert_eq!(rx.stats().delivered, 1);

    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_unaccepted_kinds_never_reach_sink() {
    let mut h = TestHarness::new();
    let rx = h.up("A", "can0").await;
    let conn = h.platform.connection("can0").unwrap();

    conn.inject(BusFrame::new(0xA000_0000, &[0; 8]).unwrap()); // error
    conn.inject(BusFrame::new(0xC000_0001, &[]).unwrap()); // remote
    conn.inject(BusFrame::new(0x0000_0123, &[1]).unwrap()); // standard
    conn.inject(BusFrame::new(0xE000_0002, &[]).unwrap()); // error + remote
    conn.inject_error(BusError::Malformed("read 7 of 16 bytes".to_string()));

    wait_for_stats(&rx, |s| s.discarded() == 5).await;
    h.assert_no_frame().await;

    let stats = rx.stats();
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.error_frames, 2);
    assert_eq!(stats.remote_frames, 1);
    assert_eq!(stats.standard_frames, 1);
    assert_eq!(stats.malformed, 1);

    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_delivered_id_has_flags_cleared() {
    let mut h = TestHarness::new();
    let rx = h.up("A", "can0").await;
    let conn = h.platform.connection("can0").unwrap();

    for id in [0x0u32, 0x1, 0x7FF, 0x1234_5678, 0x1FFF_FFFF] {
        conn.inject(BusFrame::extended(id, &[0xEE]).unwrap());
        let frame = h.next_frame().await;
        assert_eq!(frame.id, id);
        assert_eq!(frame.id & 0xE000_0000, 0);
    }

    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_acceptance_filter_installed() {
    let mut h = TestHarness::new();
    let handle = InterfaceHandle::new("A");
    let rx = h
        .driver
        .bring_up(
            &handle,
            &InterfaceConfig::new("can0").with_filter(0x8000_0A00, 0x8000_0F00),
        )
        .await
        .unwrap();

    let conn = h.platform.connection("can0").unwrap();
    assert_eq!(conn.filter(), Some((0x8000_0A00, 0x8000_0F00)));

    conn.inject(BusFrame::extended(0xB01, &[1]).unwrap());
    conn.inject(BusFrame::extended(0xA01, &[2]).unwrap());

    let frame = h.next_frame().await;
    assert_eq!(frame.id, 0xA01);
    h.assert_no_frame().await;

    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_frames_carry_their_interface() {
    let mut h = TestHarness::new();
    let rx_a = h.up("A", "can0").await;
    let rx_b = h.up("B", "can1").await;

    h.platform
        .connection("can1")
        .unwrap()
        .inject(BusFrame::extended(0x2, &[2]).unwrap());
    let frame = h.next_frame().await;
    assert_eq!(frame.interface.as_str(), "B");

    h.platform
        .connection("can0")
        .unwrap()
        .inject(BusFrame::extended(0x1, &[1]).unwrap());
    let frame = h.next_frame().await;
    assert_eq!(frame.interface.as_str(), "A");

    h.driver.shutdown(rx_a).await.unwrap();
    h.driver.shutdown(rx_b).await.unwrap();
}

#[tokio::test]
async fn test_reception_continues_after_handle_dropped() {
    let mut h = TestHarness::new();
    let a = InterfaceHandle::new("A");
    drop(h.up("A", "can0").await);

    h.platform
        .connection("can0")
        .unwrap()
        .inject(BusFrame::extended(0x123, &[1, 2, 3, 4]).unwrap());
    let frame = h.next_frame().await;
    assert_eq!(frame.id, 0x123);
    assert_eq!(frame.data(), &[1, 2, 3, 4]);

    assert_ok!(h.driver.send(&a, 0x42, &[9, 9]));

    h.driver.bring_down(&a).unwrap();
    let rx = h.up("A", "can1").await;
    h.driver.shutdown(rx).await.unwrap();
}

// =============================================================================
// Transmit
// =============================================================================

#[tokio::test]
async fn test_send_writes_extended_frame() {
    let h = TestHarness::new();
    let handle = InterfaceHandle::new("A");
    let rx = h.up("A", "can0").await;

    h.driver.send(&handle, 0x42, &[9, 9]).unwrap();

    let written = h.platform.connection("can0").unwrap().written();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].id_word(), 0x8000_0042);
    assert_eq!(written[0].len(), 2);
    assert_eq!(written[0].data(), &[9, 9]);

    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_send_oversized_payload_never_writes() {
    let h = TestHarness::new();
    let handle = InterfaceHandle::new("A");
    let rx = h.up("A", "can0").await;

    let err = h.driver.send(&handle, 0x42, &[0; 9]).unwrap_err();
    assert!(matches!(err, DriverError::OversizedPayload { len: 9 }));
    assert_eq!(h.platform.connection("can0").unwrap().write_attempts(), 0);

    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_send_unknown_handle() {
    let h = TestHarness::new();
    let err = h
        .driver
        .send(&InterfaceHandle::new("ghost"), 0x42, &[1])
        .unwrap_err();
    assert!(matches!(err, DriverError::ChannelNotFound(_)));
}

#[tokio::test]
async fn test_send_async_retries_through_congestion() {
    let h = TestHarness::new();
    let handle = InterfaceHandle::new("A");
    let rx = h.up("A", "can0").await;
    let conn = h.platform.connection("can0").unwrap();
    conn.set_write_behavior(WriteBehavior::BufferFullFor(5));

    h.driver.send_async(&handle, 0x99, &[1, 2, 3]).await.unwrap();

    assert_eq!(conn.write_attempts(), 6);
    assert_eq!(conn.written().len(), 1);

    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_exhausts_default_retry_budget() {
    let h = TestHarness::new();
    assert_eq!(h.driver.config().transmit, TransmitPolicy::default());

    let handle = InterfaceHandle::new("A");
    let rx = h.up("A", "can0").await;
    let conn = h.platform.connection("can0").unwrap();
    conn.set_write_behavior(WriteBehavior::AlwaysBufferFull);

    let err = h.driver.send_async(&handle, 0x42, &[9, 9]).await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::TransmitExhausted {
            attempts: 1000,
            source: BusError::BufferFull
        }
    ));
    assert_eq!(conn.write_attempts(), 1000);
    assert!(conn.written().is_empty());

    let times = conn.attempt_times();
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(10));
    }

    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_send_hard_error_fails_immediately() {
    let h = TestHarness::new();
    let handle = InterfaceHandle::new("A");
    let rx = h.up("A", "can0").await;
    let conn = h.platform.connection("can0").unwrap();
    conn.set_write_behavior(WriteBehavior::Fail(std::io::ErrorKind::NetworkDown));

    let err = h.driver.send(&handle, 0x1, &[]).unwrap_err();
    assert!(matches!(err, DriverError::TransmitExhausted { attempts: 1, .. }));

    h.driver.shutdown(rx).await.unwrap();
}

// =============================================================================
// Bring-up
// =============================================================================

#[tokio::test]
async fn test_capacity_limit() {
    let h = TestHarness::new();
    let rx0 = h.up("A", "can0").await;
    let rx1 = h.up("B", "can1").await;
    let rx2 = h.up("C", "can2").await;

    let err = h
        .driver
        .bring_up(&InterfaceHandle::new("D"), &InterfaceConfig::new("can3"))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::CapacityExceeded { capacity: 3 }));

    // Existing interfaces keep working
    h.driver.send(&InterfaceHandle::new("B"), 0x5, &[5]).unwrap();
    assert_eq!(h.driver.registry().len(), 3);

    // Shutting one down frees its slot
    h.driver.shutdown(rx1).await.unwrap();
    let rx3 = h.up("D", "can3").await;

    for rx in [rx0, rx2, rx3] {
        h.driver.shutdown(rx).await.unwrap();
    }
}

#[tokio::test]
async fn test_failed_filter_install_rolls_back() {
    let h = TestHarness::new();
    h.platform.set_fail_filter(true);

    let err = h
        .driver
        .bring_up(
            &InterfaceHandle::new("A"),
            &InterfaceConfig::new("can0").with_filter(0x100, 0x700),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DriverError::BringUpFailure {
            stage: BringUpStage::Filter,
            ..
        }
    ));

    assert!(h.driver.registry().is_empty());
    assert_eq!(h.platform.open_connections(), 0);

    h.platform.set_fail_filter(false);
    let rx = h.up("A", "can0").await;
    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_failed_open_releases_slot() {
    let config = DriverConfig {
        capacity: 1,
        ..TestHarness::fast_config()
    };
    let h = TestHarness::with_config(config);
    h.platform.set_fail_open(true);

    let err = h
        .driver
        .bring_up(&InterfaceHandle::new("A"), &InterfaceConfig::new("can0"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DriverError::BringUpFailure {
            stage: BringUpStage::Open,
            ..
        }
    ));

    h.platform.set_fail_open(false);
    let rx = h.up("A", "can0").await;
    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_handle_rejected() {
    let h = TestHarness::new();
    let rx = h.up("A", "can0").await;

    let err = h
        .driver
        .bring_up(&InterfaceHandle::new("A"), &InterfaceConfig::new("can1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::AlreadyRegistered(_)));

    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_bitrate_applied_before_open() {
    let h = TestHarness::new();
    let rx = h
        .driver
        .bring_up(
            &InterfaceHandle::new("A"),
            &InterfaceConfig::new("can0").with_bitrate(500_000),
        )
        .await
        .unwrap();

    assert_eq!(
        h.bitrate.calls(),
        vec![
            "stop can0",
            "bitrate can0 500000",
            "start can0",
            "resolve can0",
            "open 1"
        ]
    );
    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_bitrate_failure_does_not_block_bring_up() {
    let h = TestHarness::new();
    h.bitrate.set_fail_set_bitrate(true);

    let rx = h
        .driver
        .bring_up(
            &InterfaceHandle::new("A"),
            &InterfaceConfig::new("can0").with_bitrate(125_000),
        )
        .await
        .unwrap();
    assert_eq!(h.driver.registry().len(), 1);

    h.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_bring_up_without_bitrate_control() {
    let platform = Arc::new(MockPlatform::new(&["can0"]));
    let driver = CanDriver::new(
        TestHarness::fast_config(),
        platform,
        Arc::new(|_frame: InboundFrame| {}),
    );

    let rx = driver
        .bring_up(
            &InterfaceHandle::new("A"),
            &InterfaceConfig::new("can0").with_bitrate(1_000_000),
        )
        .await
        .unwrap();
    driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_independent_drivers() {
    let first = TestHarness::new();
    let second = TestHarness::new();

    let rx = first.up("A", "can0").await;
    assert_err!(second.driver.send(&InterfaceHandle::new("A"), 0x1, &[]));
    assert_ok!(first.driver.send(&InterfaceHandle::new("A"), 0x1, &[]));

    first.driver.shutdown(rx).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_connection() {
    let h = TestHarness::new();
    let rx = h.up("A", "can0").await;
    assert_eq!(h.platform.open_connections(), 1);

    h.driver.shutdown(rx).await.unwrap();

    assert_eq!(h.platform.open_connections(), 0);
    let err = h.driver.send(&InterfaceHandle::new("A"), 0x1, &[]).unwrap_err();
    assert!(matches!(err, DriverError::ChannelNotFound(_)));
}
