//! End-to-end tests: the table driver against the protocol emulator, wired
//! over a loopback line.
//!
//! Run with: cargo test --test rotating_table_tests

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rotating_table::config::{SerialPortSettings, TableClientSettings};
use rotating_table::emulator::MotionProfile;
use rotating_table::{
    CancelSignal, RotatingTable, RotatingTableEmulator, TableClient, TableError,
    LoopbackTransport,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Fixture {
    client: Arc<TableClient>,
    emulator: RotatingTableEmulator,
}

async fn fixture(profile: MotionProfile) -> Fixture {
    init_logs();
    let (client_end, device_end) = LoopbackTransport::pair();
    let emulator = RotatingTableEmulator::spawn(Arc::new(device_end), profile).await;

    let mut settings = TableClientSettings::new(SerialPortSettings::for_port("loopback"));
    settings.command_initiation_timeout = Duration::from_secs(2);
    let client = Arc::new(TableClient::new(Arc::new(client_end), settings));

    Fixture { client, emulator }
}

fn assert_positions(actual: &[f64], expected: &[f64]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "expected {expected:?}, got {actual:?}"
    );
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 0.1, "expected {e}, got {a} in {actual:?}");
    }
}

/// Delay that consumes one permit per step and blocks once they run out.
fn gated_delay(gate: Arc<tokio::sync::Semaphore>) -> MotionProfile {
    MotionProfile::default().with_delay_fn(move || -> BoxFuture<'static, ()> {
        let gate = Arc::clone(&gate);
        Box::pin(async move {
            if let Ok(permit) = gate.acquire_owned().await {
                permit.forget();
            }
        })
    })
}

#[tokio::test]
async fn set_then_get_acceleration_round_trips() {
    let fixture = fixture(MotionProfile::default()).await;

    for expected in [5, 10] {
        fixture.client.set_acceleration(expected).await.unwrap();
        let acceleration = fixture.client.get_acceleration().await.unwrap();
        assert_eq!(acceleration, expected);
    }

    fixture.emulator.shutdown().await;
}

#[tokio::test]
async fn out_of_range_acceleration_is_rejected_locally() {
    let fixture = fixture(MotionProfile::default()).await;

    for value in [0, 11] {
        let err = fixture.client.set_acceleration(value).await.unwrap_err();
        assert!(matches!(err, TableError::InvalidAcceleration(v) if v == value));
    }

    // The emulator never saw a line: it still answers normally.
    fixture.client.set_acceleration(3).await.unwrap();
    assert_eq!(fixture.client.get_acceleration().await.unwrap(), 3);

    fixture.emulator.shutdown().await;
}

#[tokio::test]
async fn rotate_by_zero_angle_is_a_local_noop() {
    let fixture = fixture(MotionProfile::default()).await;

    let positions = fixture
        .client
        .start_rotating(0.0)
        .await
        .unwrap()
        .collect_positions()
        .await
        .unwrap();
    assert!(positions.is_empty());

    let last = fixture
        .client
        .rotate(0.00001, CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(last, None);

    fixture.emulator.shutdown().await;
}

#[tokio::test]
async fn rotation_streams_every_step() {
    let cases: [(f64, f64, &[f64]); 3] = [
        (30.0, 5.5, &[0.0, 5.5, 11.0, 16.5, 22.0, 27.5, 30.0]),
        (1.0, 33.0, &[0.0, 1.0]),
        (100.0, 33.0, &[0.0, 33.0, 66.0, 99.0, 100.0]),
    ];

    for (angle, step, expected) in cases {
        let profile = MotionProfile::default()
            .with_fixed_step(step)
            .with_step_interval(Duration::from_millis(10));
        let fixture = fixture(profile).await;

        let positions = fixture
            .client
            .start_rotating(angle)
            .await
            .unwrap()
            .collect_positions()
            .await
            .unwrap();
        assert_positions(&positions, expected);

        fixture.emulator.shutdown().await;
    }
}

#[tokio::test]
async fn rotate_waits_for_the_full_motion() {
    let profile = MotionProfile::default()
        .with_fixed_step(10.0)
        .with_step_interval(Duration::from_millis(10));
    let fixture = fixture(profile).await;

    let last = fixture
        .client
        .rotate(30.0, CancelSignal::new())
        .await
        .unwrap();
    assert_eq!(last, Some(30.0));
    assert!(!fixture.emulator.is_rotating());

    fixture.emulator.shutdown().await;
}

#[tokio::test]
async fn cancelling_rotate_soft_stops_and_keeps_last_seen_position() {
    // Three permits: positions 0, 1, 2, 3 flow out, then the motion blocks.
    let gate = Arc::new(tokio::sync::Semaphore::new(3));
    let profile = gated_delay(Arc::clone(&gate)).with_fixed_step(1.0);
    let fixture = fixture(profile).await;

    let cancel = CancelSignal::new();
    let rotation = tokio::spawn({
        let client = Arc::clone(&fixture.client);
        let cancel = cancel.clone();
        async move { client.rotate(1000.0, cancel).await }
    });

    // Let the stream drain up to the blocked step, then cancel.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(fixture.emulator.is_rotating());
    cancel.cancel();

    let last = tokio::time::timeout(Duration::from_secs(5), rotation)
        .await
        .expect("cancelled rotate must not hang")
        .unwrap()
        .unwrap();
    assert_eq!(last, Some(3.0));
    assert!(!fixture.emulator.is_rotating());

    fixture.emulator.shutdown().await;
}

#[tokio::test]
async fn stop_halts_motion_and_waits_for_end() {
    for soft in [false, true] {
        let gate = Arc::new(tokio::sync::Semaphore::new(3));
        let profile = gated_delay(Arc::clone(&gate)).with_fixed_step(5.0);
        let fixture = fixture(profile).await;

        let mut stream = fixture.client.start_rotating(30.0).await.unwrap();
        let mut positions = Vec::new();
        while positions.len() < 4 {
            match stream.recv().await {
                Some(Ok(position)) => positions.push(position),
                other => panic!("unexpected stream item: {other:?}"),
            }
        }
        assert_positions(&positions, &[0.0, 5.0, 10.0, 15.0]);

        fixture.client.stop(soft).await.unwrap();
        assert!(!fixture.emulator.is_rotating());

        // The interrupted motion still finishes its protocol: one final
        // position, then a clean end of stream.
        match stream.recv().await {
            Some(Ok(position)) => assert!((position - 20.0).abs() < 0.1),
            other => panic!("expected the final position, got {other:?}"),
        }
        assert!(stream.recv().await.is_none());

        fixture.emulator.shutdown().await;
    }
}

#[tokio::test]
async fn stop_with_no_rotation_sends_nothing() {
    let fixture = fixture(MotionProfile::default()).await;

    fixture.client.stop(false).await.unwrap();
    fixture.client.stop(true).await.unwrap();

    // A STOP reaching the emulator before any rotation would kill it; it
    // still answering proves nothing was sent.
    fixture.client.set_acceleration(2).await.unwrap();
    assert_eq!(fixture.client.get_acceleration().await.unwrap(), 2);

    fixture.emulator.shutdown().await;
}

#[tokio::test]
async fn overlapping_rotation_is_refused() {
    let profile = MotionProfile::default()
        .with_fixed_step(1.0)
        .with_step_interval(Duration::from_secs(3600));
    let fixture = fixture(profile).await;

    let _stream = fixture.client.start_rotating(100.0).await.unwrap();
    let err = fixture.client.start_rotating(50.0).await.unwrap_err();
    assert!(matches!(err, TableError::RotationInProgress));

    fixture.client.stop(false).await.unwrap();
    fixture.emulator.shutdown().await;
}
