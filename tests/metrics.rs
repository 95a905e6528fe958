#![cfg(feature = "metrics")]
//! Tests for `wsengine` metrics helpers.
//!
//! These tests verify that counters and gauges update as expected using
//! `metrics_util::debugging::DebuggingRecorder`.
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use rstest::rstest;
use wsengine::metrics::{
    CONNECTIONS_ACTIVE,
    Direction,
    ERRORS_TOTAL,
    ErrorKind,
    FRAMES_PROCESSED,
    dec_connections,
    inc_connections,
    inc_errors,
    inc_frames,
};

/// Creates a debugging recorder and snapshotter for metrics testing.
fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

fn counter_with_label(
    snapshotter: &Snapshotter,
    name: &str,
    label: &str,
    value: &str,
) -> Option<u64> {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find_map(|(k, _, _, v)| {
            let matches = k.key().name() == name
                && k.key()
                    .labels()
                    .any(|l| l.key() == label && l.value() == value);
            match v {
                DebugValue::Counter(c) if matches => Some(c),
                _ => None,
            }
        })
}

#[rstest]
#[case(Direction::Inbound, "inbound")]
#[case(Direction::Outbound, "outbound")]
fn frame_metric_increments(#[case] direction: Direction, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        inc_frames(direction);
        inc_frames(direction);
    });

    assert_eq!(
        counter_with_label(&snapshotter, FRAMES_PROCESSED, "direction", label),
        Some(2)
    );
}

#[rstest]
#[case(ErrorKind::Handshake, "handshake")]
#[case(ErrorKind::Protocol, "protocol")]
#[case(ErrorKind::Io, "io")]
#[case(ErrorKind::Accept, "accept")]
#[case(ErrorKind::Panic, "panic")]
fn error_metric_is_labelled_by_kind(#[case] kind: ErrorKind, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || inc_errors(kind));

    assert_eq!(
        counter_with_label(&snapshotter, ERRORS_TOTAL, "kind", label),
        Some(1)
    );
}

#[test]
fn connection_gauge_tracks_open_connections() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        inc_connections();
        inc_connections();
        dec_connections();
    });

    let metrics = snapshotter.snapshot().into_vec();
    let found = metrics.iter().any(|(k, _, _, v)| {
        k.key().name() == CONNECTIONS_ACTIVE
            && matches!(v, DebugValue::Gauge(g) if (g.into_inner() - 1.0).abs() < f64::EPSILON)
    });
    assert!(found, "connection gauge not recorded");
}
