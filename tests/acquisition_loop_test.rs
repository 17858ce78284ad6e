//! End-to-end tests of the acquisition loop against the simulated bench.

mod common;

use common::{spawn, spawn_with, STATE_TIMEOUT};
use pulsed_odmr::error::OdmrError;
use pulsed_odmr::experiment::messages::OdmrEvent;
use pulsed_odmr::experiment::state::RunState;
use pulsed_odmr::hardware::mock::DIP_CENTER_HZ;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_tiny_cw_sweep_produces_a_line() {
    let rig = spawn();
    rig.start_running().await;
    rig.wait_for_lines(1).await;

    let snapshot = rig.odmr.snapshot();
    assert_eq!(snapshot.frequencies.len(), 11);
    assert_eq!(snapshot.mean.len(), 11);
    assert_eq!(snapshot.matrix.ncols(), 11);
    assert!(snapshot.matrix.row(0).iter().all(|v| *v > 0.0));

    let params = rig.odmr.parameters().await.unwrap();
    assert_eq!(params.frequencies.as_deref().map(<[f64]>::len), Some(11));
    assert!(params.average_factor.unwrap() >= 1);
    assert!(params.effective_pi_pulse_length.is_none());

    // Deepest point of the spectrum sits on the simulated dip.
    let (min_idx, _) = snapshot
        .mean
        .iter()
        .enumerate()
        .fold((0, f64::MAX), |acc, (i, v)| if *v < acc.1 { (i, *v) } else { acc });
    assert_eq!(snapshot.frequencies[min_idx], DIP_CENTER_HZ);

    rig.odmr.stop().await.unwrap();
    rig.odmr.wait_for_state(RunState::Idle, STATE_TIMEOUT).await.unwrap();
    assert!(rig.instruments_off());
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_instruments_armed_in_order_with_accepted_values() {
    let rig = spawn_with(|c| c.sweep.power = -10.004);
    rig.start_running().await;

    let calls = rig.bench.calls();
    let position = |op: &str| calls.iter().position(|c| c == op).unwrap();
    assert!(position("awg.write_waveform") < position("mw.set_list"));
    assert!(position("mw.set_list") < position("mw.list_on"));
    assert!(position("mw.list_on") < position("counter.start"));
    assert!(rig.laser.is_enabled());

    let (_, power) = rig.bench.microwave_list();
    assert_eq!(power, -10.0);
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_during_sleep_is_prompt() {
    let rig = spawn_with(|c| c.sweep.single_sweep_time = 0.5);
    rig.start_running().await;
    rig.wait_for_lines(1).await;

    let requested = Instant::now();
    rig.odmr.stop().await.unwrap();
    rig.odmr
        .wait_for_state(RunState::Idle, Duration::from_millis(400))
        .await
        .unwrap();
    assert!(requested.elapsed() < Duration::from_millis(400));

    let snapshot = rig.odmr.snapshot();
    assert_eq!(snapshot.elapsed_lines, 1);
    assert!(snapshot.matrix.row(0).iter().all(|v| *v > 0.0));
    assert!(rig.instruments_off());
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_while_idle_is_a_no_op() {
    let rig = spawn();
    rig.odmr.stop().await.unwrap();
    assert_eq!(rig.odmr.status().await.unwrap().state, RunState::Idle);
    assert!(rig.bench.calls().is_empty());
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_counter_timeout_stops_without_error() {
    let rig = spawn_with(|c| c.acquisition.counter_timeout_ms = 100);
    rig.bench.set_counter_never_ready(true);
    let mut plots = rig.odmr.plots();

    rig.start_running().await;
    plots.borrow_and_update();
    let status = rig
        .odmr
        .wait_for_state(RunState::Idle, STATE_TIMEOUT)
        .await
        .unwrap();
    assert!(status.reason.unwrap().contains("counter not ready"));
    assert!(rig.instruments_off());

    // Final plot update after the stop, with no line written.
    assert!(plots.has_changed().unwrap());
    assert_eq!(plots.borrow_and_update().elapsed_lines, 0);
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_while_counter_stalled_is_prompt() {
    let rig = spawn_with(|c| c.acquisition.counter_timeout_ms = 5000);
    rig.bench.set_counter_never_ready(true);
    rig.start_running().await;
    // Past the line sleep, into the ready poll.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let requested = Instant::now();
    let status = rig.odmr.status().await.unwrap();
    assert_eq!(status.state, RunState::Running);
    rig.odmr.stop().await.unwrap();
    let status = rig
        .odmr
        .wait_for_state(RunState::Idle, Duration::from_millis(500))
        .await
        .unwrap();
    assert!(requested.elapsed() < Duration::from_millis(500));
    assert!(status.reason.is_none());
    assert!(rig.bench.calls().iter().any(|c| c == "counter.ready"));
    assert!(rig.instruments_off());
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_short_counter_buffer_discards_line() {
    let rig = spawn();
    rig.bench.set_short_buffer(true);
    rig.odmr.start().await.unwrap();
    let status = rig
        .odmr
        .wait_for_state(RunState::Idle, STATE_TIMEOUT)
        .await
        .unwrap();
    assert!(status.reason.unwrap().contains("bins"));
    assert_eq!(rig.odmr.snapshot().elapsed_lines, 0);
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clear_during_run_zeroes_older_lines() {
    let rig = spawn_with(|c| c.acquisition.rolling_capacity = 200);
    rig.start_running().await;
    rig.wait_for_lines(3).await;

    let before = rig.odmr.snapshot().elapsed_lines;
    rig.odmr.clear_matrix().await.unwrap();
    rig.wait_for_lines(before + 1).await;
    rig.odmr.stop().await.unwrap();
    rig.odmr.wait_for_state(RunState::Idle, STATE_TIMEOUT).await.unwrap();

    let snapshot = rig.odmr.snapshot();
    let filled = snapshot
        .matrix
        .outer_iter()
        .filter(|row| row.iter().any(|v| *v != 0.0))
        .count() as u64;
    assert!(filled >= 1);
    assert!(filled <= snapshot.elapsed_lines - before);
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clear_while_idle_is_immediate() {
    let rig = spawn();
    rig.start_running().await;
    rig.wait_for_lines(1).await;
    rig.odmr.stop().await.unwrap();
    rig.odmr.wait_for_state(RunState::Idle, STATE_TIMEOUT).await.unwrap();

    rig.odmr.clear_matrix().await.unwrap();
    let snapshot = rig.odmr.snapshot();
    assert!(snapshot.matrix.iter().all(|v| *v == 0.0));
    assert!(snapshot.mean.iter().all(|v| *v == 0.0));
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_during_arming() {
    let rig = spawn();
    rig.bench.set_setup_delay(Duration::from_millis(200));
    rig.odmr.start().await.unwrap();
    rig.odmr
        .wait_for_state(RunState::Arming, STATE_TIMEOUT)
        .await
        .unwrap();
    rig.odmr.stop().await.unwrap();
    rig.odmr.wait_for_state(RunState::Idle, STATE_TIMEOUT).await.unwrap();

    let calls = rig.bench.calls();
    assert!(!calls.iter().any(|c| c == "mw.list_on"));
    assert!(!calls.iter().any(|c| c == "counter.start"));
    assert!(rig.instruments_off());
    assert_eq!(rig.odmr.snapshot().elapsed_lines, 0);
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_set_sweep_refused_while_running() {
    let rig = spawn();
    rig.start_running().await;
    let sweep = rig.odmr.parameters().await.unwrap().sweep;
    let err = rig.odmr.set_sweep(sweep).await.unwrap_err();
    assert!(matches!(
        err,
        OdmrError::Busy {
            state: RunState::Running,
            ..
        }
    ));
    let err = rig.odmr.start().await.unwrap_err();
    assert!(matches!(err, OdmrError::Busy { .. }));
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_set_sweep_returns_corrected_values() {
    let rig = spawn();
    let mut sweep = rig.odmr.parameters().await.unwrap().sweep;
    sweep.stop = 7e9;
    sweep.power = 20.0;
    let corrected = rig.odmr.set_sweep(sweep).await.unwrap();
    assert_eq!(corrected.stop, 6e9);
    assert_eq!(corrected.power, 10.0);
    let params = rig.odmr.parameters().await.unwrap();
    assert_eq!(params.sweep, corrected);
    assert!(!params.adjustments.is_empty());
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_run_time_limit_stops_run() {
    let rig = spawn_with(|c| c.acquisition.run_time_limit_seconds = 0.05);
    rig.start_running().await;
    let status = rig
        .odmr
        .wait_for_state(RunState::Idle, STATE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(status.reason.as_deref(), Some("run time limit reached"));
    let snapshot = rig.odmr.snapshot();
    assert!(snapshot.elapsed_lines >= 1);
    assert!(snapshot.elapsed_time >= 0.05);
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_and_continue() {
    let rig = spawn();
    rig.start_running().await;
    rig.wait_for_lines(1).await;

    rig.odmr.pause().await.unwrap();
    rig.odmr.wait_for_state(RunState::Paused, STATE_TIMEOUT).await.unwrap();
    // A line already in flight when the pause arrives is still completed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let paused_lines = rig.odmr.snapshot().elapsed_lines;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.odmr.snapshot().elapsed_lines, paused_lines);
    assert!(rig.laser.is_enabled());

    rig.odmr.resume().await.unwrap();
    rig.wait_for_lines(paused_lines + 1).await;
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_events_report_state_and_progress() {
    let rig = spawn();
    let mut events = rig.odmr.subscribe_events();
    rig.start_running().await;
    rig.wait_for_lines(1).await;
    rig.odmr.stop().await.unwrap();
    rig.odmr.wait_for_state(RunState::Idle, STATE_TIMEOUT).await.unwrap();

    let mut states = Vec::new();
    let mut progress = false;
    while let Ok(event) = events.try_recv() {
        match event {
            OdmrEvent::StateChanged { state, .. } => states.push(state),
            OdmrEvent::ElapsedTimeUpdated { lines, .. } => progress |= lines >= 1,
            _ => {}
        }
    }
    assert_eq!(
        states,
        vec![
            RunState::Arming,
            RunState::Running,
            RunState::Stopping,
            RunState::Idle
        ]
    );
    assert!(progress);
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_laser_held_elsewhere_fails_arming() {
    let rig = spawn();
    rig.laser.acquire().unwrap();
    rig.odmr.start().await.unwrap();
    let status = rig
        .odmr
        .wait_for_state(RunState::Error, STATE_TIMEOUT)
        .await
        .unwrap();
    assert!(status.reason.unwrap().contains("laser"));
    assert!(!rig.bench.microwave_running());

    rig.odmr.clear_error().await.unwrap();
    assert_eq!(rig.odmr.status().await.unwrap().state, RunState::Idle);
    rig.odmr.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_while_running_tears_down() {
    let rig = spawn();
    rig.start_running().await;
    rig.wait_for_lines(1).await;
    let bench = rig.bench.clone();
    let laser = rig.laser.clone();
    rig.odmr.shutdown().await.unwrap();
    assert!(!bench.microwave_running());
    assert!(!bench.generator_playing());
    assert!(!laser.is_enabled());
}
