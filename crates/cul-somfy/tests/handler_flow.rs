//! End-to-end behaviour of the Somfy handler against recording doubles.
//!
//! Time is paused, so travel times and the calibration settle delay are
//! simulated exactly.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use cul_proto::frame::SomfyCommand;
use cul_somfy::simulator::Direction;
use cul_somfy::SomfyError;

#[tokio::test(start_paused = true)]
async fn open_then_stop_halfway_reports_fifty_percent() {
    let rig = rig(shutter(Some(10.0), Some(10.0), Some(0)));

    rig.send("OPEN").await.unwrap();
    assert_eq!(rig.publisher.last("state").as_deref(), Some("opening"));
    let snap = rig.handler.snapshot(ADDR).await.unwrap();
    assert!(snap.timer_armed);
    assert_eq!(snap.direction, Direction::Opening);

    tokio::time::advance(Duration::from_secs(5)).await;
    rig.send("STOP").await.unwrap();

    assert_eq!(rig.publisher.last("state").as_deref(), Some("stopped"));
    assert_eq!(rig.publisher.last("position").as_deref(), Some("50"));
    assert_eq!(rig.stored().current_pos, Some(50));
    assert_eq!(rig.sink.commands(), vec![SomfyCommand::Up, SomfyCommand::My]);

    let snap = rig.handler.snapshot(ADDR).await.unwrap();
    assert!(!snap.timer_armed);
    assert_eq!(snap.direction, Direction::Idle);
}

#[tokio::test(start_paused = true)]
async fn full_run_publishes_end_position_when_timer_fires() {
    let rig = rig(shutter(Some(10.0), Some(12.0), Some(100)));

    rig.send("CLOSE").await.unwrap();
    assert_eq!(rig.publisher.last("state").as_deref(), Some("closing"));
    assert!(rig.publisher.payloads("position").is_empty());

    tokio::time::sleep(Duration::from_secs(13)).await;

    assert_eq!(rig.publisher.payloads("state"), vec!["closing", "closed"]);
    assert_eq!(rig.publisher.payloads("position"), vec!["0"]);
    assert_eq!(rig.stored().current_pos, Some(0));
    assert!(!rig.handler.snapshot(ADDR).await.unwrap().timer_armed);
}

#[tokio::test(start_paused = true)]
async fn binary_shutter_opens_immediately() {
    let rig = rig(shutter(None, None, Some(0)));

    rig.send("OPEN").await.unwrap();

    assert_eq!(rig.publisher.payloads("state"), vec!["open"]);
    assert_eq!(rig.publisher.payloads("position"), vec!["100"]);
    let snap = rig.handler.snapshot(ADDR).await.unwrap();
    assert!(!snap.timer_armed);
    assert_eq!(snap.record.current_pos, Some(100));
}

#[tokio::test(start_paused = true)]
async fn unchanged_position_is_not_republished() {
    let rig = rig(shutter(None, None, Some(0)));

    rig.send("CLOSE").await.unwrap();

    assert_eq!(rig.publisher.payloads("state"), vec!["closed"]);
    assert!(rig.publisher.payloads("position").is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_end_of_run() {
    let rig = rig(shutter(Some(10.0), Some(10.0), Some(0)));

    rig.send("OPEN").await.unwrap();
    tokio::time::advance(Duration::from_secs(3)).await;
    rig.send("STOP").await.unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(rig.publisher.payloads("state"), vec!["opening", "stopped"]);
    assert_eq!(rig.publisher.payloads("position"), vec!["30"]);
}

#[tokio::test(start_paused = true)]
async fn new_run_replaces_previous_timer() {
    let rig = rig(shutter(Some(10.0), Some(10.0), Some(0)));

    rig.send("OPEN").await.unwrap();
    tokio::time::advance(Duration::from_secs(4)).await;
    rig.send("CLOSE").await.unwrap();
    tokio::time::sleep(Duration::from_secs(8)).await;

    // the OPEN timer would have fired at t=10
    assert_eq!(rig.publisher.payloads("state"), vec!["opening", "closing"]);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(rig.publisher.payloads("state"), vec!["opening", "closing", "closed"]);
}

#[tokio::test(start_paused = true)]
async fn stop_without_motion_keeps_position() {
    let rig = rig(shutter(Some(10.0), Some(10.0), None));

    rig.send("STOP").await.unwrap();

    assert_eq!(rig.publisher.last("state").as_deref(), Some("stopped"));
    assert_eq!(rig.publisher.last("position").as_deref(), Some("50"));
}

#[tokio::test(start_paused = true)]
async fn rolling_code_advances_once_per_frame() {
    let mut rec = shutter(None, None, Some(0));
    rec.rolling_code = 0xFFFD;
    rec.enc_key = 0xE;
    let rig = rig(rec);

    for _ in 0..5 {
        rig.send("STOP").await.unwrap();
    }

    let stored = rig.stored();
    // 0xFFFD + 5 and 0xE + 5, both wrapped
    assert_eq!(stored.rolling_code, 0x0002);
    assert_eq!(stored.enc_key, 0x3);

    let codes: Vec<u16> = rig
        .sink
        .frames
        .lock()
        .unwrap()
        .iter()
        .map(|l| cul_proto::frame::parse(l).unwrap().rolling_code)
        .collect();
    assert_eq!(codes, vec![0xFFFD, 0xFFFE, 0xFFFF, 0x0000, 0x0001]);
}

#[tokio::test(start_paused = true)]
async fn calibration_measures_both_directions() {
    let rig = rig(shutter(None, None, Some(0)));
    let rc0 = rig.stored().rolling_code;

    rig.send("CALIBRATE").await.unwrap();
    assert_eq!(rig.publisher.last("state").as_deref(), Some("calibrating"));
    assert!(rig.handler.snapshot(ADDR).await.unwrap().calibrating);

    tokio::time::advance(Duration::from_secs(20)).await;
    rig.send("STOP").await.unwrap();
    assert_eq!(rig.stored().down_time, Some(20.0));

    // the upward clock starts once the settle delay is over
    tokio::time::sleep(SETTLE + Duration::from_secs(25)).await;
    rig.send("STOP").await.unwrap();

    let snap = rig.handler.snapshot(ADDR).await.unwrap();
    assert!(!snap.calibrating);
    assert_eq!(snap.record.down_time, Some(20.0));
    assert_eq!(snap.record.up_time, Some(25.0));
    assert_eq!(rig.stored(), snap.record);

    assert_eq!(
        rig.sink.commands(),
        vec![SomfyCommand::Down, SomfyCommand::My, SomfyCommand::Up, SomfyCommand::My]
    );
    assert_eq!(snap.record.rolling_code, rc0 + 4);
    assert_eq!(rig.publisher.last("state").as_deref(), Some("open"));
    assert_eq!(rig.publisher.last("position").as_deref(), Some("100"));
}

#[tokio::test(start_paused = true)]
async fn calibrated_times_drive_the_simulation() {
    let rig = rig(shutter(None, None, Some(100)));

    rig.send("CALIBRATE").await.unwrap();
    tokio::time::advance(Duration::from_secs(8)).await;
    rig.send("STOP").await.unwrap();
    tokio::time::sleep(SETTLE + Duration::from_secs(10)).await;
    rig.send("STOP").await.unwrap();
    rig.publisher.clear();

    rig.send("CLOSE").await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    rig.send("STOP").await.unwrap();

    assert_eq!(rig.publisher.payloads("state"), vec!["closing", "stopped"]);
    assert_eq!(rig.publisher.last("position").as_deref(), Some("75"));
}

#[tokio::test(start_paused = true)]
async fn settle_delay_does_not_hold_up_the_caller() {
    let rig = rig(shutter(None, None, Some(0)));

    rig.send("CALIBRATE").await.unwrap();
    tokio::time::advance(Duration::from_secs(20)).await;
    let before = tokio::time::Instant::now();
    rig.send("STOP").await.unwrap();
    assert_eq!(tokio::time::Instant::now(), before);
    assert_eq!(rig.sink.commands(), vec![SomfyCommand::Down, SomfyCommand::My]);

    // STOP has no meaning until the shutter is on its way up
    rig.send("STOP").await.unwrap();
    assert_eq!(rig.sink.commands(), vec![SomfyCommand::Down, SomfyCommand::My]);

    tokio::time::sleep(SETTLE + Duration::from_millis(10)).await;
    assert_eq!(
        rig.sink.commands(),
        vec![SomfyCommand::Down, SomfyCommand::My, SomfyCommand::Up]
    );
    assert!(rig.handler.snapshot(ADDR).await.unwrap().calibrating);
}

#[tokio::test(start_paused = true)]
async fn calibrate_during_settle_cancels_the_up_run() {
    let rig = rig(shutter(None, None, Some(0)));

    rig.send("CALIBRATE").await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    rig.send("STOP").await.unwrap();
    rig.send("CALIBRATE").await.unwrap();
    tokio::time::sleep(SETTLE * 2).await;

    assert_eq!(rig.sink.commands(), vec![SomfyCommand::Down, SomfyCommand::My]);
    assert_eq!(rig.publisher.last("state").as_deref(), Some("stopped"));
    let snap = rig.handler.snapshot(ADDR).await.unwrap();
    assert!(!snap.calibrating);
    assert!(!snap.timer_armed);
}

#[tokio::test(start_paused = true)]
async fn failed_up_run_raises_the_halt_signal() {
    let rig = rig(shutter(None, None, Some(0)));
    let halt = rig.handler.halt_signal();

    rig.send("CALIBRATE").await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    rig.send("STOP").await.unwrap();
    rig.sink.fail.store(true, Ordering::SeqCst);
    tokio::time::sleep(SETTLE + Duration::from_millis(10)).await;

    assert!(*halt.borrow());
    assert!(rig.handler.is_halted());
    rig.send("CALIBRATE").await.unwrap();
    let err = rig.send("STOP").await.unwrap_err();
    assert!(matches!(err, SomfyError::Halted));
}

#[tokio::test(start_paused = true)]
async fn second_calibrate_interrupts() {
    let rig = rig(shutter(None, None, Some(0)));

    rig.send("CALIBRATE").await.unwrap();
    rig.send("CALIBRATE").await.unwrap();

    assert_eq!(rig.publisher.payloads("state"), vec!["calibrating", "stopped"]);
    assert_eq!(rig.sink.commands(), vec![SomfyCommand::Down]);
    let snap = rig.handler.snapshot(ADDR).await.unwrap();
    assert!(!snap.calibrating);
    assert_eq!(snap.record.up_time, None);
    assert_eq!(snap.record.down_time, None);
}

#[tokio::test(start_paused = true)]
async fn motion_commands_are_ignored_while_calibrating() {
    let rig = rig(shutter(None, None, Some(0)));

    rig.send("CALIBRATE").await.unwrap();
    rig.send("OPEN").await.unwrap();
    rig.send("PROG").await.unwrap();

    assert_eq!(rig.sink.commands(), vec![SomfyCommand::Down]);
    assert!(rig.handler.snapshot(ADDR).await.unwrap().calibrating);
}

#[tokio::test(start_paused = true)]
async fn prog_sends_frame_without_state_change() {
    let rig = rig(shutter(None, None, Some(40)));

    rig.send("PROG").await.unwrap();

    assert_eq!(rig.sink.commands(), vec![SomfyCommand::Prog]);
    assert!(rig.publisher.messages.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unknown_address_is_dropped() {
    let rig = rig(shutter(None, None, Some(0)));
    let before = std::fs::read_to_string(rig.record_path()).unwrap();

    let logs = LogCapture::default();
    let _guard = logs.install();

    rig.handler.on_message(&set_topic("FFFFFF"), b"OPEN").await.unwrap();

    assert_eq!(logs.lines_containing("FFFFFF").len(), 1);
    assert_eq!(rig.sink.count(), 0);
    assert!(rig.publisher.messages.lock().unwrap().is_empty());
    assert_eq!(std::fs::read_to_string(rig.record_path()).unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn out_of_scope_messages_are_ignored() {
    let rig = rig(shutter(None, None, Some(0)));

    let cases: [(&str, &[u8]); 7] = [
        ("other/cover/somfy/A1B2C3/set", b"OPEN"),
        ("homeassistant/switch/somfy/A1B2C3/set", b"OPEN"),
        ("homeassistant/cover/intertechno/A1B2C3/set", b"OPEN"),
        ("homeassistant/cover/somfy/A1B2C3/state", b"OPEN"),
        ("homeassistant/cover/somfy/A1B2C3/config", b"{}"),
        ("homeassistant/cover/somfy/A1B2C3/set", b"HALFWAY"),
        ("garbage", b"OPEN"),
    ];
    for (topic, payload) in cases {
        rig.handler.on_message(topic, payload).await.unwrap();
    }

    assert_eq!(rig.sink.count(), 0);
    assert!(rig.publisher.messages.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_write_halts_without_advancing() {
    let rig = rig(shutter(Some(10.0), Some(10.0), Some(0)));
    let rc0 = rig.stored().rolling_code;
    rig.sink.fail.store(true, Ordering::SeqCst);

    let err = rig.send("OPEN").await.unwrap_err();
    assert!(matches!(err, SomfyError::Transport(_)));
    assert!(rig.handler.is_halted());
    assert_eq!(rig.stored().rolling_code, rc0);
    assert!(rig.publisher.messages.lock().unwrap().is_empty());

    rig.sink.fail.store(false, Ordering::SeqCst);
    let err = rig.send("STOP").await.unwrap_err();
    assert!(matches!(err, SomfyError::Halted));
    assert_eq!(rig.sink.count(), 0);
    assert_eq!(rig.stored().rolling_code, rc0);
}

#[tokio::test(start_paused = true)]
async fn announce_publishes_discovery_and_state() {
    let rig = rig(shutter(None, None, None));

    rig.handler.announce().await;

    let config = rig.publisher.last("config").unwrap();
    let v: serde_json::Value = serde_json::from_str(&config).unwrap();
    assert_eq!(v["unique_id"], "somfy_A1B2C3");
    assert_eq!(v["name"], "Living room");
    assert_eq!(rig.publisher.last("state").as_deref(), Some("stopped"));
    assert_eq!(rig.publisher.last("position").as_deref(), Some("50"));
    assert_eq!(rig.stored().current_pos, Some(50));
    assert!(rig.publisher.messages.lock().unwrap().iter().all(|(_, _, retain)| *retain));
}

#[tokio::test(start_paused = true)]
async fn announce_republishes_known_position() {
    let rig = rig(shutter(None, None, Some(100)));

    rig.handler.announce().await;

    assert_eq!(rig.publisher.payloads("state"), vec!["open"]);
    assert_eq!(rig.publisher.payloads("position"), vec!["100"]);
}

#[tokio::test(start_paused = true)]
async fn announce_during_a_run_keeps_the_moving_state() {
    let rig = rig(shutter(Some(10.0), Some(10.0), Some(0)));

    rig.send("OPEN").await.unwrap();
    tokio::time::advance(Duration::from_secs(3)).await;
    rig.publisher.clear();
    rig.handler.announce().await;

    assert_eq!(rig.publisher.payloads("state"), vec!["opening"]);
    assert_eq!(rig.publisher.payloads("position"), vec!["0"]);
    assert!(rig.handler.snapshot(ADDR).await.unwrap().timer_armed);

    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(rig.publisher.payloads("state"), vec!["opening", "open"]);
    assert_eq!(rig.stored().current_pos, Some(100));
}

#[tokio::test(start_paused = true)]
async fn announce_during_calibration_keeps_calibrating() {
    let rig = rig(shutter(None, None, Some(0)));

    rig.send("CALIBRATE").await.unwrap();
    rig.publisher.clear();
    rig.handler.announce().await;

    assert_eq!(rig.publisher.payloads("state"), vec!["calibrating"]);
    assert!(rig.handler.snapshot(ADDR).await.unwrap().calibrating);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_timers() {
    let rig = rig(shutter(Some(10.0), Some(10.0), Some(0)));

    rig.send("OPEN").await.unwrap();
    rig.handler.shutdown().await;
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert_eq!(rig.publisher.payloads("state"), vec!["opening"]);
    assert!(!rig.handler.snapshot(ADDR).await.unwrap().timer_armed);
}
