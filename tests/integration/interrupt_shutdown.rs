//! Interrupt and shutdown behaviour of the assembled pipeline.

use crate::helpers::{MockGenerator, MockPlayer, fast_config, start_rig, wait_until};
use companion::pipeline::coordinator::WorkerState;
use std::time::{Duration, Instant};

#[test]
fn test_interrupt_stops_playback_and_cleans_up() {
    let rig = start_rig(
        &fast_config(),
        MockGenerator::default(),
        MockPlayer::default(),
        Duration::from_secs(3),
    );
    rig.companion.inject_text("tell me a long story");
    assert!(
        wait_until(Duration::from_secs(5), || rig.companion.is_speaking()),
        "playback should start"
    );

    rig.companion.trigger_interrupt();
    assert!(!rig.companion.is_speaking());
    let report = rig.companion.health_check();
    assert!(
        report.channels.iter().all(|c| c.size == 0),
        "queues must be empty after interrupt: {:?}",
        report.channels
    );
    assert!(
        wait_until(Duration::from_millis(500), || rig.synth.live_files() == 0),
        "interrupted clip must be deleted"
    );
    assert!(rig.player.played().is_empty());

    // The avatar goes back to rest and nothing from the old turn follows.
    assert!(wait_until(Duration::from_secs(2), || {
        rig.renderer.animations().last().map(String::as_str) == Some("idle")
    }));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(rig.renderer.animations().last().map(String::as_str), Some("idle"));
    let report = rig.companion.health_check();
    assert!(
        report.channels.iter().all(|c| c.size == 0),
        "nothing stale may be queued after interrupt: {:?}",
        report.channels
    );
}

#[test]
fn test_reply_in_flight_during_interrupt_is_discarded() {
    let rig = start_rig(
        &fast_config(),
        MockGenerator::with_delay(Duration::from_millis(200)),
        MockPlayer::default(),
        Duration::from_millis(5),
    );
    rig.companion.inject_text("slow question");
    assert!(wait_until(Duration::from_secs(2), || !rig.generator.texts().is_empty()));
    rig.companion.trigger_interrupt();

    std::thread::sleep(Duration::from_millis(400));
    assert!(rig.renderer.texts().is_empty(), "stale reply must not render");
    assert!(rig.player.played().is_empty());

    rig.companion.inject_text("fresh question");
    assert!(wait_until(Duration::from_secs(5), || {
        rig.renderer.texts() == vec!["Reply to fresh question."]
    }));
}

#[test]
fn test_shutdown_stops_every_worker() {
    let mut rig = start_rig(
        &fast_config(),
        MockGenerator::default(),
        MockPlayer::default(),
        Duration::from_millis(5),
    );
    rig.companion.inject_text("hello");
    assert!(wait_until(Duration::from_secs(5), || !rig.player.played().is_empty()));

    let report = rig.companion.request_shutdown(Duration::from_secs(2), false);
    assert!(report.all_stopped(), "abandoned: {:?}", report.abandoned);
    assert_eq!(report.stopped.len(), 6);
    assert!(!report.forced);
    assert!(
        rig.companion
            .worker_records()
            .iter()
            .all(|r| r.state == WorkerState::Stopped)
    );
    assert!(!rig.companion.inject_text("after shutdown"));
}

#[test]
fn test_stubborn_player_is_abandoned_within_budget() {
    let config = fast_config();
    let mut rig = start_rig(
        &config,
        MockGenerator::default(),
        MockPlayer::stubborn(),
        Duration::from_secs(10),
    );
    rig.companion.inject_text("never ending");
    assert!(wait_until(Duration::from_secs(5), || rig.companion.is_speaking()));

    let timeout = Duration::from_millis(300);
    let started = Instant::now();
    let report = rig.companion.request_shutdown(timeout, false);
    let elapsed = started.elapsed();

    assert!(report.forced);
    assert_eq!(report.abandoned, vec!["speech-playback".to_owned()]);
    assert!(report.stopped.contains(&"request".to_owned()));
    assert!(
        elapsed < timeout + config.shutdown.forced_timeout() + Duration::from_millis(500),
        "shutdown took {elapsed:?}"
    );
    let records = rig.companion.worker_records();
    let playback = records
        .iter()
        .find(|r| r.name == "speech-playback")
        .unwrap();
    assert_eq!(playback.state, WorkerState::Running);
}
