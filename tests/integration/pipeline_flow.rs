//! End-to-end flow through every stage with mock collaborators.

use crate::helpers::{MockGenerator, MockPlayer, fast_config, start_rig, wait_until};
use companion::pipeline::coordinator::WorkerState;
use companion::pipeline::messages::{META_ANIMATION, Transcription};
use std::time::Duration;

#[test]
fn test_typed_input_is_rendered_spoken_and_animated() {
    let rig = start_rig(
        &fast_config(),
        MockGenerator::default(),
        MockPlayer::default(),
        Duration::from_millis(10),
    );
    assert!(rig.companion.inject_text("good morning"));

    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.player.played() == vec!["Reply to good morning."]
        }),
        "reply should be spoken once"
    );
    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.renderer.animations() == vec!["talking", "idle"]
        }),
        "avatar should talk and then rest, got {:?}",
        rig.renderer.animations()
    );
    assert_eq!(rig.renderer.texts(), vec!["Reply to good morning."]);
    assert_eq!(rig.generator.texts(), vec!["good morning"]);
    assert!(
        wait_until(Duration::from_secs(2), || rig.synth.live_files() == 0),
        "played clips must be deleted"
    );
    assert!(!rig.companion.is_speaking());
}

#[test]
fn test_sentences_play_in_order() {
    let rig = start_rig(
        &fast_config(),
        MockGenerator::default(),
        MockPlayer::default(),
        Duration::from_millis(5),
    );
    rig.companion.inject_text("one");
    assert!(wait_until(Duration::from_secs(5), || rig.player.played().len() == 1));
    rig.companion.inject_text("two");
    assert!(wait_until(Duration::from_secs(5), || rig.player.played().len() == 2));
    assert_eq!(rig.player.played(), vec!["Reply to one.", "Reply to two."]);
}

#[test]
fn test_voice_disabled_renders_without_speaking() {
    let rig = start_rig(
        &fast_config(),
        MockGenerator::default(),
        MockPlayer::default(),
        Duration::from_millis(5),
    );
    rig.companion.set_voice_enabled(false);
    assert!(!rig.companion.voice_enabled());
    rig.companion.inject_text("quietly");

    assert!(wait_until(Duration::from_secs(5), || !rig.renderer.texts().is_empty()));
    std::thread::sleep(Duration::from_millis(100));
    assert!(rig.player.played().is_empty());
    assert_eq!(rig.synth.live_files(), 0);
}

#[test]
fn test_forced_animation_and_confidence_floor() {
    let mut config = fast_config();
    config.workers.min_confidence = 0.6;
    let rig = start_rig(
        &config,
        MockGenerator::default(),
        MockPlayer::default(),
        Duration::from_millis(5),
    );

    rig.companion.submit_transcription(Transcription::spoken("mumbled", 0.3));
    rig.companion.submit_transcription(
        Transcription::spoken("dance for me", 0.9).with_metadata(META_ANIMATION, "dance"),
    );

    assert!(wait_until(Duration::from_secs(5), || {
        rig.renderer.animations().first().map(String::as_str) == Some("dance")
    }));
    assert_eq!(rig.generator.texts(), vec!["dance for me"]);
}

#[test]
fn test_all_workers_running_and_healthy() {
    let rig = start_rig(
        &fast_config(),
        MockGenerator::default(),
        MockPlayer::default(),
        Duration::from_millis(5),
    );
    assert!(wait_until(Duration::from_secs(2), || rig.companion.health_check().healthy));
    let report = rig.companion.health_check();
    assert_eq!(report.workers.len(), 6);
    assert!(report.workers.iter().all(|w| w.state == WorkerState::Running));
    assert_eq!(report.channels.len(), 5);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["healthy"], serde_json::json!(true));
}
