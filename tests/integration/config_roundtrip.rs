//! Config files on disk drive the assembled pipeline.

use crate::helpers::{MockGenerator, MockPlayer, start_rig, wait_until};
use companion::CompanionConfig;
use companion::config::OverflowPolicy;
use std::time::Duration;

#[test]
fn test_partial_toml_fills_defaults() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[channels]
speech_capacity = 4
overflow_policy = "reject_newest"

[workers]
poll_interval_ms = 25

[animation]
resting = "breathing"
"#,
    )
    .unwrap();

    let config = CompanionConfig::from_file(&path).unwrap();
    assert_eq!(config.channels.speech_capacity, 4);
    assert_eq!(config.channels.overflow_policy, OverflowPolicy::RejectNewest);
    assert_eq!(config.channels.reply_capacity, 8, "missing fields use defaults");
    assert_eq!(config.animation.resting, "breathing");
    assert!(config.speech.enabled);
}

#[test]
fn test_saved_config_drives_pipeline() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("nested").join("config.toml");

    let mut config = CompanionConfig::default();
    config.workers.poll_interval_ms = 20;
    config.distributor.tail_delay_ms = 0;
    config.animation.resting = "breathing".to_owned();
    config.speech.enabled = false;
    config.save_to_file(&path).unwrap();

    let loaded = CompanionConfig::from_file(&path).unwrap();
    let rig = start_rig(
        &loaded,
        MockGenerator::default(),
        MockPlayer::default(),
        Duration::from_millis(5),
    );
    assert!(!rig.companion.voice_enabled(), "voice starts disabled");

    rig.companion.inject_text("hi");
    assert!(wait_until(Duration::from_secs(5), || {
        rig.renderer.animations() == vec!["talking", "breathing"]
    }));
    assert!(rig.player.played().is_empty());
}

#[test]
fn test_invalid_watermarks_are_rejected() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[channels]\nhigh_watermark = 0.3\nlow_watermark = 0.6\n").unwrap();
    assert!(CompanionConfig::from_file(&path).is_err());
}
