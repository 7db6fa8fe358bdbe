//! Headless companion host.
//!
//! Reads lines from stdin and feeds them to the pipeline as typed input,
//! using local stand-in collaborators (echo replies, silent WAV speech,
//! stdout rendering). Lines starting with `/` are commands:
//!
//! - `/interrupt` abandon the current turn
//! - `/health` print a health report as JSON
//! - `/voice on|off` toggle speech output
//! - `/quit` shut down (so do Ctrl-C and EOF)
//!
//! Tracing output goes to stderr so stdout stays readable.

use companion::collaborators::local::{
    ConsoleRenderer, EchoReplyGenerator, StaticVision, TimedPlayer, WavSynthesizer,
};
use companion::{Collaborators, Companion, CompanionConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Say(&'a str),
    Interrupt,
    Health,
    Voice(bool),
    Quit,
    Unknown(&'a str),
    Empty,
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Say(line);
        };
        match command.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["interrupt"] => Self::Interrupt,
            ["health"] => Self::Health,
            ["voice", "on"] => Self::Voice(true),
            ["voice", "off"] => Self::Voice(false),
            ["quit"] | ["exit"] => Self::Quit,
            _ => Self::Unknown(line),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(CompanionConfig::default_config_path);
    let config = if config_path.exists() {
        CompanionConfig::from_file(&config_path)?
    } else {
        tracing::info!(path = %config_path.display(), "no config file; using defaults");
        CompanionConfig::default()
    };

    let audio_dir = std::env::temp_dir().join(format!("companion-audio-{}", std::process::id()));
    let collaborators = Collaborators {
        generator: Arc::new(EchoReplyGenerator {
            delay: Duration::from_millis(300),
        }),
        synthesizer: Arc::new(WavSynthesizer::new(&audio_dir)),
        player: Arc::new(TimedPlayer::default()),
        renderer: Arc::new(ConsoleRenderer),
        vision: Some(Arc::new(StaticVision("someone sitting at a desk".to_owned()))),
    };

    let mut companion = Companion::new(&config, collaborators)?;
    companion.start()?;
    tracing::info!("companion-host started");

    let shutdown = companion.signals().shutdown_token();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("ctrl-c received");
                break;
            }
            () = shutdown.cancelled() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        tracing::info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("failed to read stdin: {e}");
                        break;
                    }
                };
                match Command::parse(&line) {
                    Command::Say(text) => {
                        if !companion.inject_text(text) {
                            tracing::warn!("input refused");
                        }
                    }
                    Command::Interrupt => {
                        let cleared = companion.trigger_interrupt();
                        println!("(interrupted, {cleared} queued items dropped)");
                    }
                    Command::Health => {
                        println!("{}", serde_json::to_string_pretty(&companion.health_check())?);
                    }
                    Command::Voice(enabled) => companion.set_voice_enabled(enabled),
                    Command::Quit => break,
                    Command::Unknown(command) => println!("unknown command: {command}"),
                    Command::Empty => {}
                }
            }
        }
    }

    let timeout = config.shutdown.timeout();
    let report = tokio::task::spawn_blocking(move || companion.request_shutdown(timeout, false))
        .await
        .map_err(|e| anyhow::anyhow!("shutdown task failed: {e}"))?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Err(e) = std::fs::remove_dir_all(&audio_dir)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %audio_dir.display(), "failed to remove audio directory: {e}");
    }
    if report.all_stopped() {
        tracing::info!("companion-host shut down cleanly");
    } else {
        tracing::warn!(
            abandoned = ?report.abandoned,
            "companion-host exiting with workers still running"
        );
    }
    Ok(())
}
