use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use beacon_live::capture::{AudioSource, CpalAudioSource, host_camera, rms_level, samples_to_wav};
use beacon_live::realtime::{HttpSessionRelay, Role, WebSocketConnector};
use beacon_live::{Config, ConnectionEvent, ConversationState, SessionParts, Voice, VoiceSession};

/// Beacon Live - realtime voice conversations from the terminal
#[derive(Parser)]
#[command(name = "beacon-live", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a live voice session on the default microphone
    Run {
        /// Voice to start with (see `voices`)
        #[arg(long)]
        voice: Option<String>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Write the captured audio to a WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List available voices
    Voices,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,beacon_live=info",
        1 => "info,beacon_live=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run { voice } => run_session(voice).await,
        Command::TestMic { duration, output } => test_mic(duration, output).await,
        Command::Voices => {
            for voice in Voice::ALL {
                println!("{voice}");
            }
            Ok(())
        }
    }
}

async fn run_session(voice: Option<String>) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(name) = voice {
        config.session.voice = name.parse()?;
    }
    let initial_voice = config.session.voice;

    let state = ConversationState::new();
    state.set_selected_voice(initial_voice);

    // The terminal has no camera feed; keep the publisher so camera opens time out
    let (_camera_feed, video) = host_camera();
    let parts = SessionParts {
        audio: Arc::new(CpalAudioSource::new()),
        video: Arc::new(video),
        relay: Arc::new(HttpSessionRelay::new(config.session.relay_url.clone())),
        connector: Arc::new(WebSocketConnector::new()),
        lifecycle: None,
        playback: None,
    };
    let session = VoiceSession::new(config, state, parts);
    let mut events = session.events();

    session.start().await?;
    println!("Listening as {initial_voice}. Type to send text; /voice <name>, /mute, /quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&session, line.trim()).await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(ConnectionEvent::Transcript { role, text }) => {
                    println!("{}: {text}", speaker(role));
                }
                Ok(ConnectionEvent::Notice(message)) => eprintln!("notice: {message}"),
                Ok(ConnectionEvent::Fatal(message)) => {
                    eprintln!("session ended: {message}");
                    break;
                }
                Ok(ConnectionEvent::Closed) => {
                    eprintln!("connection closed, reconnecting...");
                    if let Err(e) = session.reconnect().await {
                        eprintln!("reconnect failed: {e}");
                        break;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }

    session.stop().await;
    Ok(())
}

/// Returns false when the user asked to quit
async fn handle_line(session: &VoiceSession, line: &str) -> bool {
    let (command, rest) = line
        .split_once(' ')
        .map_or((line, ""), |(c, r)| (c, r.trim()));

    match command {
        "" => {}
        "/quit" => return false,
        "/mute" => {
            let muted = !session.state().snapshot().muted;
            session.set_muted(muted);
            println!("{}", if muted { "muted" } else { "unmuted" });
        }
        "/voice" => match rest.parse::<Voice>() {
            Ok(voice) => match session.select_voice(voice).await {
                Ok(outcome) => println!("voice: {outcome:?}"),
                Err(e) => eprintln!("voice swap failed: {e}"),
            },
            Err(e) => eprintln!("{e}"),
        },
        _ => {
            if let Err(e) = session.send_text(line).await {
                eprintln!("send failed: {e}");
            }
        }
    }
    true
}

const fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

async fn test_mic(duration: u64, output: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load()?;
    let constraints = config.audio.constraints();

    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let captured = Arc::new(Mutex::new(Vec::<f32>::new()));
    let sink = Arc::clone(&captured);
    let source = CpalAudioSource::new();
    source
        .open(
            &constraints,
            Box::new(move |samples: &[f32]| {
                if let Ok(mut buf) = sink.lock() {
                    buf.extend_from_slice(samples);
                }
            }),
        )
        .await?;

    println!("Sample rate: {} Hz", constraints.sample_rate);
    println!("---");

    let mut seen = 0;
    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let (level, peak) = captured
            .lock()
            .map(|buf| {
                let window = &buf[seen.min(buf.len())..];
                seen = buf.len();
                let peak = window.iter().map(|s| s.abs()).fold(0.0_f32, f32::max);
                (rms_level(window), peak)
            })
            .unwrap_or_default();

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (level * 50.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] Level: {level:.3} | Peak: {peak:.4} | [{meter}]",
            i + 1
        );
    }

    source.close();

    if let Some(path) = output {
        let samples = captured.lock().map(|buf| buf.clone()).unwrap_or_default();
        let wav = samples_to_wav(&samples, constraints.sample_rate)?;
        std::fs::write(&path, wav)?;
        println!("\nWrote {} samples to {}", samples.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If the level stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}
