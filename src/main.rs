use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use vocal_live::audio::{AudioBackend, PlaybackPipeline, encode_pcm16};
use vocal_live::{
    CaptureConstraints, Config, CpalBackend, EventLog, SessionState, SessionUpdate, TtsEngine,
    VoiceSession,
};

/// Vocal - Real-time voice conversations with an AI agent
#[derive(Parser)]
#[command(name = "vocal", version, about)]
struct Cli {
    /// Voice agent server URL
    #[arg(long, env = "VOCAL_SERVER_URL")]
    server: Option<String>,

    /// Static API key for the server
    #[arg(long, env = "VOCAL_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Voice identifier for speech synthesis
    #[arg(long)]
    voice: Option<String>,

    /// Speech synthesis engine (melo or chatterbox)
    #[arg(long)]
    engine: Option<TtsEngine>,

    /// Conversation language (e.g. "fr-FR")
    #[arg(long)]
    language: Option<String>,

    /// User identifier for long-term memory
    #[arg(long)]
    user: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a conversation (default)
    Talk {
        /// Start with the microphone open
        #[arg(long)]
        mic: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Show server health
    Health,
    /// List sessions known to the server
    Sessions,
    /// Delete a session on the server
    DeleteSession {
        /// Session identifier
        id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,vocal_live=info",
        1 => "info,vocal_live=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
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

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let command = cli.command.unwrap_or(Command::Talk { mic: false });

    // Device tests need no server configuration
    match command {
        Command::TestMic { duration } => return test_mic(duration).await,
        Command::TestSpeaker => return test_speaker().await,
        _ => {}
    }

    let mut config = Config::load()?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(api_key) = cli.api_key.filter(|k| !k.is_empty()) {
        config.api_key = Some(api_key);
    }
    if let Some(voice) = cli.voice {
        config.session.voice_id = voice;
    }
    if let Some(engine) = cli.engine {
        config.session.tts_engine = engine;
    }
    if let Some(language) = cli.language {
        config.session.language = language;
    }
    if let Some(user) = cli.user {
        config.session.user_id = user;
    }
    tracing::debug!(server = %config.server_url, voice = %config.session.voice_id, "loaded configuration");

    match command {
        Command::Talk { mic } => talk(config, mic).await,
        Command::Health => health(&config).await,
        Command::Sessions => sessions(&config).await,
        Command::DeleteSession { id } => delete_session(&config, &id).await,
        Command::TestMic { .. } | Command::TestSpeaker => Ok(()),
    }
}

/// Interactive conversation: typed lines go to the agent, log lines come back
#[allow(clippy::future_not_send)]
async fn talk(config: Config, mic: bool) -> anyhow::Result<()> {
    let log = EventLog::new(config.log_capacity);
    let mut entries = log.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match entries.recv().await {
                Ok(entry) => println!("{entry}"),
                Err(RecvError::Lagged(missed)) => println!("... {missed} log entries skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut session = VoiceSession::new(
        config.handshake_client()?,
        Box::new(CpalBackend::new()),
        log,
        config.session_options(),
    );

    println!("Connecting to {} ...", config.server_url);
    session.connect(config.session.clone()).await?;
    if mic {
        session.start_recording();
    }
    println!("Type a message and press enter. /help lists commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&mut session, line) {
                        break;
                    }
                }
                None => break,
            },
            alive = session.process_next() => {
                if !alive || session.state() == SessionState::Closed {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.disconnect().await;
    drop(session);
    // Let the printer drain what is already queued
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();
    Ok(())
}

/// Apply one REPL line; returns `false` to quit
fn handle_line(session: &mut VoiceSession, mut line: String) -> bool {
    if !line.trim_start().starts_with('/') {
        session.send_text(&mut line);
        return true;
    }

    let command = line.trim().trim_start_matches('/');
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(n, a)| (n, a.trim()));

    match name {
        "quit" | "exit" => return false,
        "mic" => {
            if session.is_recording() {
                session.stop_recording();
            } else {
                session.start_recording();
            }
        }
        "clear" => {
            session.clear_conversation();
        }
        "forget" => {
            session.clear_memory();
        }
        "ping" => {
            session.ping();
        }
        "voice" | "engine" | "personality" | "situation" => match session_update(name, arg) {
            Ok(update) => {
                session.update_session(update);
            }
            Err(e) => println!("{e}"),
        },
        "status" => {
            let id = session.session().map_or("-", |s| s.id.as_str());
            println!(
                "state={} session={id} recording={} playing={}",
                session.state(),
                session.is_recording(),
                session.is_playing()
            );
        }
        _ => {
            println!("Commands:");
            println!("  /mic                 toggle the microphone");
            println!("  /voice <id>          switch synthesis voice");
            println!("  /engine <name>       switch TTS engine (melo, chatterbox)");
            println!("  /personality <text>  replace the agent's personality");
            println!("  /situation <text>    replace the conversation context");
            println!("  /clear               forget the conversation");
            println!("  /forget              erase long-term memory");
            println!("  /ping                check the connection");
            println!("  /status              show session state");
            println!("  /quit                disconnect and exit");
        }
    }
    true
}

/// Build the update for a `/voice`, `/engine`, `/personality` or `/situation` line
fn session_update(name: &str, arg: &str) -> Result<SessionUpdate, String> {
    if arg.is_empty() {
        return Err(format!("usage: /{name} <value>"));
    }
    let mut update = SessionUpdate::default();
    match name {
        "voice" => update.voice_id = Some(arg.to_string()),
        "engine" => update.tts_engine = Some(arg.parse::<TtsEngine>()?),
        "personality" => update.personality = Some(arg.to_string()),
        "situation" => update.situation = Some(arg.to_string()),
        _ => return Err(format!("/{name} does not change the session")),
    }
    Ok(update)
}

async fn health(config: &Config) -> anyhow::Result<()> {
    let client = config.handshake_client()?;
    let health = client.health().await?;
    println!("Server:          {}", client.base_url());
    println!("Status:          {}", health.status);
    println!("Version:         {}", health.version);
    println!("Active sessions: {}", health.active_sessions);
    println!("Memory:          {}", if health.memory_enabled { "enabled" } else { "disabled" });
    Ok(())
}

async fn sessions(config: &Config) -> anyhow::Result<()> {
    let sessions = config.handshake_client()?.list_sessions().await?;
    if sessions.is_empty() {
        println!("No active sessions");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  voice={}  user={}",
            session.session_id, session.voice_id, session.user_id
        );
    }
    Ok(())
}

async fn delete_session(config: &Config, id: &str) -> anyhow::Result<()> {
    config.handshake_client()?.delete_session(id).await?;
    println!("Deleted session {id}");
    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let constraints = CaptureConstraints::default();
    let buffer = Arc::new(Mutex::new(Vec::<f32>::new()));
    let sink = Arc::clone(&buffer);

    let stream = CpalBackend::new().open_input(
        &constraints,
        Box::new(move |samples: &[f32]| {
            if let Ok(mut buffer) = sink.lock() {
                buffer.extend_from_slice(samples);
            }
        }),
    )?;

    println!("Sample rate: {} Hz", constraints.sample_rate);
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = buffer
            .lock()
            .map(|mut b| std::mem::take(&mut *b))
            .unwrap_or_default();
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
        let bytes = encode_pcm16(&samples).len();

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | {:6} bytes | [{}]",
            i + 1,
            energy,
            peak,
            bytes,
            meter
        );
    }

    drop(stream);

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Is the client allowed to use the microphone?");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output with a sine wave pushed through the playback pipeline
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let backend = CpalBackend::new();
    let mut playback = PlaybackPipeline::new(vocal_live::audio::PLAYBACK_SAMPLE_RATE);

    // 2 seconds of 440Hz sine at 24kHz, sent as 200ms PCM16 frames
    let sample_rate = 24_000_u32;
    let frequency = 440.0_f32;
    let total = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..total)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    for frame in samples.chunks(sample_rate as usize / 5) {
        playback.enqueue(&backend, encode_pcm16(frame))?;
    }
    println!("Queued {} frames at {} Hz...", playback.queue().queued_frames(), sample_rate);

    while !playback.queue().is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    playback.close();

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
