use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hark::daemon::{PreferenceOverrides, build_synthesizer};
use hark::history::{self, ExchangeRepo};
use hark::voice::{
    AudioSink, CpalRecorder, CpalSink, PLAYBACK_SAMPLE_RATE, Recorder, Recording, SpeechOptions,
    Synthesizer, WakeWordMatcher,
};
use hark::{Config, Daemon};

/// hark - hands-free voice assistant
#[derive(Parser)]
#[command(name = "hark", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Act on every utterance without waiting for the wake word
    #[arg(long, env = "HARK_NO_WAKE_WORD")]
    no_wake_word: bool,

    /// Wake phrase (e.g. "hey mccarthy")
    #[arg(long)]
    wake_word: Option<String>,

    /// Recognition and speech locale (e.g. "en-AU")
    #[arg(long)]
    locale: Option<String>,

    /// Speaking rate multiplier (0.25 to 4.0)
    #[arg(long)]
    rate: Option<f32>,

    /// Silence that ends an utterance, in milliseconds
    #[arg(long)]
    silence_ms: Option<u64>,

    /// Print replies instead of speaking them
    #[arg(short, long)]
    quiet: bool,

    /// Print session events to stdout as JSON lines
    #[arg(long)]
    events_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Check text against the wake word
    Match {
        /// Transcript to check
        text: String,
    },
    /// Show recent exchanges
    History {
        /// Number of exchanges to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,hark=info",
        1 => "info,hark=debug",
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
    let mut config = Config::load()?;
    if let Some(wake_word) = &cli.wake_word {
        config.voice.wake_word.clone_from(wake_word);
    }
    if let Some(ms) = cli.silence_ms {
        config.endpointing.silence_duration = Duration::from_millis(ms);
    }

    let overrides = PreferenceOverrides {
        wake_word_enabled: cli.no_wake_word.then_some(false),
        playback_rate: cli.rate,
        locale: cli.locale.clone(),
        speech_output: cli.quiet.then_some(false),
    };

    // Handle subcommands
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text } => test_tts(&config, &overrides, &text).await,
            Command::Match { text } => match_wake_word(&config, &text),
            Command::History { limit } => show_history(&config, limit),
        };
    }

    overrides.apply(&mut config.voice.preferences);
    config.validate()?;

    tracing::info!(
        wake_word = %config.voice.wake_word,
        wake_word_enabled = config.voice.preferences.wake_word_enabled,
        locale = %config.voice.preferences.locale,
        "starting hark"
    );
    tracing::debug!(?config, "loaded configuration");

    Daemon::new(config, overrides, cli.events_json).run().await?;

    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let recorder = CpalRecorder::new()?;
    let mut recording = recorder.start().await?;

    println!("Sample rate: {} Hz", recording.sample_rate());
    println!("---");

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    ticker.tick().await;
    for i in 0..duration * 4 {
        ticker.tick().await;
        let level = recording.level_db()?;

        // Visual meter: -80 dBFS empty, 0 dBFS full
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = ((level + 80.0).clamp(0.0, 80.0) * 50.0 / 80.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        #[allow(clippy::cast_precision_loss)]
        let secs = (i + 1) as f32 / 4.0;
        println!("[{secs:5.2}s] {level:7.1} dBFS | [{meter}]");
    }

    let samples = recording.stop()?;

    println!("\n---");
    println!("Captured {} samples.", samples.len());
    println!("If the meter moved when you spoke, your mic is working!");
    println!("If it stayed near the bottom, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sink = CpalSink::new()?;

    let frequency = 440.0_f32;
    let num_samples = PLAYBACK_SAMPLE_RATE as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Playing {num_samples} samples at {PLAYBACK_SAMPLE_RATE} Hz...");
    sink.play_samples(samples, CancellationToken::new()).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Test TTS output through the configured provider
async fn test_tts(config: &Config, overrides: &PreferenceOverrides, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let mut prefs = config.voice.preferences.clone();
    overrides.apply(&mut prefs);

    let synthesizer = build_synthesizer(config)?;
    let options = SpeechOptions {
        rate: prefs.playback_rate,
        locale: prefs.locale,
    };

    println!("Synthesizing speech...");
    let audio = synthesizer.synthesize(text, &options).await?;
    println!("Got {} bytes of audio data", audio.len());

    println!("Playing audio...");
    CpalSink::new()?.play(audio, CancellationToken::new()).await?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

/// Run the wake-word matcher on `text`
fn match_wake_word(config: &Config, text: &str) -> anyhow::Result<()> {
    let matcher = WakeWordMatcher::new(&config.voice.wake_word)
        .with_rules(config.voice.phonetic_rules.iter().cloned());
    let result = matcher.matches(text);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Print recent exchanges, newest first
fn show_history(config: &Config, limit: usize) -> anyhow::Result<()> {
    let pool = history::init(config.history_path())?;
    let exchanges = ExchangeRepo::new(pool).recent(limit)?;

    if exchanges.is_empty() {
        println!("No exchanges yet.");
        return Ok(());
    }

    for exchange in exchanges {
        println!(
            "[{}] Q: {}\n{:>width$} A: {}\n",
            exchange.created_at.format("%Y-%m-%d %H:%M"),
            exchange.question,
            "",
            exchange.answer,
            width = 18,
        );
    }

    Ok(())
}
