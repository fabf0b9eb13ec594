//! adaplay: a small interactive player over the adagio pipeline runtime.
//!
//! The player is a thin collaborator: it turns keystrokes into manager
//! commands and renders the manager's observable state. All pipeline
//! logic lives in the library.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use console::{Key, Term};

use adagio::components::{PacedSink, PcmGraphBuilder};
use adagio::manager::{
    LoopMode, PlaybackManager, PlaybackSignals, PlaybackStatus, Playlist, StatusSnapshot,
};

#[derive(Parser, Debug)]
#[command(name = "adaplay", about = "Play audio files through the adagio pipeline")]
struct Opts {
    /// Files to play, in order. Falls back to the config file's
    /// `default_uri` entries.
    files: Vec<PathBuf>,

    /// Shuffle the playlist.
    #[arg(long)]
    shuffle: bool,

    /// Loop mode: none, track, or playlist.
    #[arg(long = "loop", default_value = "none")]
    loop_mode: String,

    /// Initial volume, 0..=100 (rounded to steps of five).
    #[arg(long, default_value_t = 75)]
    volume: u32,

    /// Configuration file (overrides the environment lookup).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the rendered PCM to this file as well.
    #[arg(long)]
    output: Option<PathBuf>,
}

/// Parses the flat `key = value` config format. Later keys win; unknown
/// keys are kept for component-specific lookups.
fn parse_config(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

fn format_position(status: &StatusSnapshot) -> String {
    let mmss = |d: Duration| format!("{:02}:{:02}", d.as_secs() / 60, d.as_secs() % 60);
    match status.duration {
        Some(total) => format!("{} / {}", mmss(status.position), mmss(total)),
        None => mmss(status.position),
    }
}

fn status_line(status: &StatusSnapshot) -> String {
    let glyph = match status.status {
        PlaybackStatus::Playing => ">",
        PlaybackStatus::Paused => "||",
        PlaybackStatus::Stopped => ".",
    };

    let title = match (status.metadata.get("artist"), status.metadata.get("title")) {
        (Some(artist), Some(title)) => format!("{artist} - {title}"),
        (None, Some(title)) => title.clone(),
        _ => status
            .metadata
            .get("uri")
            .cloned()
            .unwrap_or_else(|| "(nothing)".into()),
    };

    let mute = if status.muted { " [muted]" } else { "" };
    format!(
        "{glyph} {title}  {}  vol {}%{mute}",
        format_position(status),
        status.volume
    )
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::new().filter("ADAGIO_LOG")).init();
    let opts = Opts::parse();

    let config = opts
        .config
        .clone()
        .or_else(adagio::config_path_from_env)
        .and_then(|path| std::fs::read_to_string(path).ok())
        .map(|text| parse_config(&text))
        .unwrap_or_default();

    let mut uris: Vec<String> = opts
        .files
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    if uris.is_empty() {
        if let Some(default_uri) = config.get("default_uri") {
            uris = default_uri
                .split(';')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    if uris.is_empty() {
        bail!("nothing to play: pass files or set default_uri in the config");
    }

    let loop_mode = match opts.loop_mode.as_str() {
        "none" => LoopMode::None,
        "track" => LoopMode::Track,
        "playlist" => LoopMode::Playlist,
        other => bail!("unknown loop mode {other:?}"),
    };

    let volume = config
        .get("volume")
        .and_then(|v| v.parse().ok())
        .unwrap_or(opts.volume)
        .min(100);

    let output = opts.output.clone();
    let builder = PcmGraphBuilder::new(move || {
        let inner: Box<dyn std::io::Write + Send> = match &output {
            Some(path) => match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(file) => Box::new(file),
                Err(err) => {
                    log::warn!("cannot open {}: {err}; discarding audio", path.display());
                    Box::new(std::io::sink())
                }
            },
            None => Box::new(std::io::sink()),
        };
        Box::new(PacedSink::new(inner))
    });

    let term = Term::stdout();
    let signal_term = term.clone();
    let signals = PlaybackSignals {
        metadata: Some(Box::new(move |metadata| {
            if let Some(uri) = metadata.get("uri") {
                let _ = writeln!(&signal_term, "now playing: {uri}");
            }
        })),
        ..Default::default()
    };

    let manager = Arc::new(
        PlaybackManager::new(
            Box::new(Playlist::from_uris(uris)),
            vec![Arc::new(builder)],
            signals,
        )
        .context("starting the playback manager")?,
    );

    manager.set_loop(loop_mode)?;
    if opts.shuffle {
        manager.set_shuffle(true)?;
    }

    // Volume moves in steps of five from the default of 75.
    let steps = (volume as i32 - 75) / 5;
    if steps != 0 {
        manager.volume(steps)?;
    }

    manager.play()?;

    // Without a terminal there is nothing to read keys from; just play
    // the list out.
    if !term.is_term() {
        futures::executor::block_on(manager.end_of_list());
        manager.shutdown();
        return Ok(());
    }

    let done = Arc::new(AtomicBool::new(false));

    // Status line renderer.
    let render_done = done.clone();
    let render_term = term.clone();
    let render_manager = manager.clone();
    let render_thread = std::thread::spawn(move || {
        while !render_done.load(Ordering::Relaxed) {
            let line = status_line(&render_manager.status());
            let _ = render_term.clear_line();
            let _ = write!(&render_term, "{line}\r");
            std::thread::sleep(Duration::from_millis(500));
        }
        let _ = render_term.clear_line();
    });

    eprintln!("keys: space/p pause, n next, b previous, +/- volume, m mute, s stop, q quit");

    loop {
        match term.read_key() {
            Ok(Key::Char('q')) | Ok(Key::Escape) => break,
            Ok(Key::Char(' ')) | Ok(Key::Char('p')) => manager.toggle_pause()?,
            Ok(Key::Char('n')) | Ok(Key::ArrowRight) => manager.next()?,
            Ok(Key::Char('b')) | Ok(Key::ArrowLeft) => manager.previous()?,
            Ok(Key::Char('+')) | Ok(Key::Char('=')) => manager.volume(1)?,
            Ok(Key::Char('-')) => manager.volume(-1)?,
            Ok(Key::Char('m')) => manager.mute()?,
            Ok(Key::Char('s')) => manager.stop()?,
            Ok(_) => {}
            Err(err) => {
                log::warn!("terminal input failed: {err}");
                break;
            }
        }
    }

    done.store(true, Ordering::Relaxed);
    let _ = render_thread.join();
    manager.shutdown();
    Ok(())
}
