//! cuebox CLI: ambient sound board for tabletop sessions.
//!
//! Commands:
//!   cuebox run <catalog>                           Play a catalog, single-key control
//!   cuebox check <catalog>                         Validate a catalog and list its keys
//!   cuebox simulate <catalog> [secs] [seed] [key]  Headless dry run, prints every cue start
//!
//! `<catalog>` is a JSON catalog file or a directory laid out by theme.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use cuebox_core::backend::{BackendCall, RecordingBackend};
use cuebox_core::{Command, Director, Engine, Loaded, Phase, Priority, Snapshot};

/// Simulated clip lengths for `simulate`, in seconds.
const SIM_BACKGROUND_SECS: f64 = 180.0;
const SIM_CUE_SECS: f64 = 8.0;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        return;
    }

    let ok = match args[0].as_str() {
        "run" => cmd_run(&args[1..]),
        "check" => cmd_check(&args[1..]),
        "simulate" => cmd_simulate(&args[1..]),
        "help" | "-h" | "--help" => {
            print_usage();
            true
        }
        other => {
            eprintln!("unknown command: {}", other);
            print_usage();
            false
        }
    };
    if !ok {
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_run(args: &[String]) -> bool {
    let Some(loaded) = load_catalog(args, "usage: cuebox run <catalog>") else {
        return false;
    };
    let Loaded { catalog, config } = loaded;
    print_keys(&catalog);

    let engine = match Engine::new(catalog, config.apply_env()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("cannot start: {}", e);
            return false;
        }
    };
    engine.start();

    if let Err(e) = enable_raw_mode() {
        eprintln!("cannot enter raw mode: {}", e);
        engine.shutdown();
        return false;
    }
    let result = control_loop(&engine);
    log_err(disable_raw_mode(), "restoring terminal");
    println!();
    engine.shutdown();

    match result {
        Ok(()) => true,
        Err(e) => {
            eprintln!("terminal error: {}", e);
            false
        }
    }
}

fn cmd_check(args: &[String]) -> bool {
    let Some(Loaded { catalog, config }) = load_catalog(args, "usage: cuebox check <catalog>") else {
        return false;
    };
    print_keys(&catalog);
    for theme in catalog.themes() {
        let files: usize = theme.backgrounds.iter().map(|b| b.files.len()).sum();
        println!(
            "theme {} ({}): {} background files, {} effects, basetime {}s",
            theme.key,
            theme.id,
            files,
            theme.effects.len(),
            theme.basetime
        );
        for effect in &theme.effects {
            let cooldown = if effect.allows_overlap() {
                "overlap".to_string()
            } else {
                format!("cooldown {}s", effect.cooldown)
            };
            let mode = if effect.looped {
                "loop".to_string()
            } else {
                format!("{} per {}s", effect.occurrence, theme.basetime)
            };
            println!("    {:<24} {}  {}  ({} files)", effect.name, mode, cooldown, effect.files.len());
        }
    }
    println!(
        "tick {:?}, {} channels, reactivate {:?}",
        config.tick, config.channels, config.reactivate
    );
    println!("ok");
    true
}

fn cmd_simulate(args: &[String]) -> bool {
    let usage = "usage: cuebox simulate <catalog> [seconds] [seed] [theme-key]";
    let Some(Loaded { catalog, config }) = load_catalog(args, usage) else {
        return false;
    };
    let seconds = match args.get(1).map(|s| parse_seconds(s)) {
        None => 600.0,
        Some(Some(secs)) => secs,
        Some(None) => {
            eprintln!("{}", usage);
            return false;
        }
    };
    let seed: u64 = match args.get(2).map(|s| s.parse()) {
        None => 0,
        Some(Ok(seed)) => seed,
        Some(Err(_)) => {
            eprintln!("{}", usage);
            return false;
        }
    };
    let key = args.get(3).and_then(|s| s.chars().next());

    let theme_key = match key.or_else(|| catalog.default_theme().map(|t| t.key)) {
        Some(k) => k,
        None => match catalog.themes().first() {
            Some(theme) => theme.key,
            None => return false,
        },
    };

    let backend = Arc::new(RecordingBackend::new());
    let config = config.with_seed(seed);
    let dt = config.dt();
    let mut director = match Director::new(Arc::new(catalog), backend.clone(), config) {
        Ok(director) => director,
        Err(e) => {
            eprintln!("cannot simulate: {}", e);
            return false;
        }
    };
    director.activate_theme(theme_key);
    if director.phase() == Phase::Idle {
        eprintln!("no theme on key {:?}", theme_key);
        return false;
    }

    let mut ends: Vec<(f64, cuebox_core::ChannelId)> = Vec::new();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let ticks = (seconds / dt).ceil() as u64;
    for _ in 0..=ticks {
        let now = director.clock();
        ends.retain(|(end, channel)| {
            if *end <= now {
                backend.finish(*channel);
                false
            } else {
                true
            }
        });

        for call in backend.calls() {
            if let BackendCall::Play { channel, file, priority, volume } = call {
                let length = match priority {
                    Priority::Background => SIM_BACKGROUND_SECS,
                    _ => SIM_CUE_SECS,
                };
                ends.push((now + length, channel));
                println!(
                    "[{:>8.1}s] {:<15} {:<30} vol {:.2}",
                    now,
                    priority_label(priority),
                    file_label(&file),
                    volume
                );
                *counts.entry(file_label(&file)).or_default() += 1;
            }
        }
        backend.clear_calls();
        director.tick();
    }
    director.shutdown();

    println!();
    println!("{:.0}s simulated, seed {}", director.clock(), seed);
    for (file, count) in &counts {
        println!("  {:>5}  {}", count, file);
    }
    true
}

// ---------------------------------------------------------------------------
// Raw-mode control
// ---------------------------------------------------------------------------

fn control_loop(engine: &Engine) -> std::io::Result<()> {
    let mut last_status = String::new();
    loop {
        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                if !handle_key(engine, key) {
                    return Ok(());
                }
            }
        }

        let status = status_line(&engine.snapshot());
        if status != last_status {
            print!("\r\x1b[2K{}", status);
            std::io::stdout().flush()?;
            last_status = status;
        }
    }
}

/// Dispatch one key press. Returns false on quit.
fn handle_key(engine: &Engine, key: KeyEvent) -> bool {
    let cmd = match key.code {
        KeyCode::Esc => return false,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return false,
        KeyCode::Char(' ') => Some(Command::TogglePause),
        KeyCode::Right => Some(Command::SkipNext),
        KeyCode::Left => Some(Command::SkipPrevious),
        KeyCode::Backspace => Some(Command::DeactivateTheme),
        KeyCode::F(1) => Some(Command::ToggleAudio),
        KeyCode::F(2) => Some(Command::ToggleSound),
        KeyCode::Char(c) => {
            log_err(engine.key(c.to_ascii_lowercase()), "key dispatch");
            None
        }
        _ => None,
    };
    if let Some(cmd) = cmd {
        log_err(engine.command(cmd), "command");
    }
    true
}

fn status_line(snap: &Snapshot) -> String {
    let phase = match snap.phase {
        Phase::Idle => "idle",
        Phase::Playing => "playing",
        Phase::Paused => "paused",
        Phase::Interrupted { .. } => "interrupted",
    };
    let theme = snap
        .theme
        .as_ref()
        .map(|t| format!("[{}] {}", t.key, t.name))
        .unwrap_or_else(|| "-".into());
    let mut line = format!("{:<11} {}", phase, theme);
    if let Some(title) = &snap.background {
        line.push_str(&format!("  ♪ {}", title));
    }
    let cues: Vec<&str> = snap
        .sounding
        .iter()
        .filter(|s| s.priority != Priority::Background)
        .map(|s| s.label.as_str())
        .collect();
    if !cues.is_empty() {
        line.push_str(&format!("  + {}", cues.join(", ")));
    }
    if !snap.audio_enabled {
        line.push_str("  [music off]");
    }
    if !snap.sound_enabled {
        line.push_str("  [sounds off]");
    }
    if snap.degraded {
        line.push_str("  [no audio device]");
    }
    line
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_catalog(args: &[String], usage: &str) -> Option<Loaded> {
    let Some(path) = args.first() else {
        eprintln!("{}", usage);
        return None;
    };
    match cuebox_core::load(Path::new(path)) {
        Ok(loaded) => Some(loaded),
        Err(e) => {
            eprintln!("{}: {}", path, e);
            None
        }
    }
}

fn print_keys(catalog: &cuebox_core::Catalog) {
    println!("themes:");
    for theme in catalog.themes() {
        let default = if theme.default { "  (default)" } else { "" };
        println!("  {}  {}{}", theme.key, theme.name, default);
    }
    if !catalog.globals().is_empty() {
        println!("globals:");
        for global in catalog.globals() {
            let kind = if global.interrupting { "  (interrupts)" } else { "" };
            println!("  {}  {}{}", global.key, global.name, kind);
        }
    }
}

/// A finite, non-negative duration in seconds.
fn parse_seconds(arg: &str) -> Option<f64> {
    arg.parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::Background => "background",
        Priority::Effect => "effect",
        Priority::GlobalOverlay => "global",
        Priority::GlobalInterrupt => "global (int.)",
    }
}

fn file_label(file: &Path) -> String {
    file.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}

fn log_err<T, E: std::fmt::Display>(result: Result<T, E>, context: &str) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => {
            log::warn!("cuebox: {} failed: {}", context, e);
            false
        }
    }
}

fn print_usage() {
    println!("cuebox - ambient sound board");
    println!();
    println!("usage: cuebox <command> [args]");
    println!();
    println!("commands:");
    println!("  run <catalog>                          Play a catalog");
    println!("  check <catalog>                        Validate a catalog and list its keys");
    println!("  simulate <catalog> [secs] [seed] [key] Headless dry run of one theme");
    println!();
    println!("keys while running:");
    println!("  a-z, 0-9   activate a theme / fire a global cue");
    println!("  space      pause / resume");
    println!("  right/left next / previous background track");
    println!("  backspace  stop the active theme");
    println!("  F1 / F2    music / sounds on-off");
    println!("  esc        quit");
}
