//! `ppssync` - CLI for the PPS sync engine
//!
//! This binary runs the sync engine in the foreground, inspects saved session
//! documents and shows the effective configuration.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, RecvTimeoutError};

use ppssync::cli::{Cli, Command, ConfigCommand, InspectCommand, RunCommand};
use ppssync::{
    edge_source_from_config, init_logging, platform_name, Config, EdgeSource,
    SimulatedEdgeSource, SyncDocument, SyncManager, SyncStatus,
};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    match cli.command {
        Command::Run(run_cmd) => {
            let config = Config::load_from(cli.config)?;
            handle_run(config, &run_cmd)
        }
        Command::Inspect(inspect_cmd) => handle_inspect(&inspect_cmd),
        Command::Config(config_cmd) => handle_config(cli.config, config_cmd),
    }
}

fn handle_run(mut config: Config, cmd: &RunCommand) -> Result<()> {
    if let Some(pin) = cmd.pin {
        config.sync.pulse_source_pin = pin;
    }
    if !config.sync.enabled {
        println!("PPS sync is disabled in the configuration (sync.enabled = false).");
        return Ok(());
    }

    let source: Arc<dyn EdgeSource> = if cmd.simulate {
        Arc::new(SimulatedEdgeSource::new(Duration::from_secs(1)))
    } else {
        edge_source_from_config(&config)
    };

    println!(
        "Platform: {}, edge source: {}, pin {}",
        platform_name(),
        source.name(),
        config.sync.pulse_source_pin
    );
    let manager = SyncManager::new(config, source);
    manager.start().context("failed to start PPS sync")?;

    let (interrupt_tx, interrupt_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("failed to install Ctrl+C handler")?;

    let deadline = cmd
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    loop {
        let wait = deadline.map_or(STATUS_INTERVAL, |d| {
            STATUS_INTERVAL.min(d.saturating_duration_since(Instant::now()))
        });
        match interrupt_rx.recv_timeout(wait) {
            Ok(()) => {
                println!("Interrupted, stopping...");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        print_status(&manager.status(), cmd.json)?;
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
    }

    manager.stop();
    let status = manager.status();
    if let Some(path) = &status.document_path {
        println!("Session saved to {}", path.display());
    }
    if let Some(err) = &status.flush.last_error {
        anyhow::bail!("final flush failed: {err}");
    }
    Ok(())
}

fn print_status(status: &SyncStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(status)?);
        return Ok(());
    }

    let last = status
        .last_pulse_time
        .map_or_else(|| "-".to_string(), |t| t.format("%H:%M:%S%.3f").to_string());
    let stability = status
        .stability
        .map_or_else(|| "undefined".to_string(), |s| format!("{s:.4}"));
    println!(
        "[{}] pulses: {:>6}  last: {}  stability: {}  dropped: {}  recordings: {} ({} open)  photos: {}  fixes: {}",
        status.state,
        status.pulse_count,
        last,
        stability,
        status.dropped_pulses,
        status.counts.recordings,
        status.counts.open_recordings,
        status.counts.photos,
        status.counts.position_fixes
    );
    Ok(())
}

fn handle_inspect(cmd: &InspectCommand) -> Result<()> {
    let document = SyncDocument::load(&cmd.file)
        .with_context(|| format!("failed to read {}", cmd.file.display()))?;
    let counts = document.counts();

    if cmd.json {
        let mut summary = serde_json::json!({
            "path": cmd.file,
            "counts": counts,
        });
        if let Some(limit) = cmd.pulses {
            let skip = document.pulse_events.len().saturating_sub(limit);
            summary["recentPulses"] = serde_json::to_value(&document.pulse_events[skip..])?;
        }
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Session document: {}", cmd.file.display());
    println!("==================");
    println!();
    println!("  Recordings:     {}", counts.recordings);
    println!("  Still open:     {}", counts.open_recordings);
    println!("  Photos:         {}", counts.photos);
    println!("  Position fixes: {}", counts.position_fixes);
    println!("  Pulses kept:    {}", counts.pulses);

    let view = document.to_view();
    if !view.recordings.is_empty() {
        println!();
        println!("[Recordings]");
        for span in &view.recordings {
            let stop = match (span.stop_time, span.stop_snapshot) {
                (Some(time), Some(snapshot)) => {
                    format!("{} (pulse #{})", time, snapshot.pulse_sequence)
                }
                _ => "open".to_string(),
            };
            println!(
                "  {}  {} (pulse #{}) -> {}",
                span.artifact_path.display(),
                span.start_time,
                span.start_snapshot.pulse_sequence,
                stop
            );
        }
    }

    if let Some(limit) = cmd.pulses {
        println!();
        println!("[Recent pulses]");
        let skip = document.pulse_events.len().saturating_sub(limit);
        for pulse in &document.pulse_events[skip..] {
            println!("  #{:<8} {}", pulse.count, pulse.time);
        }
    }
    Ok(())
}

fn handle_config(config_path: Option<std::path::PathBuf>, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = Config::load_from(config_path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print_config(&config);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file
                .or(config_path)
                .unwrap_or_else(Config::default_config_path);
            validate_config(&path);
        }
    }
    Ok(())
}

fn print_config(config: &Config) {
    println!("Current Configuration");
    println!("=====================");
    println!();
    println!("[Sync]");
    println!("  Enabled:             {}", config.sync.enabled);
    println!("  PPS pin:             {}", config.sync.pulse_source_pin);
    println!(
        "  Min fix interval:    {}s",
        config.sync.min_position_fix_interval_seconds
    );
    println!("  Flush interval:      {}s", config.sync.flush_interval_seconds);
    println!("  History window:      {}", config.sync.pulse_history_window);
    println!("  Recent pulses kept:  {}", config.sync.recent_pulse_retention);
    println!("  Queue capacity:      {}", config.sync.queue_capacity);
    println!("  Stop timeout:        {}ms", config.sync.stop_timeout_ms);
    println!();
    println!("[Storage]");
    println!("  Sync directory:      {}", config.sync_dir().display());
    println!("  Timestamp format:    {}", config.storage.timestamp_format);
    println!("  Per-day subdirs:     {}", config.storage.use_timestamp_subdir);
    println!();
    println!("[Hardware]");
    println!("  Platform:            {}", platform_name());
    println!("  Source:              {}", config.hardware.source);
    println!("  Sysfs root:          {}", config.hardware.sysfs_root.display());
    println!("  Debounce:            {}ms", config.hardware.debounce_ms);
    println!("  Poll interval:       {}us", config.hardware.poll_interval_us);
}

fn validate_config(path: &Path) {
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path.to_path_buf())) {
        Ok(_) => println!("Configuration is valid."),
        Err(e) => println!("Configuration error: {e}"),
    }
}
