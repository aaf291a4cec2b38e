use feedplay::cli::Args;
use feedplay::config::{self, FeedSettings, PathConfig, Profile};
use feedplay::core::{Feed, FeedStats, ManualClock};
use feedplay::entities::{Clock, MediaSource, PostId, ViewRef};
use feedplay::sim::{SimBehavior, SimHost, SimLayout};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What the run printed at exit
#[derive(Debug, Serialize)]
struct Summary {
    profile: Profile,
    simulated_ms: u128,
    scroll_y: f64,
    posts_registered: usize,
    events: usize,
    peak_audible: usize,
    total_creates: u32,
    stats: FeedStats,
}

fn post_id(index: usize) -> PostId {
    PostId::new(format!("post-{index}"))
}

fn source(index: usize) -> MediaSource {
    MediaSource::new(format!("https://cdn.example.com/v/{index}.mp4"))
        .with_hd(format!("https://cdn.example.com/v/{index}_1080.mp4"))
}

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn effective_settings(args: &Args, profile: Profile, path_config: &PathConfig) -> Result<FeedSettings> {
    let path = config::config_file(config::SETTINGS_FILE, path_config);
    let mut settings = FeedSettings::load_or(&path, FeedSettings::for_profile(profile))?;
    if let Some(n) = args.max_concurrent {
        settings.max_concurrent_videos = n;
    }
    if args.exclusive_audio {
        settings.exclusive_audio = true;
    }
    if args.hd {
        settings.hd_mode = true;
    }
    Ok(settings.sanitized())
}

/// Scroll a simulated infinite feed at constant speed for the requested time.
fn simulate(args: &Args, profile: Profile, settings: FeedSettings) -> Summary {
    let clock = Arc::new(ManualClock::new());
    let host = SimHost::new(clock.clone());
    let normal = SimBehavior { load_latency_ms: args.latency_ms, ..SimBehavior::default() };
    host.set_default_behavior(normal);
    for &i in &args.fail {
        host.set_behavior(&post_id(i), SimBehavior { fail_loads: u32::MAX, ..normal });
    }
    for &i in &args.reject {
        host.set_behavior(&post_id(i), SimBehavior { reject_plays: u32::MAX, ..normal });
    }

    let mut feed = Feed::new(settings, host.clone(), clock.clone());
    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    let print_events = args.print_events;
    feed.events().subscribe(move |e| {
        counter.fetch_add(1, Ordering::Relaxed);
        if print_events {
            if let Ok(line) = serde_json::to_string(e) {
                println!("{line}");
            }
        }
    });

    let page = args.posts.max(1);
    let mut layout = SimLayout::new(page, args.item_height, 0.0, args.viewport);
    for i in 0..page {
        feed.register_post(post_id(i), ViewRef(i as u64), Some(source(i)));
    }
    feed.on_layout(&layout);

    let step = Duration::from_millis(args.step_ms.max(1));
    let total = Duration::from_secs_f64(args.duration.max(0.0));
    let px_per_step = args.scroll_speed * step.as_secs_f64();
    let mut y = 0.0;

    while clock.now() < total {
        clock.advance(step);
        feed.tick();

        y += px_per_step;
        // Infinite scroll: next page when two viewports from the end
        if layout.max_scroll() - y < args.viewport * 2.0 {
            let start = layout.len();
            layout.extend(page);
            for i in start..layout.len() {
                feed.register_post(post_id(i), ViewRef(i as u64), Some(source(i)));
            }
            debug!("Loaded page: {} posts total", layout.len());
            feed.on_layout(&layout);
        }
        layout.scroll_to(y);
        feed.on_scroll(layout.scroll_y(), &layout);
    }

    let summary = Summary {
        profile,
        simulated_ms: clock.now().as_millis(),
        scroll_y: layout.scroll_y(),
        posts_registered: layout.len(),
        events: events.load(Ordering::Relaxed),
        peak_audible: host.peak_audible(),
        total_creates: host.total_creates(),
        stats: feed.stats(),
    };
    feed.cleanup();
    summary
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }
    init_logging(&args, &path_config)?;

    info!("feedplay starting...");
    debug!("Command-line args: {:?}", args);
    info!(
        "Config path: {}",
        config::config_file(config::SETTINGS_FILE, &path_config).display()
    );

    let profile = args.profile.unwrap_or_else(Profile::detect);
    let settings = effective_settings(&args, profile, &path_config)?;

    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }
    if args.save_config {
        let path = config::config_file(config::SETTINGS_FILE, &path_config);
        settings.save(&path)?;
        println!("Saved settings to {}", path.display());
        return Ok(());
    }

    let summary = simulate(&args, profile, settings);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
