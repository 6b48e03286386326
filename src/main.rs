use render_link::cli::Args;
use render_link::config::{self, Config, PathConfig};
use render_link::core::{IndicatorDisplay, RenderSink, RenderStatus, RequestMode};
use render_link::session::RenderSession;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Busy indicator rendered as log lines
struct ConsoleIndicator;

impl IndicatorDisplay for ConsoleIndicator {
    fn show(&self, name: &str) {
        info!("[busy] {}", name);
    }

    fn restore_default(&self) {
        debug!("[busy] idle");
    }
}

/// Reports render results on the console and counts completions
#[derive(Default)]
struct ConsoleSink {
    completed: AtomicUsize,
}

impl RenderSink for ConsoleSink {
    fn set_status(&self, resource_id: &str, status: RenderStatus) {
        match status {
            RenderStatus::Rendering => info!("Resource {}: rendering", resource_id),
            RenderStatus::Finished => info!("Resource {}: finished", resource_id),
            RenderStatus::Expired => {
                warn!("Resource {}: render expired", resource_id);
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
            RenderStatus::Failed => {
                warn!("Resource {}: render request failed", resource_id);
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn deliver(&self, payload: &Value) {
        let outputs = payload
            .get("outputs")
            .and_then(Value::as_array)
            .map(|o| o.len())
            .unwrap_or(0);
        println!(
            "render {}: {} output(s)",
            payload.get("id").unwrap_or(&Value::Null),
            outputs
        );
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

fn init_logging(args: &Args, paths: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| config::config_file("render-link.log", paths));
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .filter_module("tiny_http", log::LevelFilter::Warn)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging, respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .filter_module("tiny_http", log::LevelFilter::Warn)
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let paths = PathConfig::from_env_and_cli(args.config_dir.clone());
    init_logging(&args, &paths)?;

    info!("render-link {} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let mut config = match &args.config_file {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&paths)?,
    };
    if let Some(port) = args.engine_port {
        config.engine_port = port;
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = Some(dir.clone());
    }
    info!("Engine: {}", config.engine_base());

    let sink = Arc::new(ConsoleSink::default());
    let mut session = RenderSession::new(config, Arc::new(ConsoleIndicator), sink.clone());
    let port = session.start(args.connect)?;
    println!("listening for renders on http://127.0.0.1:{}", port);

    for path in &args.load {
        let id = session.load_resource(&path.to_string_lossy())?;
        println!("loaded {} as {}", path.display(), id);
    }

    for (resource, graph) in &args.render {
        let outcome = session.submit_render(resource, *graph, RequestMode::Async);
        info!("Render {}:{} {:?}", resource, graph, outcome);
    }

    loop {
        session.tick();
        if let Some(limit) = args.exit_after {
            if sink.completed.load(Ordering::SeqCst) >= limit {
                info!("{} render(s) completed, exiting", limit);
                break;
            }
        }
        thread::sleep(session.config().drain_interval());
    }

    session.shutdown();
    Ok(())
}
