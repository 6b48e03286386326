use clap::Parser;
use std::path::PathBuf;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "HTTP:   rouille 3.6 (listener), ureq 2 (client)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Render coordination bridge for a local procedural material engine
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Read configuration from this file instead of the config directory
    #[arg(long = "config", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Engine port override
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub engine_port: Option<u16>,

    /// Directory rendered outputs are moved into
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Announce this process to the engine on startup
    #[arg(long = "connect")]
    pub connect: bool,

    /// Load a resource file into the engine (can be specified multiple times)
    #[arg(long = "load", value_name = "FILE")]
    pub load: Vec<PathBuf>,

    /// Request a render, RESOURCE or RESOURCE:GRAPH (can be specified multiple times)
    #[arg(short = 'r', long = "render", value_name = "RESOURCE[:GRAPH]", value_parser = parse_render_target)]
    pub render: Vec<(String, u32)>,

    /// Exit after this many render completions
    #[arg(long = "exit-after", value_name = "N")]
    pub exit_after: Option<usize>,

    /// Enable debug logging to file (default: render-link.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

/// `RESOURCE[:GRAPH]`, graph defaults to 0
pub fn parse_render_target(s: &str) -> Result<(String, u32), String> {
    let (resource, graph) = match s.rsplit_once(':') {
        Some((resource, graph)) => {
            let graph = graph
                .parse::<u32>()
                .map_err(|_| format!("invalid graph index '{}'", graph))?;
            (resource, graph)
        }
        None => (s, 0),
    };
    if resource.is_empty() {
        return Err("empty resource id".to_string());
    }
    Ok((resource.to_string(), graph))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_target_parsing() {
        assert_eq!(parse_render_target("12"), Ok(("12".to_string(), 0)));
        assert_eq!(parse_render_target("12:3"), Ok(("12".to_string(), 3)));
        assert!(parse_render_target("12:x").is_err());
        assert!(parse_render_target(":1").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "render-link", "-vv", "--connect", "--render", "4:1", "-r", "5", "--exit-after", "2",
        ])
        .unwrap();
        assert_eq!(args.verbosity, 2);
        assert!(args.connect);
        assert_eq!(args.render, vec![("4".to_string(), 1), ("5".to_string(), 0)]);
        assert_eq!(args.exit_after, Some(2));
        assert!(args.log_file.is_none());
    }
}
