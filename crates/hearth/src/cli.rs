//! Command-line interface of the `hearth` binary.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = "config.toml";

/// Options given on the command line. Everything except the config path
/// overrides the matching setting of the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config_path: PathBuf,
    /// Overrides `sessions.data_dir`
    pub data_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl CliArgs {
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG)),
            data_dir: matches.get_one::<String>("data-dir").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

fn command() -> Command {
    Command::new("hearth")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Game server runtime: ordered unit startup and session-locked persistence")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Directory of the file session backend"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(clap::ArgAction::SetTrue),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_from(args: &[&str]) -> CliArgs {
        let matches = command().try_get_matches_from(args).unwrap();
        CliArgs::from_matches(&matches)
    }

    #[test]
    fn test_defaults() {
        let args = parse_from(&["hearth"]);
        assert_eq!(args.config_path, PathBuf::from("config.toml"));
        assert!(args.data_dir.is_none());
        assert!(args.log_level.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn test_overrides() {
        let args = parse_from(&[
            "hearth",
            "--config",
            "/etc/hearth.toml",
            "-d",
            "/var/lib/hearth",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        assert_eq!(args.config_path, PathBuf::from("/etc/hearth.toml"));
        assert_eq!(args.data_dir, Some(PathBuf::from("/var/lib/hearth")));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(command()
            .try_get_matches_from(["hearth", "--bind", "0.0.0.0:8080"])
            .is_err());
    }
}
