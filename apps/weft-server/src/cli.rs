//! Command-line argument parsing

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "weft-server",
    about = "Weft workflow engine server",
    version,
    long_about = "Runs the weft workflow engine: loads workflow documents, \
                  recovers unfinished executions, fires cron schedules and \
                  serves the HTTP control API."
)]
pub struct Args {
    /// Path to configuration file; environment variables (WEFT__*) apply on top
    #[arg(short, long, env = "WEFT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory of workflow documents (*.yaml, *.yml, *.json)
    #[arg(short, long, env = "WEFT_WORKFLOWS", default_value = "workflows")]
    pub workflows: PathBuf,

    /// HTTP server port; overrides server.port from the configuration
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: String,

    /// Enable JSON log format (useful for production)
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Do not re-attach unfinished executions on boot
    #[arg(long)]
    pub no_recover: bool,
}

impl Args {
    /// Validate the arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(config) = &self.config {
            if !config.exists() {
                anyhow::bail!("configuration file {} does not exist", config.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["weft-server"]);
        assert!(args.config.is_none());
        assert_eq!(args.workflows, PathBuf::from("workflows"));
        assert_eq!(args.log_level, "info");
        assert!(!args.no_recover);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_missing_config_file_rejected() {
        let args = Args::parse_from(["weft-server", "--config", "/nonexistent/weft.toml"]);
        assert!(args.validate().is_err());
    }
}
