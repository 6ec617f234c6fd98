use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "classbook-service")]
#[command(about = "HTTP service for class schedules and homework calendars")]
pub struct Args {
    #[arg(long, env = "CLASSBOOK_BIND", default_value = "127.0.0.1:8000")]
    pub bind: SocketAddr,
    #[arg(long, env = "CLASSBOOK_DB", default_value = "./classbook.sqlite3")]
    pub db: PathBuf,
    /// Directory holding `templates/index.html` and the `res/` static files.
    #[arg(long, env = "CLASSBOOK_RESOURCES_DIR", default_value = ".")]
    pub resources_dir: PathBuf,
    /// Reload the index template on every request.
    #[arg(long, env = "CLASSBOOK_LOCAL", default_value_t = true, action = ArgAction::Set)]
    pub local: bool,
    /// JSON file with the identity service `api_key` and optional `endpoint`.
    #[arg(long, env = "CLASSBOOK_IDENTITY_CONFIG", default_value = "./identity.json")]
    pub identity_config: PathBuf,
}

/// Install the global fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TCFG-001
    #[test]
    fn args_default_to_local_development_values() {
        let args = Args::try_parse_from(["classbook-service"])
            .unwrap_or_else(|err| panic!("failed to parse default args: {err}"));

        assert_eq!(args.bind.port(), 8000);
        assert_eq!(args.db, PathBuf::from("./classbook.sqlite3"));
        assert_eq!(args.resources_dir, PathBuf::from("."));
        assert!(args.local);
        assert_eq!(args.identity_config, PathBuf::from("./identity.json"));
    }

    // Test IDs: TCFG-002
    #[test]
    fn local_flag_takes_explicit_value() {
        let args = Args::try_parse_from([
            "classbook-service",
            "--local",
            "false",
            "--bind",
            "0.0.0.0:9000",
        ])
        .unwrap_or_else(|err| panic!("failed to parse args: {err}"));

        assert!(!args.local);
        assert_eq!(args.bind.port(), 9000);
    }
}
