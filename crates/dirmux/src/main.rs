mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "dirmux", version, about = "Directory protocol client CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "warn",
        env = "DIRMUX_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bind_subcommand() {
        let cli = Cli::try_parse_from([
            "dirmux",
            "bind",
            "ldap.example.com",
            "--port",
            "1389",
            "--dn",
            "cn=admin,dc=example,dc=com",
            "--password",
            "secret",
        ])
        .expect("bind args should parse");

        match cli.command {
            Command::Bind(args) => {
                assert_eq!(args.server.port, 1389);
                assert_eq!(args.credentials.dn.as_deref(), Some("cn=admin,dc=example,dc=com"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn extended_requires_an_oid() {
        let err = Cli::try_parse_from(["dirmux", "extended", "ldap.example.com"])
            .expect_err("missing --oid should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn parses_watch_with_global_format() {
        let cli = Cli::try_parse_from([
            "dirmux", "watch", "ldap.example.com", "--count", "2", "--format", "json",
        ])
        .expect("watch args should parse");
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert!(matches!(cli.command, Command::Watch(ref args) if args.count == Some(2)));
    }
}
