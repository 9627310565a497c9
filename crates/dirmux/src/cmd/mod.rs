use std::time::Duration;

use clap::{Args, Subcommand};
use dirmux_client::{connect_with_config, BindMetadata, Connection, ConnectionConfig, Multiplexer};
use dirmux_frame::{LdapResult, Request};
use dirmux_transport::tcp::DEFAULT_PORT;

use crate::exit::{client_error, frame_error, CliError, CliResult, FAILURE, USAGE};
use crate::output::OutputFormat;

pub mod bind;
pub mod extended;
pub mod version;
pub mod watch;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bind to a server and print the result.
    Bind(BindArgs),
    /// Send an extended operation by OID and print the response.
    Extended(ExtendedArgs),
    /// Print unsolicited notifications until interrupted.
    Watch(WatchArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Bind(args) => bind::run(args, format),
        Command::Extended(args) => extended::run(args, format),
        Command::Watch(args) => watch::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Directory server host name or address.
    pub host: String,
    /// Server port.
    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Connect and per-operation timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct CredentialArgs {
    /// Bind DN. Omit for an anonymous bind.
    #[arg(long, short = 'D')]
    pub dn: Option<String>,
    /// Bind password.
    #[arg(long, short = 'w', env = "DIRMUX_BIND_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Args, Debug)]
pub struct BindArgs {
    #[command(flatten)]
    pub server: ServerArgs,
    #[command(flatten)]
    pub credentials: CredentialArgs,
}

#[derive(Args, Debug)]
pub struct ExtendedArgs {
    #[command(flatten)]
    pub server: ServerArgs,
    /// Request OID.
    #[arg(long)]
    pub oid: String,
    /// Request value, sent as UTF-8.
    #[arg(long)]
    pub value: Option<String>,
    /// Bind with these credentials first.
    #[command(flatten)]
    pub credentials: CredentialArgs,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    pub server: ServerArgs,
    /// Exit after printing N notifications.
    #[arg(long)]
    pub count: Option<usize>,
    #[command(flatten)]
    pub credentials: CredentialArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// A connected client and the multiplexer its commands submit through.
pub struct Session {
    pub connection: Connection,
    pub mux: Multiplexer,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl Session {
    pub fn open(server: &ServerArgs) -> CliResult<Self> {
        let timeout = parse_duration(&server.timeout)?;
        let config = ConnectionConfig::default().with_connect_timeout(Some(timeout));
        let connection = connect_with_config(&server.host, server.port, config)
            .map_err(|err| client_error("connect failed", err))?;
        Ok(Self {
            connection,
            mux: Multiplexer::new(),
            host: server.host.clone(),
            port: server.port,
            timeout,
        })
    }

    /// Submit `request` and wait for its single terminal reply.
    pub fn call(
        &self,
        context: &str,
        request: &Request,
        bind: Option<BindMetadata>,
    ) -> CliResult<(i32, dirmux_frame::Frame)> {
        let id = self
            .mux
            .submit(&self.connection, request, Some(self.timeout), bind)
            .map_err(|err| client_error(context, err))?;
        loop {
            let frame = self
                .mux
                .next_response(Some(id))
                .map_err(|err| client_error(context, err))?
                .ok_or_else(|| CliError::new(FAILURE, format!("{context}: no response")))?;
            if frame.is_terminal() {
                return Ok((id, frame));
            }
            tracing::debug!(msg_id = id, op = %frame.op, "skipping intermediate response");
        }
    }

    /// Simple bind, or anonymous when no DN was given.
    pub fn bind(&self, credentials: &CredentialArgs) -> CliResult<(i32, LdapResult)> {
        let version = self.connection.config().protocol_version;
        let dn = credentials.dn.as_deref().unwrap_or("");
        let password = credentials.password.as_deref().unwrap_or("");
        if dn.is_empty() && !password.is_empty() {
            return Err(CliError::new(USAGE, "--password requires --dn"));
        }

        let request = Request::simple_bind(version, dn, password.as_bytes());
        let (id, frame) = self.call(
            "bind failed",
            &request,
            Some(BindMetadata::simple(version, dn)),
        )?;
        let result = LdapResult::decode(&frame).map_err(|err| frame_error("bind failed", err))?;
        Ok((id, result))
    }
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
