use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::Result;

/// Connect to `host:port` with default settings.
pub fn connect(host: &str, port: u16) -> Result<Connection> {
    connect_with_config(host, port, ConnectionConfig::default())
}

/// Connect with explicit configuration.
pub fn connect_with_config(host: &str, port: u16, config: ConnectionConfig) -> Result<Connection> {
    let connection = Connection::new(config);
    connection.connect(host, port)?;
    Ok(connection)
}
