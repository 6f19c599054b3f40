//! MySQL/MariaDB monitor connection.
//!
//! A thin text-protocol client: handshake with `mysql_native_password`,
//! COM_PING and COM_QUERY with full result-set collection. Read and write
//! timeouts bound every wire operation.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::config::ConnectionSettings;

use super::protocol::{
    capabilities, compute_auth_response, encode_handshake_response, is_eof_packet, is_err_packet,
    is_ok_packet, parse_lenenc_int, parse_lenenc_str, ErrPacket, InitialHandshake, Packet,
    PacketCodec, COM_PING, COM_QUERY,
};
use super::{ClientError, Connection, Connector, QueryResult};

/// Production connector for MySQL-compatible backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlConnector;

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(
        &self,
        address: &str,
        port: u16,
        user: &str,
        password: &str,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn Connection>, ClientError> {
        let conn = MySqlConnection::connect(address, port, user, password, settings).await?;
        Ok(Box::new(conn))
    }
}

pub struct MySqlConnection {
    framed: Framed<TcpStream, PacketCodec>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl MySqlConnection {
    pub async fn connect(
        address: &str,
        port: u16,
        user: &str,
        password: &str,
        settings: &ConnectionSettings,
    ) -> Result<Self, ClientError> {
        let addr = format!("{address}:{port}");
        debug!(addr = %addr, "Connecting to backend");

        let connect_timeout = settings.connect_timeout();

        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let mut conn = Self {
            framed: Framed::new(stream, PacketCodec),
            // The whole handshake runs under the connect timeout; per-command
            // timeouts take over afterwards.
            read_timeout: connect_timeout,
            write_timeout: connect_timeout,
        };

        let handshake_packet = conn.recv().await?;
        let handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| ClientError::Protocol("Invalid backend handshake".into()))?;

        debug!(
            server_version = %handshake.server_version,
            "Received backend handshake"
        );

        let auth_response = compute_auth_response(password, &handshake.auth_plugin_data);
        let caps = capabilities::MONITOR_CAPABILITIES & handshake.capability_flags;

        conn.send(encode_handshake_response(
            handshake_packet.sequence_id.wrapping_add(1),
            caps,
            user,
            &auth_response,
            &handshake.auth_plugin_name,
        ))
        .await?;

        let reply = conn.recv().await?;
        if is_err_packet(&reply.payload) {
            return Err(server_error(&reply.payload));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(ClientError::Protocol(
                "Expected OK packet from backend".into(),
            ));
        }

        conn.read_timeout = settings.read_timeout();
        conn.write_timeout = settings.write_timeout();
        Ok(conn)
    }

    async fn send(&mut self, packet: Packet) -> Result<(), ClientError> {
        timeout(self.write_timeout, self.framed.send(packet))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Packet, ClientError> {
        match timeout(self.read_timeout, self.framed.next()).await {
            Err(_) => Err(ClientError::Timeout),
            Ok(None) => Err(ClientError::Disconnected),
            Ok(Some(Err(e))) => Err(ClientError::Io(e.to_string())),
            Ok(Some(Ok(packet))) => Ok(packet),
        }
    }
}

fn server_error(payload: &[u8]) -> ClientError {
    match ErrPacket::parse(payload) {
        Some(err) => ClientError::Server {
            code: err.error_code,
            message: err.error_message,
        },
        None => ClientError::Protocol("Malformed ERR packet".into()),
    }
}

/// Column name is the fifth length-encoded string of a column definition.
fn parse_column_name(payload: &[u8]) -> Result<String, ClientError> {
    let mut offset = 0;
    for _ in 0..4 {
        let (_, consumed) = parse_lenenc_str(&payload[offset..])
            .ok_or_else(|| ClientError::Protocol("Truncated column definition".into()))?;
        offset += consumed;
    }
    let (name, _) = parse_lenenc_str(&payload[offset..])
        .ok_or_else(|| ClientError::Protocol("Truncated column definition".into()))?;
    Ok(name.unwrap_or_default())
}

fn parse_row(payload: &[u8], columns: usize) -> Result<Vec<Option<String>>, ClientError> {
    let mut offset = 0;
    let mut row = Vec::with_capacity(columns);
    for _ in 0..columns {
        let (value, consumed) = parse_lenenc_str(&payload[offset..])
            .ok_or_else(|| ClientError::Protocol("Truncated row".into()))?;
        offset += consumed;
        row.push(value);
    }
    Ok(row)
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn ping(&mut self) -> Result<(), ClientError> {
        self.send(Packet::command(COM_PING, &[])).await?;
        let reply = self.recv().await?;
        if is_ok_packet(&reply.payload) {
            Ok(())
        } else if is_err_packet(&reply.payload) {
            Err(server_error(&reply.payload))
        } else {
            Err(ClientError::Protocol("Unexpected ping response".into()))
        }
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult, ClientError> {
        self.send(Packet::command(COM_QUERY, sql.as_bytes())).await?;

        let first = self.recv().await?;
        if is_err_packet(&first.payload) {
            return Err(server_error(&first.payload));
        }
        if is_ok_packet(&first.payload) {
            // Statement without a result set.
            return Ok(QueryResult::default());
        }

        let (column_count, _) = parse_lenenc_int(&first.payload)
            .ok_or_else(|| ClientError::Protocol("Invalid column count".into()))?;

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let def = self.recv().await?;
            columns.push(parse_column_name(&def.payload)?);
        }

        // EOF terminating the column definitions.
        let mut next = self.recv().await?;
        if is_eof_packet(&next.payload) {
            next = self.recv().await?;
        }

        let mut rows = Vec::new();
        loop {
            if is_eof_packet(&next.payload) || is_ok_packet(&next.payload) {
                break;
            }
            if is_err_packet(&next.payload) {
                return Err(server_error(&next.payload));
            }
            rows.push(parse_row(&next.payload, column_count as usize)?);
            next = self.recv().await?;
        }

        Ok(QueryResult { columns, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_column_name() {
        // def, schema, table, org_table, name, org_name
        let mut payload = Vec::new();
        for part in [&b"def"[..], b"", b"disks", b"DISKS", b"Path", b"Path"] {
            payload.push(part.len() as u8);
            payload.extend_from_slice(part);
        }
        assert_eq!(parse_column_name(&payload).unwrap(), "Path");
        assert!(parse_column_name(&payload[..3]).is_err());
    }

    #[test]
    fn test_parse_row_with_null() {
        let payload = [0x01, b'4', 0xFB, 0x02, b'o', b'k'];
        let row = parse_row(&payload, 3).unwrap();
        assert_eq!(row[0].as_deref(), Some("4"));
        assert_eq!(row[1], None);
        assert_eq!(row[2].as_deref(), Some("ok"));

        assert!(parse_row(&payload, 4).is_err());
    }

    #[test]
    fn test_server_error_mapping() {
        let mut payload = vec![0xFF, 0x15, 0x04];
        payload.extend_from_slice(b"#28000Access denied for user");
        let err = server_error(&payload);
        assert!(err.is_access_denied());
    }
}
