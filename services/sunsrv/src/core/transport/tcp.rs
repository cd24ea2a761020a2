//! TCP Transport Implementation
//!
//! Modbus TCP over a single `TcpStream`. Every socket operation is bounded
//! by the configured timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::traits::{Transport, TransportError};
use crate::protocols::modbus::constants::MBAP_HEADER_LEN;
use crate::protocols::modbus::{decode_read_response, MbapHeader, ReadHoldingRequest};

/// TCP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpTransportConfig {
    /// Remote host address
    pub host: String,
    /// Remote port number
    pub port: u16,
    /// Connect and per-request timeout
    pub timeout: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            timeout: Duration::from_secs(3),
        }
    }
}

impl TcpTransportConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.is_empty() {
            return Err(TransportError::ConfigError(
                "Host cannot be empty".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(TransportError::ConfigError(
                "Port cannot be zero".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(TransportError::ConfigError(
                "Timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// TCP transport implementation
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpTransportConfig,
    stream: Option<TcpStream>,
    next_transaction_id: u16,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Result<Self, TransportError> {
        config.validate()?;

        Ok(Self {
            config,
            stream: None,
            next_transaction_id: 1,
        })
    }

    fn next_transaction(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    async fn exchange(
        &mut self,
        request: &ReadHoldingRequest,
    ) -> Result<Vec<u16>, TransportError> {
        let io_timeout = self.config.timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let frame = request.encode();
        match timeout(io_timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => return Err(TransportError::ConnectionLost(e.to_string())),
            Err(_) => return Err(TransportError::Timeout("send".to_string())),
        }

        let mut header_buf = [0u8; MBAP_HEADER_LEN];
        match timeout(io_timeout, stream.read_exact(&mut header_buf)).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => return Err(TransportError::ConnectionLost(e.to_string())),
            Err(_) => {
                return Err(TransportError::Timeout(format!(
                    "no response from unit {} within {:?}",
                    request.unit_id, io_timeout
                )))
            },
        }

        let header = MbapHeader::from_bytes(&header_buf)?;
        let mut pdu = vec![0u8; header.pdu_length()];
        match timeout(io_timeout, stream.read_exact(&mut pdu)).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => return Err(TransportError::ConnectionLost(e.to_string())),
            Err(_) => return Err(TransportError::Timeout("response body".to_string())),
        }

        decode_read_response(request, &header, &pdu)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let addr = self.config.socket_addr();
        debug!("Connecting to Modbus TCP endpoint: {addr}");

        match timeout(self.config.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {e}");
                }
                self.stream = Some(stream);
                info!("Connected to Modbus host {addr}");
                Ok(())
            },
            Ok(Err(e)) => {
                error!("Failed to connect to {addr}: {e}");
                Err(TransportError::ConnectionFailed(format!("{addr}: {e}")))
            },
            Err(_) => {
                warn!("Connection to {addr} timed out after {:?}", self.config.timeout);
                Err(TransportError::ConnectionFailed(format!(
                    "{addr}: timed out after {:?}",
                    self.config.timeout
                )))
            },
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Socket shutdown reported: {e}");
            }
            debug!("Disconnected from {}", self.config.socket_addr());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let request = ReadHoldingRequest::new(self.next_transaction(), unit_id, address, count)?;
        let result = self.exchange(&request).await;

        // Anything but a clean exception leaves unread bytes behind; start over
        if let Err(e) = &result {
            if !matches!(e, TransportError::Exception { .. }) {
                self.stream = None;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_tcp_config_validation() {
        let config = TcpTransportConfig::default();
        assert!(config.validate().is_ok());

        let bad = TcpTransportConfig {
            host: String::new(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = TcpTransportConfig {
            port: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = TcpTransportConfig {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_not_connected_initially() {
        let transport = TcpTransport::new(TcpTransportConfig::default()).unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_read_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            socket.read_exact(&mut request).await.unwrap();
            // Echo transaction id and unit id, answer two registers
            let response = [
                request[0], request[1], 0x00, 0x00, 0x00, 0x07, request[6], 0x03, 0x04, 0x53,
                0x75, 0x6E, 0x53,
            ];
            socket.write_all(&response).await.unwrap();
        });

        let mut transport = TcpTransport::new(TcpTransportConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout: Duration::from_secs(2),
        })
        .unwrap();
        transport.connect().await.unwrap();
        let regs = transport.read_holding_registers(1, 40000, 2).await.unwrap();
        assert_eq!(regs, vec![0x5375, 0x6E53]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = TcpTransport::new(TcpTransportConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert!(!transport.is_connected());
    }
}
