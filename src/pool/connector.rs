//! Dialing of new HTTP/1.1 connections
//!
//! A connection is a TCP stream (optionally wrapped in TLS) handed to a hyper
//! HTTP/1.1 client handshake. The connection driver runs on its own task; it
//! finishes when the sender half is dropped or the peer hangs up.

use bytes::Bytes;
use http_body_util::Empty;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use super::connection::PoolError;
use super::route::{Route, Scheme};

/// Sender half of a pooled HTTP/1.1 connection
pub type Sender = http1::SendRequest<Empty<Bytes>>;

/// Opens connections for the pool with default TLS settings
#[derive(Clone)]
pub struct Connector {
    tls: tokio_native_tls::TlsConnector,
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(connect_timeout: Duration) -> Result<Self, PoolError> {
        let tls = native_tls::TlsConnector::new()?;
        Ok(Self {
            tls: tokio_native_tls::TlsConnector::from(tls),
            connect_timeout,
        })
    }

    /// Open a connection to the route, TCP and TLS setup included, within the connect timeout
    pub async fn connect(&self, route: &Route) -> Result<Sender, PoolError> {
        tokio::time::timeout(self.connect_timeout, self.establish(route))
            .await
            .map_err(|_| PoolError::ConnectTimeout {
                route: route.to_string(),
                timeout: self.connect_timeout,
            })?
    }

    async fn establish(&self, route: &Route) -> Result<Sender, PoolError> {
        let addr = route.authority();

        debug!(route = %route, "Dialing new connection");

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| PoolError::Connect {
                route: route.to_string(),
                source: e,
            })?;

        // Configure TCP keep-alive
        let socket = socket2::Socket::from(stream.into_std()?);
        socket.set_keepalive(true)?;
        let stream = TcpStream::from_std(socket.into())?;
        stream.set_nodelay(true)?;

        match route.scheme {
            Scheme::Http => handshake(route, stream).await,
            Scheme::Https => {
                let stream = self.tls.connect(&route.host, stream).await?;
                handshake(route, stream).await
            }
        }
    }
}

async fn handshake<T>(route: &Route, io: T) -> Result<Sender, PoolError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(io))
        .await
        .map_err(PoolError::Handshake)?;

    // Spawn connection driver task
    let route_label = route.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(route = %route_label, error = %e, "Connection closed with error");
        }
    });

    Ok(sender)
}
