//! The duplex control channel between the orchestrator and a host process.
//!
//! A channel is a loopback TCP listener plus a process-local random token.
//! The token travels to the host through the launch environment and must be
//! echoed in the agent's handshake, so concurrent test runs (and concurrent
//! host instances) can never cross-connect on recycled port numbers.
//!
//! The [AgentChannel] handle returned from a successful accept is the
//! client-owned remote proxy: all values crossing it are by-value records,
//! and releasing it (dropping, after a best-effort `Dispose`) is the explicit
//! disconnect; nothing here relies on distributed garbage collection.

use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::Future;
use hostrun_utils::net_protocol::{
    self,
    agent::{AgentReply, AgentRequest, AgentSpawnedMessage},
    descriptor::TestCaseDescriptor,
    results::RunResult,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use crate::bus::SharedBus;

#[derive(Debug, Clone)]
pub struct ChannelAddress {
    pub addr: std::net::SocketAddr,
    pub token: String,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The remote endpoint is gone. The host session is dead; do not retry
    /// at this layer.
    #[error("connection to the host agent was lost: {0}")]
    ConnectionLost(#[source] io::Error),
    #[error("host agent answered with an out-of-order message")]
    UnexpectedReply,
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        Self::ConnectionLost(e)
    }
}

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("timed out waiting for the host agent to dial back")]
    Timeout,
    #[error("host process exited before its agent dialed back")]
    HostDied,
    #[error("incompatible agent protocol version")]
    NotCompatible,
    #[error("agent handshake carried the wrong channel token")]
    TokenMismatch,
}

/// The orchestrator's end of one named channel.
pub struct ChannelTransport {
    name: String,
    listener: TcpListener,
    address: ChannelAddress,
}

impl ChannelTransport {
    /// Binds a fresh channel. `name` is purely diagnostic.
    pub async fn create(name: impl Into<String>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = ChannelAddress {
            addr: listener.local_addr()?,
            token: Uuid::new_v4().to_string(),
        };
        Ok(Self {
            name: name.into(),
            listener,
            address,
        })
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    /// Waits for the injected agent to dial back and complete its handshake.
    ///
    /// Validates the protocol version and the channel token. Fails if the
    /// host process dies first, or nothing connects within `timeout`.
    pub async fn accept_agent(
        &mut self,
        timeout: Duration,
        host_died: impl Future<Output = ()>,
    ) -> Result<(AgentSpawnedMessage, HostChannel), AcceptError> {
        let start = Instant::now();

        let (hello, conn) = tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                tracing::error!(channel = %self.name, ?timeout, elapsed = ?start.elapsed(), "timeout waiting for agent");
                return Err(AcceptError::Timeout);
            }

            _ = host_died => {
                return Err(AcceptError::HostDied);
            }

            accepted = self.listener.accept() => {
                let (mut conn, _) = accepted?;

                // Control messages should go out as soon as they are written;
                // this is a local channel, packet coalescing buys nothing.
                conn.set_nodelay(true)?;

                let hello: AgentSpawnedMessage = net_protocol::async_read(&mut conn).await?;
                (hello, conn)
            }
        };

        if hello.protocol_version.get_supported_witness().is_none() {
            return Err(AcceptError::NotCompatible);
        }
        if hello.token != self.address.token {
            tracing::error!(channel = %self.name, "agent connected with a foreign channel token");
            return Err(AcceptError::TokenMismatch);
        }

        Ok((hello, HostChannel { conn }))
    }
}

/// The remote agent proxy: one request in flight at a time, answered over a
/// dedicated stream.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    /// Liveness probe validating a freshly (re)connected channel.
    async fn ping(&mut self) -> Result<(), ChannelError>;

    /// Ships one test case for remote execution, relaying streamed lifecycle
    /// events into `bus`, and returns the agent's flat result.
    async fn run(
        &mut self,
        descriptor: &TestCaseDescriptor,
        bus: SharedBus,
    ) -> Result<RunResult, ChannelError>;

    /// Asks the agent to tear down and stop serving.
    async fn dispose(&mut self) -> Result<(), ChannelError>;
}

#[derive(Debug)]
pub struct HostChannel {
    conn: TcpStream,
}

impl HostChannel {
    async fn request(&mut self, request: &AgentRequest) -> Result<(), ChannelError> {
        net_protocol::async_write(&mut self.conn, request)
            .await
            .map_err(ChannelError::from)
    }

    async fn reply(&mut self) -> Result<AgentReply, ChannelError> {
        net_protocol::async_read(&mut self.conn)
            .await
            .map_err(ChannelError::from)
    }
}

#[async_trait]
impl AgentChannel for HostChannel {
    async fn ping(&mut self) -> Result<(), ChannelError> {
        self.request(&AgentRequest::Ping).await?;
        match self.reply().await? {
            AgentReply::Pong => Ok(()),
            _ => Err(ChannelError::UnexpectedReply),
        }
    }

    async fn run(
        &mut self,
        descriptor: &TestCaseDescriptor,
        bus: SharedBus,
    ) -> Result<RunResult, ChannelError> {
        self.request(&AgentRequest::Run(Box::new(descriptor.clone())))
            .await?;

        loop {
            match self.reply().await? {
                AgentReply::Event(message) => bus.publish(message).await,
                AgentReply::RunComplete(result) => return Ok(*result),
                _ => return Err(ChannelError::UnexpectedReply),
            }
        }
    }

    async fn dispose(&mut self) -> Result<(), ChannelError> {
        self.request(&AgentRequest::Dispose).await?;
        loop {
            match self.reply().await? {
                AgentReply::Disposed => return Ok(()),
                // Stray replies from an interrupted run may still be queued
                // ahead of the acknowledgement.
                _ => continue,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use hostrun_utils::net_protocol::{
        self,
        agent::{AgentProtocolVersion, AgentSpawnedMessage, HostSpecification},
    };
    use tokio::net::TcpStream;
    use tokio::time::sleep;

    use crate::bus::CollectingBus;
    use crate::bus::SharedBus;

    use super::{AcceptError, AgentChannel, ChannelTransport};

    fn hello(token: &str, version: AgentProtocolVersion) -> AgentSpawnedMessage {
        AgentSpawnedMessage {
            protocol_version: version,
            token: token.to_string(),
            host: HostSpecification {
                version: "17.2".to_string(),
                profile: "Exp".to_string(),
                pid: 1234,
            },
        }
    }

    #[tokio::test]
    async fn accepts_a_valid_handshake() {
        let mut transport = ChannelTransport::create("17.2/Exp").await.unwrap();
        let address = transport.address().clone();

        let agent = async {
            let mut conn = TcpStream::connect(address.addr).await.unwrap();
            let msg = hello(&address.token, AgentProtocolVersion::V0_1);
            net_protocol::async_write(&mut conn, &msg).await.unwrap();
            conn
        };

        let accept = transport.accept_agent(Duration::from_secs(1), sleep(Duration::MAX));

        let (_conn, result) = tokio::join!(agent, accept);
        let (hello, _channel) = result.unwrap();
        assert_eq!(hello.host.pid, 1234);
    }

    #[tokio::test]
    async fn rejects_a_foreign_token() {
        let mut transport = ChannelTransport::create("17.2/Exp").await.unwrap();
        let address = transport.address().clone();

        let agent = async {
            let mut conn = TcpStream::connect(address.addr).await.unwrap();
            let msg = hello("not-the-right-token", AgentProtocolVersion::V0_1);
            net_protocol::async_write(&mut conn, &msg).await.unwrap();
            conn
        };

        let accept = transport.accept_agent(Duration::from_secs(1), sleep(Duration::MAX));

        let (_conn, result) = tokio::join!(agent, accept);
        assert!(matches!(result.unwrap_err(), AcceptError::TokenMismatch));
    }

    #[tokio::test]
    async fn rejects_an_incompatible_protocol() {
        let mut transport = ChannelTransport::create("17.2/Exp").await.unwrap();
        let address = transport.address().clone();

        let agent = async {
            let mut conn = TcpStream::connect(address.addr).await.unwrap();
            let msg = hello(
                &address.token,
                AgentProtocolVersion {
                    major: 999123123,
                    minor: 12312342,
                },
            );
            net_protocol::async_write(&mut conn, &msg).await.unwrap();
            conn
        };

        let accept = transport.accept_agent(Duration::from_secs(1), sleep(Duration::MAX));

        let (_conn, result) = tokio::join!(agent, accept);
        assert!(matches!(result.unwrap_err(), AcceptError::NotCompatible));
    }

    #[tokio::test]
    async fn times_out_when_nothing_dials() {
        let mut transport = ChannelTransport::create("17.2/Exp").await.unwrap();

        let result = transport
            .accept_agent(Duration::from_millis(10), sleep(Duration::MAX))
            .await;

        assert!(matches!(result.unwrap_err(), AcceptError::Timeout));
    }

    #[tokio::test]
    async fn reports_host_death() {
        let mut transport = ChannelTransport::create("17.2/Exp").await.unwrap();

        let result = transport
            .accept_agent(Duration::from_secs(1), sleep(Duration::ZERO))
            .await;

        assert!(matches!(result.unwrap_err(), AcceptError::HostDied));
    }

    #[tokio::test]
    async fn dropped_connection_is_an_io_error() {
        let mut transport = ChannelTransport::create("17.2/Exp").await.unwrap();
        let address = transport.address().clone();

        let agent = async {
            let conn = TcpStream::connect(address.addr).await.unwrap();
            drop(conn);
        };

        let accept = transport.accept_agent(Duration::from_secs(1), sleep(Duration::MAX));

        let ((), result) = tokio::join!(agent, accept);
        assert!(matches!(result.unwrap_err(), AcceptError::Io(_)));
    }

    #[tokio::test]
    async fn lost_channel_surfaces_as_connection_lost() {
        let mut transport = ChannelTransport::create("17.2/Exp").await.unwrap();
        let address = transport.address().clone();

        let agent = async {
            let mut conn = TcpStream::connect(address.addr).await.unwrap();
            let msg = hello(&address.token, AgentProtocolVersion::V0_1);
            net_protocol::async_write(&mut conn, &msg).await.unwrap();
            conn
        };

        let accept = transport.accept_agent(Duration::from_secs(1), sleep(Duration::MAX));
        let (conn, result) = tokio::join!(agent, accept);
        let (_, mut channel) = result.unwrap();

        // The agent goes away without answering anything.
        drop(conn);

        let bus: SharedBus = Arc::new(CollectingBus::new());
        let descriptor = crate::test_support::descriptor("suite", "test", Default::default());
        let err = channel.run(&descriptor, bus).await.unwrap_err();
        assert!(matches!(err, super::ChannelError::ConnectionLost(_)));
    }
}
