//! The execution agent injected into a host application process.
//!
//! Once bootstrapped, the agent dials the orchestrator's channel (address
//! taken from the launch environment), announces itself, and serves requests
//! one at a time: liveness pings, single test-case executions, and a final
//! disposal. A second concurrent `Run` is a contract violation by the caller
//! and is not guarded here.

use std::io;
use std::time::Duration;

use hostrun_utils::net_protocol::{
    self,
    agent::{
        AgentProtocolVersion, AgentReply, AgentRequest, AgentSpawnedMessage, HostSpecification,
        HOSTRUN_CHANNEL, HOSTRUN_CHANNEL_TOKEN,
    },
    descriptor::TestCaseDescriptor,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub mod dispatcher;
pub mod execute;
pub mod fixtures;
pub mod log;
pub mod registry;
pub mod trace;

use dispatcher::UiDispatcher;
use execute::ExecutionEnv;
use fixtures::FixtureRegistry;
use registry::TestRegistry;
use trace::TraceBuffer;

pub struct AgentConfig {
    pub channel_addr: String,
    pub token: String,
    pub host: HostSpecification,
    /// Upper bound on UI-thread waits; [None] leaves them cooperative.
    pub ui_wait_bound: Option<Duration>,
}

impl AgentConfig {
    /// Reads the channel contract from the environment the host was launched
    /// with.
    pub fn from_env(version: impl Into<String>, profile: impl Into<String>) -> io::Result<Self> {
        let channel_addr = std::env::var(HOSTRUN_CHANNEL).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{HOSTRUN_CHANNEL} is not set; was this process launched by hostrun?"),
            )
        })?;
        let token = std::env::var(HOSTRUN_CHANNEL_TOKEN).unwrap_or_default();

        Ok(Self {
            channel_addr,
            token,
            host: HostSpecification {
                version: version.into(),
                profile: profile.into(),
                pid: std::process::id(),
            },
            ui_wait_bound: None,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum AgentState {
    Created,
    Listening,
    Stopped,
}

pub struct RemoteExecutionAgent {
    config: AgentConfig,
    registry: TestRegistry,
    fixtures: FixtureRegistry,
    dispatcher: UiDispatcher,
    trace: TraceBuffer,
    state: AgentState,
}

impl RemoteExecutionAgent {
    pub fn new(config: AgentConfig, registry: TestRegistry) -> Self {
        Self {
            config,
            registry,
            fixtures: FixtureRegistry::new(),
            dispatcher: UiDispatcher::new(),
            trace: TraceBuffer::new(),
            state: AgentState::Created,
        }
    }

    /// The fixture registry, for the bootstrap to register factories on.
    pub fn fixtures(&self) -> &FixtureRegistry {
        &self.fixtures
    }

    /// Dials the orchestrator and serves requests until disposed or the
    /// channel is lost.
    pub async fn serve(mut self) -> io::Result<()> {
        hostrun_utils::log_assert!(
            self.state == AgentState::Created,
            "serve called on a non-fresh agent"
        );

        let mut conn = TcpStream::connect(&self.config.channel_addr).await?;
        // Requests and replies are small control messages; flush them as soon
        // as they are written.
        conn.set_nodelay(true)?;

        let hello = AgentSpawnedMessage {
            protocol_version: AgentProtocolVersion::V0_1,
            token: self.config.token.clone(),
            host: self.config.host.clone(),
        };
        net_protocol::async_write(&mut conn, &hello).await?;

        self.state = AgentState::Listening;
        tracing::info!(
            version = %self.config.host.version,
            profile = %self.config.host.profile,
            "agent connected to orchestrator"
        );

        loop {
            let request: AgentRequest = match net_protocol::async_read(&mut conn).await {
                Ok(request) => request,
                Err(e) => {
                    // The orchestrator is gone; there is nobody left to run
                    // tests for. Clean up and bow out.
                    tracing::warn!(error = %e, "channel to orchestrator lost");
                    self.dispose().await;
                    return Ok(());
                }
            };

            match request {
                AgentRequest::Ping => {
                    net_protocol::async_write(&mut conn, &AgentReply::Pong).await?;
                }
                AgentRequest::Run(descriptor) => {
                    self.handle_run(&mut conn, &descriptor).await?;
                }
                AgentRequest::Dispose => {
                    self.dispose().await;
                    let _ = net_protocol::async_write(&mut conn, &AgentReply::Disposed).await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_run(
        &mut self,
        conn: &mut TcpStream,
        descriptor: &TestCaseDescriptor,
    ) -> io::Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let env = ExecutionEnv {
            registry: &self.registry,
            fixtures: &self.fixtures,
            dispatcher: &self.dispatcher,
            trace: &self.trace,
            ui_wait_bound: self.config.ui_wait_bound,
        };
        let run = execute::run_one(env, descriptor, &events_tx);
        tokio::pin!(run);

        // Stream lifecycle events as they are produced; the final result
        // closes the exchange.
        let result = loop {
            tokio::select! {
                biased;

                Some(event) = events_rx.recv() => {
                    net_protocol::async_write(conn, &AgentReply::Event(event)).await?;
                }
                result = &mut run => break result,
            }
        };

        // The run is over, so nothing sends any more; flush what is queued.
        while let Ok(event) = events_rx.try_recv() {
            net_protocol::async_write(conn, &AgentReply::Event(event)).await?;
        }

        net_protocol::async_write(conn, &AgentReply::RunComplete(Box::new(result))).await
    }

    /// Tears down every cached fixture and clears listeners. Idempotent;
    /// never fails.
    pub async fn dispose(&mut self) {
        if self.state == AgentState::Stopped {
            return;
        }
        self.state = AgentState::Stopped;

        for error in self.fixtures.dispose_all().await {
            tracing::warn!(%error, "fixture teardown failed during agent disposal");
        }
        self.trace.drain();

        tracing::info!("agent disposed");
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use futures::FutureExt;
    use hostrun_utils::net_protocol::{
        self,
        agent::{AgentReply, AgentRequest, AgentSpawnedMessage, HostSpecification},
        descriptor::{MethodRef, TestCaseDescriptor, TestFlags},
    };

    use crate::registry::{TestOutcome, TestRegistry};

    use super::{AgentConfig, RemoteExecutionAgent};

    fn test_agent(addr: String, registry: TestRegistry) -> RemoteExecutionAgent {
        let config = AgentConfig {
            channel_addr: addr,
            token: "secret-token".to_string(),
            host: HostSpecification {
                version: "17.2".to_string(),
                profile: "Exp".to_string(),
                pid: std::process::id(),
            },
            ui_wait_bound: None,
        };
        RemoteExecutionAgent::new(config, registry)
    }

    #[tokio::test]
    #[ntest::timeout(60000)]
    async fn serves_ping_run_dispose() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut registry = TestRegistry::new();
        registry.test("suite", "passes", |_ctx| {
            async { TestOutcome::Passed }.boxed()
        });

        let agent = test_agent(addr, registry);
        let serve = tokio::spawn(agent.serve());

        let (mut conn, _) = listener.accept().await.unwrap();

        let hello: AgentSpawnedMessage = net_protocol::async_read(&mut conn).await.unwrap();
        assert_eq!(hello.token, "secret-token");
        assert_eq!(hello.host.version, "17.2");

        net_protocol::async_write(&mut conn, &AgentRequest::Ping)
            .await
            .unwrap();
        let reply: AgentReply = net_protocol::async_read(&mut conn).await.unwrap();
        assert!(matches!(reply, AgentReply::Pong));

        let descriptor = TestCaseDescriptor::new(
            MethodRef::new("suite", "passes"),
            "17.2",
            "Exp",
            Duration::from_secs(30),
            TestFlags::default(),
            vec![],
        );
        net_protocol::async_write(&mut conn, &AgentRequest::Run(Box::new(descriptor)))
            .await
            .unwrap();

        let mut events = 0;
        let result = loop {
            let reply: AgentReply = net_protocol::async_read(&mut conn).await.unwrap();
            match reply {
                AgentReply::Event(_) => events += 1,
                AgentReply::RunComplete(result) => break result,
                other => panic!("unexpected reply {other:?}"),
            }
        };
        assert_eq!(events, 3);
        assert_eq!((result.total, result.failed, result.skipped), (1, 0, 0));

        net_protocol::async_write(&mut conn, &AgentRequest::Dispose)
            .await
            .unwrap();
        let reply: AgentReply = net_protocol::async_read(&mut conn).await.unwrap();
        assert!(matches!(reply, AgentReply::Disposed));

        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    #[ntest::timeout(60000)]
    async fn lost_orchestrator_disposes_quietly() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let agent = test_agent(addr, TestRegistry::new());
        let serve = tokio::spawn(agent.serve());

        let (mut conn, _) = listener.accept().await.unwrap();
        let _hello: AgentSpawnedMessage = net_protocol::async_read(&mut conn).await.unwrap();
        drop(conn);

        // The agent treats a dead channel as a request to shut down.
        serve.await.unwrap().unwrap();
    }
}
