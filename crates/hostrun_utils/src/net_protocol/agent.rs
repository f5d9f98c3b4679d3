//! The wire interface between the orchestrator and the agent injected into a
//! host process.
//!
//! The launched host receives the channel address through environment
//! variables; the injected agent dials back and opens the conversation with a
//! spawn handshake. After the handshake, the orchestrator drives the
//! conversation: it sends exactly one [AgentRequest] at a time, and the agent
//! answers with one or more [AgentReply] values (a `Run` streams lifecycle
//! events before its final result).

use serde_derive::{Deserialize, Serialize};

use super::descriptor::TestCaseDescriptor;
use super::results::{RunResult, TestMessage};

/// Environment variable carrying the `ip:port` address the agent dials.
pub static HOSTRUN_CHANNEL: &str = "HOSTRUN_CHANNEL";
/// Environment variable carrying the channel token echoed in the handshake.
pub static HOSTRUN_CHANNEL_TOKEN: &str = "HOSTRUN_CHANNEL_TOKEN";
/// Environment variable naming the file the host touches once it is ready.
pub static HOSTRUN_READY_FILE: &str = "HOSTRUN_READY_FILE";
/// Environment variable naming a directory for the agent's in-host log file.
pub static HOSTRUN_AGENT_LOG: &str = "HOSTRUN_AGENT_LOG";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "type", rename = "hostrun_protocol_version")]
pub struct AgentProtocolVersion {
    pub major: u64,
    pub minor: u64,
}

impl AgentProtocolVersion {
    pub const V0_1: AgentProtocolVersion = AgentProtocolVersion { major: 0, minor: 1 };

    /// Checks whether the protocol version sent by an agent is supported by
    /// this orchestrator. If so, returns a [ProtocolWitness] for the
    /// negotiated version.
    pub fn get_supported_witness(&self) -> Option<ProtocolWitness> {
        use PrivProtocolWitness::*;

        if self == &Self::V0_1 {
            return Some(ProtocolWitness(V0_1));
        }
        None
    }
}

#[derive(Clone, Copy, Debug)]
enum PrivProtocolWitness {
    V0_1,
}

#[derive(Clone, Copy, Debug)]
pub struct ProtocolWitness(PrivProtocolWitness);

impl ProtocolWitness {
    pub const fn get_version(&self) -> AgentProtocolVersion {
        use PrivProtocolWitness::*;
        match self.0 {
            V0_1 => AgentProtocolVersion::V0_1,
        }
    }
}

/// What the agent knows about the host instance it is running inside.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostSpecification {
    pub version: String,
    pub profile: String,
    pub pid: u32,
}

/// First message on a freshly dialed channel, agent → orchestrator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AgentSpawnedMessage {
    pub protocol_version: AgentProtocolVersion,
    /// Echo of [HOSTRUN_CHANNEL_TOKEN]; lets the orchestrator reject a
    /// process dialing a channel it was not launched for.
    pub token: String,
    pub host: HostSpecification,
}

/// Requests the orchestrator sends over an established channel.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum AgentRequest {
    /// Liveness probe; answered immediately with [AgentReply::Pong], no side
    /// effects.
    Ping,
    /// Execute exactly one test case. The agent streams
    /// [AgentReply::Event] messages and terminates the exchange with
    /// [AgentReply::RunComplete].
    Run(Box<TestCaseDescriptor>),
    /// Tear down fixtures and listeners; the agent answers
    /// [AgentReply::Disposed] and stops serving.
    Dispose,
}

/// Replies the agent sends over an established channel.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum AgentReply {
    Pong,
    Event(TestMessage),
    RunComplete(Box<RunResult>),
    Disposed,
}
