//! A scripted stand-in for a large interactive host application.
//!
//! The simulator honors the full launch contract (profile flag, channel
//! environment, ready-file signalling) and then serves the agent protocol
//! with behaviors scripted through a plan file, so orchestration can be
//! exercised end-to-end against real child processes.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::FutureExt;
use hostrun_agent::registry::{TestOutcome, TestRegistry};
use hostrun_agent::{AgentConfig, RemoteExecutionAgent};
use hostrun_utils::net_protocol::agent::HOSTRUN_READY_FILE;
use hostrun_utils::net_protocol::results::ExceptionInfo;
use serde_derive::{Deserialize, Serialize};

/// Environment variable naming the plan file to load.
pub static HOSTRUN_SIM_PLAN: &str = "HOSTRUN_SIM_PLAN";
/// Environment variable naming the version this instance claims to be.
pub static HOSTRUN_SIM_VERSION: &str = "HOSTRUN_SIM_VERSION";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum SimBehavior {
    Pass {
        #[serde(default)]
        sleep_ms: u64,
        #[serde(default)]
        trace: Option<String>,
    },
    Fail {
        message: String,
    },
    /// Fails once per marker file, then passes: the first host session that
    /// runs this test creates the marker and fails; any later session passes.
    FailOnFirstSession {
        marker: PathBuf,
    },
    Sleep {
        ms: u64,
    },
    /// Hard process death mid-run.
    Exit {
        code: i32,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SimTest {
    pub suite: String,
    pub name: String,
    pub behavior: SimBehavior,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SimulatorPlan {
    /// Simulated interactive startup time before the ready signal.
    #[serde(default)]
    pub init_delay_ms: u64,
    #[serde(default)]
    pub tests: Vec<SimTest>,
}

impl SimulatorPlan {
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn load_from_env() -> io::Result<Self> {
        match std::env::var(HOSTRUN_SIM_PLAN) {
            Ok(path) => Self::load(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }
}

pub fn registry_from_plan(plan: &SimulatorPlan) -> TestRegistry {
    let mut registry = TestRegistry::new();

    for test in &plan.tests {
        let behavior = test.behavior.clone();
        registry.test(&test.suite, &test.name, move |ctx| {
            let behavior = behavior.clone();
            async move {
                match behavior {
                    SimBehavior::Pass { sleep_ms, trace } => {
                        if sleep_ms > 0 {
                            // Plain blocking sleep: the simulated work must
                            // not depend on a timer reactor, since UI-thread
                            // dispatch drives this future off the runtime.
                            std::thread::sleep(Duration::from_millis(sleep_ms));
                        }
                        if let Some(line) = trace {
                            ctx.trace.write_line(&line);
                        }
                        TestOutcome::Passed
                    }
                    SimBehavior::Fail { message } => {
                        TestOutcome::Failed(ExceptionInfo::new("simulated", message))
                    }
                    SimBehavior::FailOnFirstSession { marker } => {
                        if marker.exists() {
                            TestOutcome::Passed
                        } else {
                            if let Err(e) = std::fs::write(&marker, b"failed-once") {
                                return TestOutcome::Failed(ExceptionInfo::new(
                                    "simulated",
                                    format!("could not create marker: {e}"),
                                ));
                            }
                            TestOutcome::Failed(ExceptionInfo::new(
                                "simulated",
                                "first session always fails",
                            ))
                        }
                    }
                    SimBehavior::Sleep { ms } => {
                        std::thread::sleep(Duration::from_millis(ms));
                        TestOutcome::Passed
                    }
                    SimBehavior::Exit { code } => std::process::exit(code),
                }
            }
            .boxed()
        });
    }

    registry
}

/// Entry point of the simulated host: honor the launch contract, then serve
/// the agent protocol until disposed.
pub async fn run_simulated_host(profile: String) -> anyhow::Result<()> {
    let plan = SimulatorPlan::load_from_env()?;
    let version =
        std::env::var(HOSTRUN_SIM_VERSION).unwrap_or_else(|_| "0.0".to_string());

    // Simulated interactive startup, then the ready signal.
    if plan.init_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(plan.init_delay_ms)).await;
    }
    if let Ok(ready_file) = std::env::var(HOSTRUN_READY_FILE) {
        std::fs::write(ready_file, b"ready")?;
    }

    let config = AgentConfig::from_env(version, profile)?;
    tracing::info!(
        version = %config.host.version,
        profile = %config.host.profile,
        tests = plan.tests.len(),
        "simulated host ready"
    );

    let agent = RemoteExecutionAgent::new(config, registry_from_plan(&plan));
    agent.serve().await?;
    Ok(())
}
