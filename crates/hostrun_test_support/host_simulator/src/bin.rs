use clap::Parser;
use hostrun_utils::exit::ExitCode;

/// Simulated host application honoring the hostrun launch contract.
#[derive(Parser)]
struct Cli {
    /// Isolation profile to run under.
    #[clap(long, default_value = "")]
    profile: String,
}

fn main() {
    let _log_guard = hostrun_agent::log::init_from_env();
    let cli = Cli::parse();

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::from)
        .and_then(|rt| rt.block_on(hostrun_host_simulator::run_simulated_host(cli.profile)));

    if let Err(error) = result {
        eprintln!("simulated host failed: {error}");
        std::process::exit(ExitCode::HOSTRUN_ERROR.get());
    }
}
