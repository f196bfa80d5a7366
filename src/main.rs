use bili_harvester_lib::cli::parse_args;
use bili_harvester_lib::commands::{handle_shutdown_signals, run_harvest};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let args = parse_args();
    let shutdown_token = CancellationToken::new();
    tokio::spawn(handle_shutdown_signals(shutdown_token.clone()));

    let exit_code = run_harvest(args, shutdown_token).await;
    std::process::exit(exit_code);
}
