//! Flow worker process
//!
//! Hosts exactly one flow on behalf of a controller. Protocol messages are
//! JSON lines on stdin/stdout; logs go to stderr so they never corrupt the
//! protocol stream. Exits non-zero when the flow failed.

use flow_engine::supervision::{Worker, WorkerExit};
use flow_engine::NodeRegistry;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .target(env_logger::Target::Stderr)
        .init();

    log::info!("Flow worker starting (pid {})", std::process::id());

    let (worker, outbound) = Worker::new(NodeRegistry::with_builtins());
    let exit = worker
        .serve(tokio::io::stdin(), tokio::io::stdout(), outbound)
        .await;

    match exit {
        WorkerExit::Clean => log::info!("Flow worker finished"),
        WorkerExit::Failed(reason) => {
            log::error!("Flow worker failed: {}", reason);
            std::process::exit(1);
        }
    }
}
