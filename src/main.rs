use anyhow::Result;
use qan_agent::cli::{self, actions::run};

#[tokio::main]
async fn main() -> Result<()> {
    let (action, telemetry) = cli::start()?;

    let result = run::handle(action).await;

    telemetry.shutdown();
    result
}
