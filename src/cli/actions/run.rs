use crate::agent::new;
use crate::cli::actions::Action;
use anyhow::Result;

/// Handle the run action
///
/// # Errors
///
/// Returns an error if the agent fails to start
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Run {
            port,
            listen,
            dsn,
            options,
        } => {
            new(port, listen, dsn, options).await?;
        }
    }

    Ok(())
}
