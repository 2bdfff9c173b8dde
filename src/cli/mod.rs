pub mod actions;
pub mod commands;
pub mod dispatch;
pub mod telemetry;

use anyhow::Result;

/// Parse arguments, install telemetry and build the action to run.
///
/// # Errors
///
/// Returns an error if telemetry cannot be initialized or the arguments are invalid
pub fn start() -> Result<(actions::Action, telemetry::Telemetry)> {
    let matches = commands::new().get_matches();

    let level = telemetry::verbosity_level(matches.get_count("verbose"));
    let telemetry = telemetry::init(
        level,
        matches.get_one::<String>("otel-endpoint").map(String::as_str),
    )?;

    match dispatch::handler(&matches) {
        Ok(action) => Ok((action, telemetry)),
        Err(e) => {
            telemetry.shutdown();
            Err(e)
        }
    }
}
