use crate::cli::{actions::Action, commands, dispatch, telemetry};
use anyhow::Result;

/// Parse the command line, bring up logging, and hand the binary the
/// action to run.
///
/// # Errors
///
/// Fails when telemetry cannot be initialized or the arguments are
/// missing or inconsistent.
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    telemetry::init(commands::verbosity(&matches))?;

    dispatch::handler(&matches)
}
