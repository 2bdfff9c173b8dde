pub mod run;

use crate::agent::AgentOptions;
use secrecy::SecretString;

#[derive(Debug)]
pub enum Action {
    Run {
        port: u16,
        listen: Option<String>,
        dsn: Vec<SecretString>,
        options: AgentOptions,
    },
}
