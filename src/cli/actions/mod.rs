pub mod server;

use std::time::Duration;

/// What the CLI resolved to run.
#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        dsn: String,
        lock_ttl: Duration,
        lock_max_wait: Duration,
        invitation_expiry: Duration,
    },
}
