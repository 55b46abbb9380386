use crate::api;
use crate::cli::actions::Action;
use crate::quota::LockConfig;
use anyhow::Result;
use url::Url;

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Server {
            port,
            dsn,
            lock_ttl,
            lock_max_wait,
            invitation_expiry,
        } => {
            // Fail early on a malformed DSN instead of inside the pool
            let dsn = Url::parse(&dsn)?;

            let lock_config = LockConfig {
                ttl: lock_ttl,
                max_wait: lock_max_wait,
                ..LockConfig::default()
            };

            api::new(port, dsn.to_string(), lock_config, invitation_expiry).await?;
        }
    }

    Ok(())
}
