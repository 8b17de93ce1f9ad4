use axum::async_trait;
use tracing::info;

/// Out-of-band mail delivery. Verification and reset links go through this
/// seam; the default implementation just logs, real delivery is deployment
/// configuration.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Development mailer: the log line *is* the delivery channel.
#[derive(Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        info!(%to, %subject, %body, "mail dispatched (log mailer)");
        Ok(())
    }
}
