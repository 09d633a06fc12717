use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

/// Settings of a running operator, from flags or the environment.
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Port the admission webhook listens on.
    #[arg(long, env = "MO_WEBHOOK_PORT", default_value_t = 9443)]
    pub webhook_port: u16,

    /// Directory holding `tls.crt` and `tls.key` for the webhook.
    #[arg(
        long,
        env = "MO_WEBHOOK_CERT_DIR",
        default_value = "/tmp/k8s-webhook-server/serving-certs"
    )]
    pub webhook_cert_dir: PathBuf,

    #[arg(long, env = "MO_DISABLE_WEBHOOK", default_value_t = false)]
    pub disable_webhook: bool,

    /// Image repository used when a cluster does not name one.
    #[arg(
        long,
        env = "MO_DEFAULT_IMAGE_REPOSITORY",
        default_value = "matrixorigin/matrixone"
    )]
    pub default_image_repository: String,

    #[arg(long, env = "MO_BACKUP_POLL_INTERVAL_SECS", default_value_t = 15)]
    pub backup_poll_interval_secs: u64,

    /// Period of the unconditional resync of every object.
    #[arg(long, env = "MO_RESYNC_INTERVAL_SECS", default_value_t = 300)]
    pub resync_interval_secs: u64,
}

impl OperatorConfig {
    pub fn backup_poll_interval(&self) -> Duration {
        Duration::from_secs(self.backup_poll_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            webhook_port: 9443,
            webhook_cert_dir: PathBuf::from("/tmp/k8s-webhook-server/serving-certs"),
            disable_webhook: false,
            default_image_repository: "matrixorigin/matrixone".to_string(),
            backup_poll_interval_secs: 15,
            resync_interval_secs: 300,
        }
    }
}
