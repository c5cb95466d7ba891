//! AWS-related code shared by different modules.

use aws_config::BehaviorVersion;

use crate::prelude::*;

/// Load the user's AWS configuration using standard conventions.
///
/// Region and credentials come from the usual environment variables, profile
/// files or the task role when running in a container.
#[instrument(level = "debug")]
pub async fn load_aws_config() -> Result<aws_config::SdkConfig> {
    let config = aws_config::load_defaults(BehaviorVersion::v2025_01_17()).await;
    debug!(region = ?config.region(), "Loaded AWS configuration");
    Ok(config)
}
