use aws_config::{meta::region::RegionProviderChain, BehaviorVersion, Region, SdkConfig};
use log::info;

pub mod cloudwatch;
pub mod config;
pub mod cron;
pub mod ec2;
pub mod errors;
pub mod sns;
pub mod ssh;
pub mod state;

/// Loads an AWS config from default environments.
pub async fn load_config(reg: Option<String>) -> SdkConfig {
    info!("loading AWS configuration for region {:?}", reg);
    let regp = RegionProviderChain::first_try(reg.map(Region::new))
        .or_default_provider()
        .or_else(Region::new("us-west-2"));

    aws_config::defaults(BehaviorVersion::latest())
        .region(regp)
        .load()
        .await
}
