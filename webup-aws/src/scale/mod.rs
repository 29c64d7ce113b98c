use std::io::{self, Error, ErrorKind};

use clap::{Arg, Command};
use tokio::time::Duration;
use webup_ops::{
    cloudwatch,
    config::Config,
    ec2::{self, LaunchSpec},
    state::{InstanceRecord, Store},
};

pub const NAME: &str = "scale";

pub fn command() -> Command {
    Command::new(NAME)
        .about("Launches one extra instance and appends it to the recorded fleet")
        .arg(
            Arg::new("LOG_LEVEL")
                .long("log-level")
                .short('l')
                .help("Sets the log level")
                .required(false)
                .num_args(1)
                .value_parser(["debug", "info"])
                .default_value("info"),
        )
        .arg(
            Arg::new("CONFIG_FILE_PATH")
                .long("config-file-path")
                .short('c')
                .help("The configuration file to load")
                .required(true)
                .num_args(1),
        )
}

const MAX_WAIT_SECONDS: u64 = 10 * 60;

pub async fn execute(log_level: &str, config_file_path: &str) -> io::Result<()> {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, log_level),
    );

    let cfg = Config::load(config_file_path)?;
    let region = cfg.required("REGION")?;
    let shared_config = webup_ops::load_config(Some(region)).await;
    let store = Store::new(".");
    let sink = cloudwatch::Sink::new(&shared_config, &cfg, &store).await?;
    let ec2_manager = ec2::Manager::new(&shared_config);

    sink.log("Scaling infrastructure: launching 1 extra instance")
        .await?;

    // the lookups are repeated on purpose: scale runs independently of
    // create and resolves AMI, subnet and security group from the current
    // configuration
    let ami_id = ec2_manager
        .find_latest_image(&cfg.required("UBUNTU_OWNER")?, &cfg.required("UBUNTU_FILTER")?)
        .await?;
    let subnet_id = ec2_manager
        .find_subnet_by_cidr(&cfg.required("SUBNET_CIDR_1")?)
        .await?;
    let sg_name = cfg.required("SECURITY_GROUP_NAME")?;
    let sg_id = ec2_manager
        .find_security_group(&sg_name)
        .await?
        .ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("security group '{}' not found", sg_name),
            )
        })?;

    let instance_id = ec2_manager
        .launch_instance(&LaunchSpec {
            image_id: ami_id,
            instance_type: cfg.required("INSTANCE_TYPE")?,
            key_name: cfg.required("KEY_NAME")?,
            security_group_id: sg_id,
            subnet_id,
            associate_public_ip: true,
        })
        .await?;
    ec2_manager
        .poll_until_running(
            &[instance_id.clone()],
            Duration::from_secs(MAX_WAIT_SECONDS),
        )
        .await?;
    let public_ip = ec2_manager.fetch_public_ip(&instance_id).await?;

    store.append_instance(&InstanceRecord {
        instance_id: instance_id.clone(),
        public_ip: public_ip.clone(),
    })?;

    sink.log(&format!(
        "Scaled: new instance {} ({})",
        instance_id, public_ip
    ))
    .await?;
    sink.record(1.0).await?;

    println!(
        "Scaling complete. New instance: {} {}",
        instance_id, public_ip
    );
    Ok(())
}
