use std::{
    fs,
    io::{self, stdout},
    path::Path,
};

use clap::{Arg, Command};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use dialoguer::{theme::ColorfulTheme, Select};
use tokio::time::Duration;
use webup_ops::{cloudwatch, config::Config, ec2, state::Store};

pub const NAME: &str = "destroy";

pub fn command() -> Command {
    Command::new(NAME)
        .about("Terminates the recorded instances and deletes the provisioned resources")
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
        .arg(
            Arg::new("SKIP_PROMPT")
                .long("skip-prompt")
                .short('s')
                .help("Skips prompt mode")
                .required(false)
                .num_args(0),
        )
}

const MAX_WAIT_SECONDS: u64 = 10 * 60;

pub async fn execute(log_level: &str, config_file_path: &str, skip_prompt: bool) -> io::Result<()> {
    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, log_level),
    );

    let cfg = Config::load(config_file_path)?;
    execute!(
        stdout(),
        SetForegroundColor(Color::Blue),
        Print(format!("\nLoaded configuration: '{}'\n", config_file_path)),
        ResetColor
    )?;
    println!("{}\n", cfg.encode_json()?);

    if !skip_prompt {
        let options = &[
            "No, I am not ready to delete resources.",
            "Yes, let's delete resources.",
        ];
        let selected = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select your 'destroy' option")
            .items(&options[..])
            .default(0)
            .interact()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("prompt failed {}", e)))?;
        if selected == 0 {
            return Ok(());
        }
    }

    let region = cfg.required("REGION")?;
    let shared_config = webup_ops::load_config(Some(region)).await;
    let store = Store::new(".");
    let sink = cloudwatch::Sink::new(&shared_config, &cfg, &store).await?;
    let ec2_manager = ec2::Manager::new(&shared_config);

    sink.log("Destroying infrastructure").await?;

    // terminate everything recorded across create and scale as one batch
    let recs = store.read_instances()?;
    if !recs.is_empty() {
        let ids: Vec<String> = recs.iter().map(|r| r.instance_id.clone()).collect();
        ec2_manager.terminate_instances(&ids).await?;
        ec2_manager
            .poll_until_terminated(&ids, Duration::from_secs(MAX_WAIT_SECONDS))
            .await?;
        sink.log(&format!("Terminated instances: {:?}", ids)).await?;
    }

    // the three deletions below are each downgraded to logged-and-continue
    // so a partial teardown still attempts every remaining deletion
    let key_name = cfg.required("KEY_NAME")?;
    let key_file = cfg.required("KEY_FILE")?;
    match ec2_manager.delete_key_pair(&key_name).await {
        Ok(_) => {
            if Path::new(&key_file).exists() {
                let _ = fs::remove_file(&key_file);
            }
            sink.log(&format!("Deleted key pair: {}", key_name)).await?;
        }
        Err(e) => {
            sink.log(&format!("Key pair deletion error: {}", e.message()))
                .await?;
        }
    }

    let sg_name = cfg.required("SECURITY_GROUP_NAME")?;
    match ec2_manager.find_security_group(&sg_name).await {
        Ok(Some(sg_id)) => match ec2_manager.delete_security_group(&sg_id).await {
            Ok(_) => {
                sink.log(&format!("Deleted security group: {}", sg_id))
                    .await?;
            }
            Err(e) => {
                sink.log(&format!("Security group deletion error: {}", e.message()))
                    .await?;
            }
        },
        Ok(None) => {
            sink.log(&format!("Security group '{}' not found, skipping", sg_name))
                .await?;
        }
        Err(e) => {
            sink.log(&format!("Security group deletion error: {}", e.message()))
                .await?;
        }
    }

    if let Some(vpc_id) = store.read_vpc_id()? {
        match ec2_manager.delete_vpc(&vpc_id).await {
            Ok(_) => {
                sink.log(&format!("Deleted VPC: {}", vpc_id)).await?;
            }
            Err(e) => {
                sink.log(&format!("VPC deletion error: {}", e.message()))
                    .await?;
            }
        }
    }

    // local bookkeeping goes away regardless of what the provider said
    store.remove_artifacts();

    sink.log("Infrastructure destroyed").await?;
    sink.record(1.0).await?;

    println!("Destroy complete.");
    Ok(())
}
