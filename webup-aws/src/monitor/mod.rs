use std::io;

use clap::{Arg, Command};
use webup_ops::{cloudwatch, config::Config, sns, state::Store};

pub const NAME: &str = "monitor";

pub fn command() -> Command {
    Command::new(NAME)
        .about("Creates the notification topic, email subscription and threshold alarm")
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

    let sns_manager = sns::Manager::new(&shared_config);
    let cw_manager = cloudwatch::Manager::new(&shared_config);

    sink.log("Setting up the notification topic and alarm")
        .await?;

    // the topic/subscription calls are not idempotent; re-running this
    // workflow creates another subscription
    let topic_arn = sns_manager
        .create_topic(&cfg.required("SNS_TOPIC_NAME")?)
        .await?;
    sns_manager
        .subscribe_email(&topic_arn, &cfg.required("ALARM_EMAIL")?)
        .await?;
    sink.log(&format!(
        "SNS topic created: {}. Subscription pending confirmation (check your email).",
        topic_arn
    ))
    .await?;

    let alarm_name = cfg.required("ALARM_NAME")?;
    cw_manager
        .put_threshold_alarm(
            &alarm_name,
            &cfg.required("CW_METRIC_NAMESPACE")?,
            &cfg.required("CW_METRIC_NAME")?,
            &topic_arn,
        )
        .await?;
    sink.log(&format!("CloudWatch alarm created: {}", alarm_name))
        .await?;
    sink.record(1.0).await?;

    println!("Monitoring & alarm created. Check email to confirm the SNS subscription.");
    Ok(())
}
