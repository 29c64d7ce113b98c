use std::{env, io};

use chrono::Local;
use clap::{Arg, Command};
use webup_ops::{config::Config, cron};

pub const NAME: &str = "schedule-teardown";

pub fn command() -> Command {
    Command::new(NAME)
        .about("Registers a cron job that destroys the infrastructure after the configured delay")
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
    let hours = cfg.u64_or("AUTO_TEARDOWN_HOURS", 2)?;
    let when = Local::now() + chrono::Duration::hours(hours as i64);

    let cwd = env::current_dir()?;
    let exe = env::current_exe()?;
    let destroy_cmd = format!(
        "cd {} && {} destroy --config-file-path {} --skip-prompt >> {}/teardown.log 2>&1",
        cwd.display(),
        exe.display(),
        config_file_path,
        cwd.display()
    );

    cron::schedule(&when, &destroy_cmd)?;

    println!(
        "Auto teardown scheduled at {}",
        when.format("%Y-%m-%d %H:%M")
    );
    Ok(())
}
