use std::{io, thread, time::Duration};

use clap::{Arg, Command};
use webup_ops::{cloudwatch, config::Config, ssh, state::Store};

pub const NAME: &str = "deploy";

/// The fixed remote setup sequence, in order.
const REMOTE_COMMANDS: [&str; 4] = [
    "sudo apt update -y",
    "sudo apt install -y nginx",
    "sudo systemctl enable nginx",
    "sudo systemctl start nginx",
];

pub fn command() -> Command {
    Command::new(NAME)
        .about("Installs and starts the web server on the first recorded instance")
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

    sink.log("Deploying the web server").await?;

    let ip = store.read_primary_ip()?;
    let timeout = cfg.u64_or("SSH_WAIT_TIMEOUT_SECS", 300)?;
    println!("Waiting for SSH on {}", ip);
    ssh::wait_for_port(&ip, 22, Duration::from_secs(timeout))?;

    let key_file = cfg.required("KEY_FILE")?;
    let user = cfg.get_or("SSH_USER", "ubuntu");
    let session = ssh::Session::connect(&ip, &user, &key_file)?;

    for cmd in REMOTE_COMMANDS {
        println!("Running: {}", cmd);
        let out = session.run(cmd)?;
        if !out.stdout.is_empty() {
            println!("{}", out.stdout);
        }
        if !out.stderr.is_empty() {
            println!("ERR: {}", out.stderr);
        }
        // a nonzero exit status is surfaced as a warning by the session,
        // and the remaining commands still run
        thread::sleep(Duration::from_secs(1));
    }

    sink.log(&format!("Web server deployed and running on {}", ip))
        .await?;
    sink.record(1.0).await?;

    println!("Deploy complete.");
    Ok(())
}
