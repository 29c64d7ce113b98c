use std::io::{self, stdout, Error, ErrorKind};

use clap::{Arg, Command};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use tokio::time::Duration;
use webup_ops::{
    cloudwatch,
    config::Config,
    ec2::{self, LaunchSpec},
    state::{InstanceRecord, Store},
};

pub const NAME: &str = "create";

pub fn command() -> Command {
    Command::new(NAME)
        .about("Provisions the network, security group, key pair and first instance")
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

// instance-running long-poll ceiling
const MAX_WAIT_SECONDS: u64 = 10 * 60;

pub async fn execute(log_level: &str, config_file_path: &str) -> io::Result<()> {
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

    let region = cfg.required("REGION")?;
    let shared_config = webup_ops::load_config(Some(region)).await;
    let store = Store::new(".");
    let sink = cloudwatch::Sink::new(&shared_config, &cfg, &store).await?;
    let ec2_manager = ec2::Manager::new(&shared_config);

    sink.log("=== Creating infrastructure ===").await?;

    // 1) use the default VPC
    let vpc_id = ec2_manager.find_default_vpc().await?;
    store.write_vpc_id(&vpc_id)?;
    sink.log(&format!("Using default VPC: {}", vpc_id)).await?;

    // 2) use the existing subnets in the VPC
    let subnets = ec2_manager.list_subnets(&vpc_id).await?;
    if subnets.len() < 2 {
        return Err(Error::new(
            ErrorKind::Other,
            "not enough subnets in the default VPC; at least 2 are required",
        ));
    }
    let subnet1_id = subnets[0].subnet_id().unwrap_or_default().to_string();
    let subnet2_id = subnets[1].subnet_id().unwrap_or_default().to_string();
    sink.log(&format!(
        "Using existing subnets: {}, {}",
        subnet1_id, subnet2_id
    ))
    .await?;

    // 3) internet gateway, reused when one is already attached
    let (igw_id, igw_reused) = ec2_manager.ensure_internet_gateway(&vpc_id).await?;
    if igw_reused {
        sink.log(&format!("Using existing internet gateway: {}", igw_id))
            .await?;
    } else {
        sink.log(&format!("Internet gateway created and attached: {}", igw_id))
            .await?;
    }

    // 4) route table with a default route through the gateway
    let (rt_id, rt_reused) = ec2_manager.ensure_route_table(&vpc_id, &igw_id).await?;
    if rt_reused {
        sink.log(&format!("Using existing route table: {}", rt_id))
            .await?;
    }
    for subnet_id in [&subnet1_id, &subnet2_id] {
        if ec2_manager.associate_route_table(&rt_id, subnet_id).await? {
            sink.log(&format!(
                "Route table {} associated with subnet {}",
                rt_id, subnet_id
            ))
            .await?;
        } else {
            sink.log(&format!(
                "Subnet {} already associated with a route table, skipping",
                subnet_id
            ))
            .await?;
        }
    }

    // 5) security group with SSH (caller address) and HTTP (open) ingress
    let sg_name = cfg.required("SECURITY_GROUP_NAME")?;
    let sg_desc = cfg.required("SECURITY_GROUP_DESC")?;
    let (sg_id, sg_reused) = ec2_manager
        .ensure_security_group(&sg_name, &sg_desc, &vpc_id)
        .await?;
    if sg_reused {
        sink.log(&format!("Security group already exists: {}", sg_id))
            .await?;
    } else {
        sink.log(&format!("Security group created: {}", sg_id))
            .await?;
    }

    let ssh_cidr = ec2::fetch_local_public_cidr().await;
    if !ec2_manager.authorize_ingress(&sg_id, 22, &ssh_cidr).await? {
        sink.log("SSH rule already exists, skipping").await?;
    }
    if !ec2_manager
        .authorize_ingress(&sg_id, 80, "0.0.0.0/0")
        .await?
    {
        sink.log("HTTP rule already exists, skipping").await?;
    }

    // 6) key pair
    let key_name = cfg.required("KEY_NAME")?;
    let key_type = cfg.get_or("KEY_TYPE", "ed25519");
    let key_file = cfg.required("KEY_FILE")?;
    if ec2_manager
        .ensure_key_pair(&key_name, &key_type, &key_file)
        .await?
    {
        sink.log(&format!("Key pair created and saved to {}", key_file))
            .await?;
    } else {
        sink.log(&format!("Key pair already exists: {}", key_name))
            .await?;
    }

    // 7) newest AMI matching the owner/name filter
    let ami_id = ec2_manager
        .find_latest_image(&cfg.required("UBUNTU_OWNER")?, &cfg.required("UBUNTU_FILTER")?)
        .await?;
    sink.log(&format!("Using AMI {}", ami_id)).await?;

    // 8) launch the first instance and record it
    let instance_id = ec2_manager
        .launch_instance(&LaunchSpec {
            image_id: ami_id,
            instance_type: cfg.required("INSTANCE_TYPE")?,
            key_name,
            security_group_id: sg_id,
            subnet_id: subnet1_id,
            associate_public_ip: false,
        })
        .await?;
    ec2_manager
        .poll_until_running(
            &[instance_id.clone()],
            Duration::from_secs(MAX_WAIT_SECONDS),
        )
        .await?;
    let public_ip = ec2_manager.fetch_public_ip(&instance_id).await?;

    store.reset_instances(&InstanceRecord {
        instance_id: instance_id.clone(),
        public_ip: public_ip.clone(),
    })?;

    sink.log(&format!(
        "EC2 instance created: {} ({})",
        instance_id, public_ip
    ))
    .await?;
    sink.record(1.0).await?;

    println!("Create complete. Instance IP: {}", public_ip);
    Ok(())
}
