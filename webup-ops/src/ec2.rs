use std::{
    fs::{self, File},
    io::Write,
    os::unix::fs::PermissionsExt,
    path::Path,
};

use aws_config::SdkConfig as AwsSdkConfig;
use aws_sdk_ec2::{
    error::{ProvideErrorMetadata, SdkError},
    operation::{
        associate_route_table::AssociateRouteTableError,
        authorize_security_group_ingress::AuthorizeSecurityGroupIngressError,
        delete_key_pair::DeleteKeyPairError,
    },
    types::{
        Filter, Image, Instance, InstanceNetworkInterfaceSpecification, InstanceStateName,
        InstanceType, IpPermission, IpRange, KeyType, Subnet,
    },
    Client,
};
use log::{info, warn};
use tokio::time::{sleep, Duration, Instant};

use crate::errors::{
    Error::{Other, API},
    Result,
};

/// Interval between instance-state describe polls.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Everything run_instances needs for one launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub security_group_id: String,
    pub subnet_id: String,
    /// Request a public address explicitly through a device-0 network
    /// interface (scale workflow).
    pub associate_public_ip: bool,
}

/// Implements AWS EC2 manager.
#[derive(Debug, Clone)]
pub struct Manager {
    #[allow(dead_code)]
    shared_config: AwsSdkConfig,
    cli: Client,
}

impl Manager {
    pub fn new(shared_config: &AwsSdkConfig) -> Self {
        let cloned = shared_config.clone();
        let cli = Client::new(shared_config);
        Self {
            shared_config: cloned,
            cli,
        }
    }

    /// Finds the account's default VPC in the region.
    pub async fn find_default_vpc(&self) -> Result<String> {
        info!("finding the default VPC");
        let ret = self
            .cli
            .describe_vpcs()
            .filters(Filter::builder().name("isDefault").values("true").build())
            .send()
            .await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                return Err(API {
                    message: format!("failed describe_vpcs {:?}", e),
                    is_retryable: is_error_retryable(&e),
                });
            }
        };
        match resp.vpcs().first().and_then(|v| v.vpc_id()) {
            Some(id) => Ok(id.to_string()),
            None => Err(Other {
                message: String::from("no default VPC found in this region"),
                is_retryable: false,
            }),
        }
    }

    /// Lists the existing subnets in the VPC.
    pub async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>> {
        info!("listing subnets in '{}'", vpc_id);
        let ret = self
            .cli
            .describe_subnets()
            .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
            .send()
            .await;
        match ret {
            Ok(resp) => Ok(resp.subnets().to_vec()),
            Err(e) => Err(API {
                message: format!("failed describe_subnets {:?}", e),
                is_retryable: is_error_retryable(&e),
            }),
        }
    }

    /// Finds a subnet by its CIDR block (scale workflow lookup).
    pub async fn find_subnet_by_cidr(&self, cidr: &str) -> Result<String> {
        info!("finding subnet with CIDR '{}'", cidr);
        let ret = self
            .cli
            .describe_subnets()
            .filters(Filter::builder().name("cidr-block").values(cidr).build())
            .send()
            .await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                return Err(API {
                    message: format!("failed describe_subnets {:?}", e),
                    is_retryable: is_error_retryable(&e),
                });
            }
        };
        match resp.subnets().first().and_then(|s| s.subnet_id()) {
            Some(id) => Ok(id.to_string()),
            None => Err(Other {
                message: format!("no subnet matches CIDR '{}'", cidr),
                is_retryable: false,
            }),
        }
    }

    /// Reuses the internet gateway already attached to the VPC, creating and
    /// attaching one only when none exists. Returns the gateway id and
    /// whether it was reused.
    pub async fn ensure_internet_gateway(&self, vpc_id: &str) -> Result<(String, bool)> {
        info!("looking for an internet gateway attached to '{}'", vpc_id);
        let ret = self
            .cli
            .describe_internet_gateways()
            .filters(
                Filter::builder()
                    .name("attachment.vpc-id")
                    .values(vpc_id)
                    .build(),
            )
            .send()
            .await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                return Err(API {
                    message: format!("failed describe_internet_gateways {:?}", e),
                    is_retryable: is_error_retryable(&e),
                });
            }
        };
        if let Some(id) = resp
            .internet_gateways()
            .first()
            .and_then(|g| g.internet_gateway_id())
        {
            return Ok((id.to_string(), true));
        }

        info!("creating an internet gateway");
        let ret = self.cli.create_internet_gateway().send().await;
        let igw_id = match ret {
            Ok(resp) => match resp
                .internet_gateway()
                .and_then(|g| g.internet_gateway_id())
            {
                Some(id) => id.to_string(),
                None => {
                    return Err(API {
                        message: String::from("empty create_internet_gateway response"),
                        is_retryable: false,
                    });
                }
            },
            Err(e) => {
                return Err(API {
                    message: format!("failed create_internet_gateway {:?}", e),
                    is_retryable: is_error_retryable(&e),
                });
            }
        };

        let ret = self
            .cli
            .attach_internet_gateway()
            .internet_gateway_id(&igw_id)
            .vpc_id(vpc_id)
            .send()
            .await;
        match ret {
            Ok(_) => Ok((igw_id, false)),
            Err(e) => Err(API {
                message: format!("failed attach_internet_gateway {:?}", e),
                is_retryable: is_error_retryable(&e),
            }),
        }
    }

    /// Reuses a route table in the VPC that already routes through the
    /// gateway; otherwise creates one and adds the default route.
    pub async fn ensure_route_table(&self, vpc_id: &str, igw_id: &str) -> Result<(String, bool)> {
        info!("looking for a route table in '{}' routed via '{}'", vpc_id, igw_id);
        let ret = self
            .cli
            .describe_route_tables()
            .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
            .filters(
                Filter::builder()
                    .name("route.gateway-id")
                    .values(igw_id)
                    .build(),
            )
            .send()
            .await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                return Err(API {
                    message: format!("failed describe_route_tables {:?}", e),
                    is_retryable: is_error_retryable(&e),
                });
            }
        };
        if let Some(id) = resp
            .route_tables()
            .first()
            .and_then(|rt| rt.route_table_id())
        {
            return Ok((id.to_string(), true));
        }

        info!("creating a route table in '{}'", vpc_id);
        let ret = self.cli.create_route_table().vpc_id(vpc_id).send().await;
        let rt_id = match ret {
            Ok(resp) => match resp.route_table().and_then(|rt| rt.route_table_id()) {
                Some(id) => id.to_string(),
                None => {
                    return Err(API {
                        message: String::from("empty create_route_table response"),
                        is_retryable: false,
                    });
                }
            },
            Err(e) => {
                return Err(API {
                    message: format!("failed create_route_table {:?}", e),
                    is_retryable: is_error_retryable(&e),
                });
            }
        };

        let ret = self
            .cli
            .create_route()
            .route_table_id(&rt_id)
            .destination_cidr_block("0.0.0.0/0")
            .gateway_id(igw_id)
            .send()
            .await;
        match ret {
            Ok(_) => Ok((rt_id, false)),
            Err(e) => Err(API {
                message: format!("failed create_route {:?}", e),
                is_retryable: is_error_retryable(&e),
            }),
        }
    }

    /// Associates the route table with a subnet; an existing association is
    /// success. Returns whether a new association was made.
    pub async fn associate_route_table(&self, rt_id: &str, subnet_id: &str) -> Result<bool> {
        info!("associating route table '{}' with '{}'", rt_id, subnet_id);
        let ret = self
            .cli
            .associate_route_table()
            .route_table_id(rt_id)
            .subnet_id(subnet_id)
            .send()
            .await;
        match ret {
            Ok(_) => Ok(true),
            Err(e) => {
                if is_error_already_associated(&e) {
                    warn!("subnet '{}' already associated ({})", subnet_id, e);
                    return Ok(false);
                }
                Err(API {
                    message: format!("failed associate_route_table {:?}", e),
                    is_retryable: is_error_retryable(&e),
                })
            }
        }
    }

    /// Looks up a security group id by group name.
    pub async fn find_security_group(&self, group_name: &str) -> Result<Option<String>> {
        info!("finding security group '{}'", group_name);
        let ret = self
            .cli
            .describe_security_groups()
            .filters(
                Filter::builder()
                    .name("group-name")
                    .values(group_name)
                    .build(),
            )
            .send()
            .await;
        match ret {
            Ok(resp) => Ok(resp
                .security_groups()
                .first()
                .and_then(|sg| sg.group_id())
                .map(String::from)),
            Err(e) => Err(API {
                message: format!("failed describe_security_groups {:?}", e),
                is_retryable: is_error_retryable(&e),
            }),
        }
    }

    /// Reuses the security group by name, creating it only when absent.
    /// Returns the group id and whether it was reused.
    pub async fn ensure_security_group(
        &self,
        group_name: &str,
        description: &str,
        vpc_id: &str,
    ) -> Result<(String, bool)> {
        if let Some(id) = self.find_security_group(group_name).await? {
            return Ok((id, true));
        }

        info!("creating security group '{}' in '{}'", group_name, vpc_id);
        let ret = self
            .cli
            .create_security_group()
            .group_name(group_name)
            .description(description)
            .vpc_id(vpc_id)
            .send()
            .await;
        match ret {
            Ok(resp) => match resp.group_id() {
                Some(id) => Ok((id.to_string(), false)),
                None => Err(API {
                    message: String::from("empty create_security_group response"),
                    is_retryable: false,
                }),
            },
            Err(e) => Err(API {
                message: format!("failed create_security_group {:?}", e),
                is_retryable: is_error_retryable(&e),
            }),
        }
    }

    /// Authorizes one TCP ingress rule; a duplicate rule is success.
    /// Returns whether the rule was newly added.
    pub async fn authorize_ingress(
        &self,
        group_id: &str,
        port: i32,
        cidr: &str,
    ) -> Result<bool> {
        info!(
            "authorizing tcp/{} ingress from '{}' on '{}'",
            port, cidr, group_id
        );
        let ret = self
            .cli
            .authorize_security_group_ingress()
            .group_id(group_id)
            .ip_permissions(
                IpPermission::builder()
                    .ip_protocol("tcp")
                    .from_port(port)
                    .to_port(port)
                    .ip_ranges(IpRange::builder().cidr_ip(cidr).build())
                    .build(),
            )
            .send()
            .await;
        match ret {
            Ok(_) => Ok(true),
            Err(e) => {
                if is_error_duplicate_permission(&e) {
                    warn!("tcp/{} rule already exists ({})", port, e);
                    return Ok(false);
                }
                Err(API {
                    message: format!("failed authorize_security_group_ingress {:?}", e),
                    is_retryable: is_error_retryable(&e),
                })
            }
        }
    }

    /// Reuses the key pair by name; when absent, creates it and saves the
    /// private key material to "key_path" with owner-only permissions.
    /// Returns whether the key pair was newly created.
    pub async fn ensure_key_pair(
        &self,
        key_name: &str,
        key_type: &str,
        key_path: &str,
    ) -> Result<bool> {
        info!("checking for existing EC2 key-pair '{}'", key_name);
        let ret = self.cli.describe_key_pairs().send().await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                return Err(API {
                    message: format!("failed describe_key_pairs {:?}", e),
                    is_retryable: is_error_retryable(&e),
                });
            }
        };
        let exists = resp
            .key_pairs()
            .iter()
            .any(|kp| kp.key_name() == Some(key_name));
        if exists {
            return Ok(false);
        }

        info!("creating EC2 key-pair '{}'", key_name);
        let ret = self
            .cli
            .create_key_pair()
            .key_name(key_name)
            .key_type(KeyType::from(key_type))
            .send()
            .await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                return Err(API {
                    message: format!("failed create_key_pair {:?}", e),
                    is_retryable: is_error_retryable(&e),
                });
            }
        };
        let key_material = match resp.key_material() {
            Some(v) => v,
            None => {
                return Err(API {
                    message: String::from("empty key material from create_key_pair response"),
                    is_retryable: false,
                });
            }
        };

        info!("saving EC2 key-pair '{}' to '{}'", key_name, key_path);
        let path = Path::new(key_path);
        let mut f = File::create(path).map_err(|e| Other {
            message: format!("failed to create file {:?}", e),
            is_retryable: false,
        })?;
        f.write_all(key_material.as_bytes()).map_err(|e| Other {
            message: format!("failed to write file {:?}", e),
            is_retryable: false,
        })?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o400)).map_err(|e| Other {
            message: format!("failed to chmod key file {:?}", e),
            is_retryable: false,
        })?;

        Ok(true)
    }

    /// Selects the newest image matching the owner and name filter.
    pub async fn find_latest_image(&self, owner: &str, name_filter: &str) -> Result<String> {
        info!(
            "finding the latest image owned by '{}' matching '{}'",
            owner, name_filter
        );
        let ret = self
            .cli
            .describe_images()
            .owners(owner)
            .filters(Filter::builder().name("name").values(name_filter).build())
            .send()
            .await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                return Err(API {
                    message: format!("failed describe_images {:?}", e),
                    is_retryable: is_error_retryable(&e),
                });
            }
        };
        match latest_image(resp.images()).and_then(|img| img.image_id()) {
            Some(id) => Ok(id.to_string()),
            None => Err(Other {
                message: format!(
                    "no image matches owner '{}' filter '{}'",
                    owner, name_filter
                ),
                is_retryable: false,
            }),
        }
    }

    /// Launches exactly one instance.
    pub async fn launch_instance(&self, spec: &LaunchSpec) -> Result<String> {
        info!(
            "launching one '{}' instance from '{}'",
            spec.instance_type, spec.image_id
        );
        let mut req = self
            .cli
            .run_instances()
            .image_id(&spec.image_id)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .key_name(&spec.key_name)
            .min_count(1)
            .max_count(1);
        if spec.associate_public_ip {
            req = req.network_interfaces(
                InstanceNetworkInterfaceSpecification::builder()
                    .device_index(0)
                    .subnet_id(&spec.subnet_id)
                    .groups(&spec.security_group_id)
                    .associate_public_ip_address(true)
                    .build(),
            );
        } else {
            req = req
                .security_group_ids(&spec.security_group_id)
                .subnet_id(&spec.subnet_id);
        }

        let ret = req.send().await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                return Err(API {
                    message: format!("failed run_instances {:?}", e),
                    is_retryable: is_error_retryable(&e),
                });
            }
        };
        match resp.instances().first().and_then(|i| i.instance_id()) {
            Some(id) => Ok(id.to_string()),
            None => Err(API {
                message: String::from("empty instance from run_instances response"),
                is_retryable: false,
            }),
        }
    }

    /// Blocks until every instance reports "running".
    pub async fn poll_until_running(
        &self,
        instance_ids: &[String],
        timeout: Duration,
    ) -> Result<()> {
        self.poll_instance_state(instance_ids, InstanceStateName::Running, timeout)
            .await
    }

    /// Blocks until every instance reports "terminated".
    pub async fn poll_until_terminated(
        &self,
        instance_ids: &[String],
        timeout: Duration,
    ) -> Result<()> {
        self.poll_instance_state(instance_ids, InstanceStateName::Terminated, timeout)
            .await
    }

    async fn poll_instance_state(
        &self,
        instance_ids: &[String],
        target: InstanceStateName,
        timeout: Duration,
    ) -> Result<()> {
        info!(
            "polling {} instance(s) until '{}'",
            instance_ids.len(),
            target.as_str()
        );
        let deadline = Instant::now() + timeout;
        loop {
            let instances = self.describe_by_ids(instance_ids).await?;
            let done = instances.len() == instance_ids.len()
                && instances.iter().all(|i| {
                    i.state()
                        .and_then(|s| s.name())
                        .map_or(false, |n| *n == target)
                });
            if done {
                info!("all instances are '{}'", target.as_str());
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(API {
                    message: format!(
                        "timed out waiting for instances to reach '{}'",
                        target.as_str()
                    ),
                    is_retryable: true,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Fetches the instance's public IPv4 address.
    pub async fn fetch_public_ip(&self, instance_id: &str) -> Result<String> {
        let instances = self.describe_by_ids(&[instance_id.to_string()]).await?;
        match instances.first().and_then(|i| i.public_ip_address()) {
            Some(ip) => Ok(ip.to_string()),
            None => Err(API {
                message: format!("instance '{}' has no public address", instance_id),
                is_retryable: true,
            }),
        }
    }

    async fn describe_by_ids(&self, instance_ids: &[String]) -> Result<Vec<Instance>> {
        let ret = self
            .cli
            .describe_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                return Err(API {
                    message: format!("failed describe_instances {:?}", e),
                    is_retryable: is_error_retryable(&e),
                });
            }
        };
        Ok(resp
            .reservations()
            .iter()
            .flat_map(|rsv| rsv.instances().iter().cloned())
            .collect())
    }

    /// Terminates the instances as a single batch call.
    pub async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        info!("terminating {} instance(s)", instance_ids.len());
        let ret = self
            .cli
            .terminate_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await;
        match ret {
            Ok(_) => Ok(()),
            Err(e) => Err(API {
                message: format!("failed terminate_instances {:?}", e),
                is_retryable: is_error_retryable(&e),
            }),
        }
    }

    /// Deletes the EC2 key-pair; a missing key pair is success.
    pub async fn delete_key_pair(&self, key_name: &str) -> Result<()> {
        info!("deleting EC2 key-pair '{}'", key_name);
        let ret = self.cli.delete_key_pair().key_name(key_name).send().await;
        match ret {
            Ok(_) => {}
            Err(e) => {
                if !is_error_key_pair_not_found(&e) {
                    return Err(API {
                        message: format!("failed delete_key_pair {:?}", e),
                        is_retryable: is_error_retryable(&e),
                    });
                }
                warn!("key pair already deleted ({})", e);
            }
        }
        Ok(())
    }

    pub async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        info!("deleting security group '{}'", group_id);
        let ret = self
            .cli
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await;
        match ret {
            Ok(_) => Ok(()),
            Err(e) => Err(API {
                message: format!("failed delete_security_group {:?}", e),
                is_retryable: is_error_retryable(&e),
            }),
        }
    }

    pub async fn delete_vpc(&self, vpc_id: &str) -> Result<()> {
        info!("deleting VPC '{}'", vpc_id);
        let ret = self.cli.delete_vpc().vpc_id(vpc_id).send().await;
        match ret {
            Ok(_) => Ok(()),
            Err(e) => Err(API {
                message: format!("failed delete_vpc {:?}", e),
                is_retryable: is_error_retryable(&e),
            }),
        }
    }
}

/// Newest image by creation date; the timestamps are RFC3339 so the
/// lexicographic order is the chronological order.
pub fn latest_image(images: &[Image]) -> Option<&Image> {
    images.iter().max_by_key(|img| img.creation_date())
}

/// Discovers the caller's public address for the SSH ingress rule, falling
/// back to unrestricted when discovery fails.
pub async fn fetch_local_public_cidr() -> String {
    match fetch_local_public_ip().await {
        Ok(ip) => format!("{}/32", ip),
        Err(e) => {
            warn!(
                "failed to discover the local public address ({}); falling back to 0.0.0.0/0",
                e
            );
            String::from("0.0.0.0/0")
        }
    }
}

async fn fetch_local_public_ip() -> std::result::Result<String, reqwest::Error> {
    let ip = reqwest::get("https://ipv4.icanhazip.com")
        .await?
        .text()
        .await?
        .trim()
        .to_string();
    Ok(ip)
}

#[inline]
pub fn is_error_retryable<E>(e: &SdkError<E>) -> bool {
    match e {
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) => true,
        SdkError::DispatchFailure(e) => e.is_timeout() || e.is_io(),
        _ => false,
    }
}

#[inline]
fn is_error_already_associated(e: &SdkError<AssociateRouteTableError>) -> bool {
    matches!(
        e,
        SdkError::ServiceError(err)
            if err.err().code().map_or(false, |c| c.contains("AlreadyAssociated"))
    )
}

#[inline]
fn is_error_duplicate_permission(e: &SdkError<AuthorizeSecurityGroupIngressError>) -> bool {
    matches!(
        e,
        SdkError::ServiceError(err) if err.err().code() == Some("InvalidPermission.Duplicate")
    )
}

#[inline]
fn is_error_key_pair_not_found(e: &SdkError<DeleteKeyPairError>) -> bool {
    matches!(
        e,
        SdkError::ServiceError(err)
            if err.err().code().map_or(false, |c| c.contains("NotFound"))
    )
}

#[test]
fn test_latest_image() {
    let old = Image::builder()
        .image_id("ami-old")
        .creation_date("2023-05-01T00:00:00.000Z")
        .build();
    let mid = Image::builder()
        .image_id("ami-mid")
        .creation_date("2023-11-15T08:30:00.000Z")
        .build();
    let new = Image::builder()
        .image_id("ami-new")
        .creation_date("2024-02-01T12:00:00.000Z")
        .build();

    let images = vec![mid, new, old];
    let picked = latest_image(&images).unwrap();
    assert_eq!(picked.image_id(), Some("ami-new"));

    assert!(latest_image(&[]).is_none());
}
