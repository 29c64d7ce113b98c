use aws_config::SdkConfig as AwsSdkConfig;
use aws_sdk_sns::{error::SdkError, Client};
use log::info;

use crate::errors::{Error::API, Result};

/// Implements AWS SNS manager.
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

    /// Creates a notification topic and returns its ARN.
    /// ref. https://docs.aws.amazon.com/sns/latest/api/API_CreateTopic.html
    pub async fn create_topic(&self, topic_name: &str) -> Result<String> {
        info!("creating SNS topic '{}'", topic_name);
        let ret = self.cli.create_topic().name(topic_name).send().await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                return Err(API {
                    message: format!("failed create_topic {:?}", e),
                    is_retryable: is_error_retryable(&e),
                });
            }
        };
        match resp.topic_arn() {
            Some(arn) => Ok(arn.to_string()),
            None => Err(API {
                message: String::from("empty topic ARN from create_topic response"),
                is_retryable: false,
            }),
        }
    }

    /// Subscribes an email endpoint to the topic. The subscription stays
    /// pending until the recipient confirms; this call does not wait.
    /// ref. https://docs.aws.amazon.com/sns/latest/api/API_Subscribe.html
    pub async fn subscribe_email(&self, topic_arn: &str, email: &str) -> Result<Option<String>> {
        info!("subscribing '{}' to '{}'", email, topic_arn);
        let ret = self
            .cli
            .subscribe()
            .topic_arn(topic_arn)
            .protocol("email")
            .endpoint(email)
            .send()
            .await;
        match ret {
            Ok(resp) => Ok(resp.subscription_arn().map(String::from)),
            Err(e) => Err(API {
                message: format!("failed subscribe {:?}", e),
                is_retryable: is_error_retryable(&e),
            }),
        }
    }
}

#[inline]
pub fn is_error_retryable<E>(e: &SdkError<E>) -> bool {
    match e {
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) => true,
        SdkError::DispatchFailure(e) => e.is_timeout() || e.is_io(),
        _ => false,
    }
}
