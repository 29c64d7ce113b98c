use std::{future::Future, io, path::PathBuf};

use aws_config::SdkConfig as AwsSdkConfig;
use aws_sdk_cloudwatch::{
    error::SdkError as MetricsSdkError,
    types::{ComparisonOperator, MetricDatum, StandardUnit, Statistic},
    Client as MetricsClient,
};
use aws_sdk_cloudwatchlogs::{
    error::SdkError as LogsSdkError,
    operation::{
        create_log_group::CreateLogGroupError, create_log_stream::CreateLogStreamError,
        put_log_events::PutLogEventsError,
    },
    types::InputLogEvent,
    Client as LogsClient,
};
use chrono::Utc;
use log::{info, warn};

use crate::{
    config::Config,
    errors::{
        Error::{Other, API},
        Result,
    },
    state::Store,
};

/// Implements AWS CloudWatch manager over the logs and metrics client pair.
#[derive(Debug, Clone)]
pub struct Manager {
    #[allow(dead_code)]
    shared_config: AwsSdkConfig,
    metrics_cli: MetricsClient,
    logs_cli: LogsClient,
}

impl Manager {
    pub fn new(shared_config: &AwsSdkConfig) -> Self {
        let cloned = shared_config.clone();
        let metrics_cli = MetricsClient::new(shared_config);
        let logs_cli = LogsClient::new(shared_config);
        Self {
            shared_config: cloned,
            metrics_cli,
            logs_cli,
        }
    }

    /// Creates a CloudWatch log group.
    /// ref. https://docs.aws.amazon.com/AmazonCloudWatchLogs/latest/APIReference/API_CreateLogGroup.html
    pub async fn create_log_group(&self, log_group_name: &str) -> Result<()> {
        info!("creating CloudWatch log group '{}'", log_group_name);
        let ret = self
            .logs_cli
            .create_log_group()
            .log_group_name(log_group_name)
            .send()
            .await;
        match ret {
            Ok(_) => {
                info!("created CloudWatch log group");
            }
            Err(e) => {
                if !is_error_create_log_group_already_exists(&e) {
                    return Err(API {
                        message: format!("failed create_log_group {:?}", e),
                        is_retryable: is_logs_error_retryable(&e),
                    });
                }
                warn!("log group already exists ({})", e);
            }
        }
        Ok(())
    }

    /// Creates a CloudWatch log stream in the group.
    /// ref. https://docs.aws.amazon.com/AmazonCloudWatchLogs/latest/APIReference/API_CreateLogStream.html
    pub async fn create_log_stream(&self, log_group_name: &str, log_stream_name: &str) -> Result<()> {
        info!(
            "creating CloudWatch log stream '{}' in '{}'",
            log_stream_name, log_group_name
        );
        let ret = self
            .logs_cli
            .create_log_stream()
            .log_group_name(log_group_name)
            .log_stream_name(log_stream_name)
            .send()
            .await;
        match ret {
            Ok(_) => {
                info!("created CloudWatch log stream");
            }
            Err(e) => {
                if !is_error_create_log_stream_already_exists(&e) {
                    return Err(API {
                        message: format!("failed create_log_stream {:?}", e),
                        is_retryable: is_logs_error_retryable(&e),
                    });
                }
                warn!("log stream already exists ({})", e);
            }
        }
        Ok(())
    }

    /// Idempotently creates the group/stream pair the sink appends to.
    pub async fn ensure_log_destination(
        &self,
        log_group_name: &str,
        log_stream_name: &str,
    ) -> Result<()> {
        self.create_log_group(log_group_name).await?;
        self.create_log_stream(log_group_name, log_stream_name).await
    }

    /// Fetches the stream's current upload sequence token, "None" when the
    /// stream is empty or missing.
    /// ref. https://docs.aws.amazon.com/AmazonCloudWatchLogs/latest/APIReference/API_DescribeLogStreams.html
    pub async fn fetch_upload_token(
        &self,
        log_group_name: &str,
        log_stream_name: &str,
    ) -> Result<Option<String>> {
        info!(
            "fetching upload sequence token for '{}/{}'",
            log_group_name, log_stream_name
        );
        let ret = self
            .logs_cli
            .describe_log_streams()
            .log_group_name(log_group_name)
            .log_stream_name_prefix(log_stream_name)
            .limit(1)
            .send()
            .await;
        let resp = match ret {
            Ok(v) => v,
            Err(e) => {
                return Err(API {
                    message: format!("failed describe_log_streams {:?}", e),
                    is_retryable: is_logs_error_retryable(&e),
                });
            }
        };
        Ok(resp
            .log_streams()
            .first()
            .and_then(|s| s.upload_sequence_token())
            .map(String::from))
    }

    /// Posts one Count-unit CloudWatch metric datapoint. No batching, no retry.
    /// ref. https://docs.aws.amazon.com/AmazonCloudWatch/latest/APIReference/API_PutMetricData.html
    pub async fn put_metric_datum(
        &self,
        namespace: &str,
        metric_name: &str,
        value: f64,
    ) -> Result<()> {
        info!(
            "posting CloudWatch metric '{}' value {} in '{}'",
            metric_name, value, namespace
        );
        let datum = MetricDatum::builder()
            .metric_name(metric_name)
            .value(value)
            .unit(StandardUnit::Count)
            .build();
        let ret = self
            .metrics_cli
            .put_metric_data()
            .namespace(namespace)
            .metric_data(datum)
            .send()
            .await;
        match ret {
            Ok(_) => {
                info!("successfully posted metric");
                Ok(())
            }
            Err(e) => Err(API {
                message: format!("failed put_metric_data {:?}", e),
                is_retryable: is_metrics_error_retryable(&e),
            }),
        }
    }

    /// Defines a threshold alarm on the workflow metric: Sum over one 300-second
    /// period below the threshold notifies the topic. Alarm names are unique per
    /// account/region, so re-running overwrites the same alarm.
    /// ref. https://docs.aws.amazon.com/AmazonCloudWatch/latest/APIReference/API_PutMetricAlarm.html
    pub async fn put_threshold_alarm(
        &self,
        alarm_name: &str,
        namespace: &str,
        metric_name: &str,
        topic_arn: &str,
    ) -> Result<()> {
        info!(
            "creating CloudWatch alarm '{}' on '{}/{}'",
            alarm_name, namespace, metric_name
        );
        let ret = self
            .metrics_cli
            .put_metric_alarm()
            .alarm_name(alarm_name)
            .namespace(namespace)
            .metric_name(metric_name)
            .statistic(Statistic::Sum)
            .period(300)
            .evaluation_periods(1)
            .threshold(0.0)
            .comparison_operator(ComparisonOperator::LessThanThreshold)
            .alarm_actions(topic_arn)
            .send()
            .await;
        match ret {
            Ok(_) => Ok(()),
            Err(e) => Err(API {
                message: format!("failed put_metric_alarm {:?}", e),
                is_retryable: is_metrics_error_retryable(&e),
            }),
        }
    }
}

/// Outcome of a single append attempt, separating the one benign provider
/// condition that warrants a token refresh from everything else.
#[derive(Debug)]
pub enum AppendError {
    StaleToken,
    Fatal(crate::errors::Error),
}

/// Two-attempt append policy: present the stored token; on a stale-token
/// rejection, refresh the token from the stream and retry exactly once.
/// No backoff, and never a third attempt regardless of the retry's outcome.
pub async fn put_with_refreshed_token<A, AFut, R, RFut>(
    token: Option<String>,
    attempt: A,
    refresh: R,
) -> Result<Option<String>>
where
    A: Fn(Option<String>) -> AFut,
    AFut: Future<Output = std::result::Result<Option<String>, AppendError>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<Option<String>>>,
{
    match attempt(token).await {
        Ok(next) => Ok(next),
        Err(AppendError::Fatal(e)) => Err(e),
        Err(AppendError::StaleToken) => {
            warn!("sequence token rejected; refreshing from the stream and retrying once");
            let refreshed = refresh().await?;
            match attempt(refreshed).await {
                Ok(next) => Ok(next),
                Err(AppendError::Fatal(e)) => Err(e),
                Err(AppendError::StaleToken) => Err(API {
                    message: String::from("sequence token still rejected after refresh"),
                    is_retryable: false,
                }),
            }
        }
    }
}

/// Binds a CloudWatch manager to the configured log destination, metric and
/// the locally persisted sequence token, giving workflows a one-call sink
/// for milestone lines and the completion metric.
#[derive(Debug, Clone)]
pub struct Sink {
    manager: Manager,
    store: Store,
    token_file: PathBuf,
    log_group: String,
    log_stream: String,
    namespace: String,
    metric_name: String,
}

impl Sink {
    /// Reads the CloudWatch keys from the configuration and idempotently
    /// creates the log destination before first use.
    pub async fn new(
        shared_config: &AwsSdkConfig,
        cfg: &Config,
        store: &Store,
    ) -> io::Result<Self> {
        let log_group = cfg.required("CW_LOG_GROUP")?;
        let log_stream = cfg.required("CW_LOG_STREAM")?;
        let namespace = cfg.required("CW_METRIC_NAMESPACE")?;
        let metric_name = cfg.required("CW_METRIC_NAME")?;

        let manager = Manager::new(shared_config);
        manager
            .ensure_log_destination(&log_group, &log_stream)
            .await?;

        let token_file = store.token_path(&log_group, &log_stream);
        Ok(Self {
            manager,
            store: store.clone(),
            token_file,
            log_group,
            log_stream,
            namespace,
            metric_name,
        })
    }

    /// Appends one line to the log stream, echoing it to the local log.
    pub async fn log(&self, message: &str) -> Result<()> {
        info!("{}", message);

        let token = self.store.read_token(&self.token_file);
        let next = put_with_refreshed_token(
            token,
            |t| self.attempt_append(message, t),
            || self.manager.fetch_upload_token(&self.log_group, &self.log_stream),
        )
        .await?;

        self.store
            .write_token(&self.token_file, next.as_deref())
            .map_err(|e| Other {
                message: format!("failed to persist sequence token {:?}", e),
                is_retryable: false,
            })
    }

    /// Emits one count datapoint under the configured namespace/metric.
    pub async fn record(&self, value: f64) -> Result<()> {
        self.manager
            .put_metric_datum(&self.namespace, &self.metric_name, value)
            .await
    }

    async fn attempt_append(
        &self,
        message: &str,
        token: Option<String>,
    ) -> std::result::Result<Option<String>, AppendError> {
        let event = InputLogEvent::builder()
            .timestamp(Utc::now().timestamp_millis())
            .message(message)
            .build()
            .map_err(|e| {
                AppendError::Fatal(Other {
                    message: format!("failed to build log event {:?}", e),
                    is_retryable: false,
                })
            })?;

        let ret = self
            .manager
            .logs_cli
            .put_log_events()
            .log_group_name(&self.log_group)
            .log_stream_name(&self.log_stream)
            .log_events(event)
            .set_sequence_token(token)
            .send()
            .await;
        match ret {
            Ok(resp) => Ok(resp.next_sequence_token().map(String::from)),
            Err(e) => {
                if is_error_stale_sequence_token(&e) {
                    Err(AppendError::StaleToken)
                } else {
                    Err(AppendError::Fatal(API {
                        message: format!("failed put_log_events {:?}", e),
                        is_retryable: is_logs_error_retryable(&e),
                    }))
                }
            }
        }
    }
}

#[inline]
pub fn is_metrics_error_retryable<E>(e: &MetricsSdkError<E>) -> bool {
    match e {
        MetricsSdkError::TimeoutError(_) | MetricsSdkError::ResponseError(_) => true,
        MetricsSdkError::DispatchFailure(e) => e.is_timeout() || e.is_io(),
        _ => false,
    }
}

#[inline]
pub fn is_logs_error_retryable<E>(e: &LogsSdkError<E>) -> bool {
    match e {
        LogsSdkError::TimeoutError(_) | LogsSdkError::ResponseError(_) => true,
        LogsSdkError::DispatchFailure(e) => e.is_timeout() || e.is_io(),
        _ => false,
    }
}

#[inline]
fn is_error_create_log_group_already_exists(e: &LogsSdkError<CreateLogGroupError>) -> bool {
    matches!(e, LogsSdkError::ServiceError(err) if err.err().is_resource_already_exists_exception())
}

#[inline]
fn is_error_create_log_stream_already_exists(e: &LogsSdkError<CreateLogStreamError>) -> bool {
    matches!(e, LogsSdkError::ServiceError(err) if err.err().is_resource_already_exists_exception())
}

/// "InvalidSequenceTokenException" and "DataAlreadyAcceptedException" both
/// mean the locally stored token went stale.
#[inline]
fn is_error_stale_sequence_token(e: &LogsSdkError<PutLogEventsError>) -> bool {
    matches!(
        e,
        LogsSdkError::ServiceError(err)
            if err.err().is_invalid_sequence_token_exception()
                || err.err().is_data_already_accepted_exception()
    )
}

#[cfg(test)]
macro_rules! ab {
    ($e:expr) => {
        tokio_test::block_on($e)
    };
}

#[test]
fn test_first_attempt_success_skips_refresh() {
    use std::cell::Cell;

    let attempts = Cell::new(0u32);
    let refreshed = Cell::new(false);

    let ret = ab!(put_with_refreshed_token(
        Some(String::from("current")),
        |t| {
            attempts.set(attempts.get() + 1);
            async move {
                assert_eq!(t.as_deref(), Some("current"));
                Ok(Some(String::from("next-1")))
            }
        },
        || {
            refreshed.set(true);
            async { Ok(None) }
        },
    ));

    assert_eq!(ret.unwrap().as_deref(), Some("next-1"));
    assert_eq!(attempts.get(), 1);
    assert!(!refreshed.get());
}

#[test]
fn test_stale_token_retries_exactly_once() {
    use std::cell::{Cell, RefCell};

    let attempts = Cell::new(0u32);
    let presented = RefCell::new(Vec::new());

    let ret = ab!(put_with_refreshed_token(
        Some(String::from("stale")),
        |t| {
            attempts.set(attempts.get() + 1);
            presented.borrow_mut().push(t);
            let first = attempts.get() == 1;
            async move {
                if first {
                    Err(AppendError::StaleToken)
                } else {
                    Ok(Some(String::from("next-2")))
                }
            }
        },
        || async { Ok(Some(String::from("fresh"))) },
    ));

    assert_eq!(ret.unwrap().as_deref(), Some("next-2"));
    assert_eq!(attempts.get(), 2);
    // retry must present the refreshed token
    assert_eq!(presented.borrow()[1].as_deref(), Some("fresh"));
}

#[test]
fn test_no_second_retry_after_failed_refresh_attempt() {
    use std::cell::Cell;

    let attempts = Cell::new(0u32);

    let ret = ab!(put_with_refreshed_token(
        None,
        |_| {
            attempts.set(attempts.get() + 1);
            async { Err(AppendError::StaleToken) }
        },
        || async { Ok(None) },
    ));

    assert!(ret.is_err());
    assert_eq!(attempts.get(), 2);
}

#[test]
fn test_fatal_error_propagates_without_retry() {
    use std::cell::Cell;

    let attempts = Cell::new(0u32);

    let ret = ab!(put_with_refreshed_token(
        Some(String::from("current")),
        |_| {
            attempts.set(attempts.get() + 1);
            async {
                Err(AppendError::Fatal(API {
                    message: String::from("failed put_log_events"),
                    is_retryable: false,
                }))
            }
        },
        || async { Ok(None) },
    ));

    assert!(ret.is_err());
    assert_eq!(attempts.get(), 1);
}
