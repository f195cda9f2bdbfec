//! Amazon SQS backend built on `aws-sdk-sqs`.

use std::collections::HashMap;
use std::time::Duration;

use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{MessageAttributeValue, QueueAttributeName};
use aws_sdk_sqs::Client;
use log::debug;
use parking_lot::Mutex;
use tokio::runtime::Runtime;

use crate::adapters::build_runtime;
use crate::listen::{Listen, Polling, Receiver};
use crate::{BrokerClient, BrokerError, DeliveryToken, Headers, Message, RawDelivery};

const BACKEND: &str = "SQS";

/// Longest wait SQS accepts for a single long poll.
pub const MAX_LONG_POLL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct SqsOptions {
    /// Override for local stacks such as ElasticMQ or LocalStack.
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    /// Applied to queues this client creates.
    pub visibility_timeout: Duration,
    /// Messages fetched per receive call, between 1 and 10.
    pub max_messages: i32,
}

impl Default for SqsOptions {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            region: None,
            visibility_timeout: Duration::from_secs(30),
            max_messages: 1,
        }
    }
}

impl SqsOptions {
    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn with_max_messages(mut self, max_messages: i32) -> Self {
        self.max_messages = max_messages.clamp(1, 10);
        self
    }
}

struct SqsSession {
    client: Client,
    queue_urls: HashMap<String, String>,
}

impl SqsSession {
    async fn lookup(&self, queue: &str) -> Result<Option<String>, String> {
        match self.client.get_queue_url().queue_name(queue).send().await {
            Ok(output) => Ok(output.queue_url().map(str::to_string)),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|err| err.is_queue_does_not_exist()) =>
            {
                Ok(None)
            }
            Err(err) => Err(DisplayErrorContext(&err).to_string()),
        }
    }

    async fn create(&self, queue: &str, options: &SqsOptions) -> Result<String, String> {
        let output = self
            .client
            .create_queue()
            .queue_name(queue)
            .attributes(
                QueueAttributeName::VisibilityTimeout,
                options.visibility_timeout.as_secs().to_string(),
            )
            .send()
            .await
            .map_err(|err| DisplayErrorContext(&err).to_string())?;
        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| "CreateQueue returned no queue url".to_string())
    }

    /// URL of `queue`, creating the queue when it does not exist yet.
    async fn queue_url(&mut self, queue: &str, options: &SqsOptions) -> Result<String, String> {
        if let Some(url) = self.queue_urls.get(queue) {
            return Ok(url.clone());
        }
        let url = match self.lookup(queue).await? {
            Some(url) => url,
            None => self.create(queue, options).await?,
        };
        self.queue_urls.insert(queue.to_string(), url.clone());
        Ok(url)
    }

    async fn destroy(&mut self, queue: &str) -> Result<(), String> {
        self.queue_urls.remove(queue);
        let Some(url) = self.lookup(queue).await? else {
            return Ok(());
        };
        self.client
            .delete_queue()
            .queue_url(url)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| DisplayErrorContext(&err).to_string())
    }

    async fn publish(
        &mut self,
        message: &Message,
        body: String,
        options: &SqsOptions,
    ) -> Result<(), String> {
        let url = self.queue_url(&message.queue, options).await?;
        let mut request = self.client.send_message().queue_url(url).message_body(body);
        for (key, value) in &message.headers {
            let attribute = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|err| err.to_string())?;
            request = request.message_attributes(key, attribute);
        }
        request
            .send()
            .await
            .map(|_| ())
            .map_err(|err| DisplayErrorContext(&err).to_string())
    }

    async fn receive(
        &mut self,
        queue: &str,
        wait: Duration,
        options: &SqsOptions,
    ) -> Result<Vec<RawDelivery>, String> {
        let url = self.queue_url(queue, options).await?;
        let output = self
            .client
            .receive_message()
            .queue_url(&url)
            .max_number_of_messages(options.max_messages)
            .wait_time_seconds(wait_seconds(wait))
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|err| DisplayErrorContext(&err).to_string())?;

        let deliveries = output
            .messages()
            .iter()
            .filter_map(|received| {
                let receipt_handle = received.receipt_handle()?.to_string();
                let headers: Headers = received
                    .message_attributes()
                    .map(|attributes| {
                        attributes
                            .iter()
                            .filter_map(|(key, value)| {
                                value.string_value().map(|value| (key.clone(), value.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Some(RawDelivery {
                    queue: queue.to_string(),
                    body: received.body().unwrap_or_default().as_bytes().to_vec(),
                    headers,
                    token: DeliveryToken::Receipt {
                        queue_url: url.clone(),
                        receipt_handle,
                    },
                })
            })
            .collect();
        Ok(deliveries)
    }
}

/// Client for Amazon SQS and API-compatible services.
pub struct SqsClient {
    options: SqsOptions,
    runtime: Runtime,
    session: Mutex<Option<SqsSession>>,
}

impl SqsClient {
    pub fn new(options: SqsOptions) -> Result<Self, BrokerError> {
        Ok(Self {
            options,
            runtime: build_runtime(BACKEND)?,
            session: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &SqsOptions {
        &self.options
    }

    async fn build_client(options: &SqsOptions) -> Client {
        let region = RegionProviderChain::first_try(options.region.clone().map(Region::new))
            .or_default_provider()
            .or_else("us-east-1");
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
        if let Some(endpoint_url) = &options.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        Client::new(&loader.load().await)
    }
}

impl Receiver for SqsClient {
    fn polling(&self) -> Polling {
        Polling::PerQueue {
            max_wait: Some(MAX_LONG_POLL),
        }
    }

    fn receive(
        &self,
        queues: &[String],
        wait: Option<Duration>,
    ) -> Result<Vec<RawDelivery>, BrokerError> {
        let mut guard = self.session.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| BrokerError::not_connected(BACKEND))?;
        let wait = wait.unwrap_or(MAX_LONG_POLL);
        let mut received = Vec::new();
        for queue in queues {
            let batch = self
                .runtime
                .block_on(session.receive(queue, wait, &self.options))
                .map_err(|reason| BrokerError::Transport(format!("SQS queue {queue}: {reason}")))?;
            received.extend(batch);
        }
        Ok(received)
    }
}

impl BrokerClient for SqsClient {
    fn connect(&self) -> Result<(), BrokerError> {
        let mut guard = self.session.lock();
        if guard.is_some() {
            return Ok(());
        }
        let client = self.runtime.block_on(Self::build_client(&self.options));
        *guard = Some(SqsSession {
            client,
            queue_urls: HashMap::new(),
        });
        debug!(
            "Connected to SQS (endpoint: {})",
            self.options.endpoint_url.as_deref().unwrap_or("default")
        );
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        if self.session.lock().take().is_some() {
            debug!("Disconnected from SQS");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    fn create_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut guard = self.session.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| BrokerError::not_connected(BACKEND))?;
        let url = self
            .runtime
            .block_on(session.queue_url(queue, &self.options))
            .map_err(|reason| BrokerError::queue(queue, reason))?;
        debug!("SQS queue {} available at {}", queue, url);
        Ok(())
    }

    fn destroy_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut guard = self.session.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| BrokerError::not_connected(BACKEND))?;
        self.runtime
            .block_on(session.destroy(queue))
            .map_err(|reason| BrokerError::queue(queue, reason))?;
        debug!("Deleted SQS queue {}", queue);
        Ok(())
    }

    fn publish(&self, message: &Message) -> Result<(), BrokerError> {
        let mut guard = self.session.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| BrokerError::not_connected(BACKEND))?;
        let body = String::from_utf8(message.encode_body()?)
            .map_err(|err| BrokerError::publish(&message.queue, err))?;
        self.runtime
            .block_on(session.publish(message, body, &self.options))
            .map_err(|reason| BrokerError::publish(&message.queue, reason))?;
        debug!("Published message to SQS queue {}", message.queue);
        Ok(())
    }

    fn listen(
        &self,
        queues: &[String],
        time_limit: Option<Duration>,
    ) -> Result<Listen<'_>, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::not_connected(BACKEND));
        }
        Listen::start(self, queues, time_limit)
    }

    fn ack(&self, message: &Message) -> Result<(), BrokerError> {
        let guard = self.session.lock();
        let session = guard
            .as_ref()
            .ok_or_else(|| BrokerError::not_connected(BACKEND))?;
        let (queue_url, receipt_handle) = receipt(message)?;
        self.runtime
            .block_on(
                session
                    .client
                    .delete_message()
                    .queue_url(queue_url)
                    .receipt_handle(receipt_handle)
                    .send(),
            )
            .map(|_| ())
            .map_err(|err| BrokerError::Delivery(DisplayErrorContext(&err).to_string()))
    }

    fn requeue(&self, message: &Message) -> Result<(), BrokerError> {
        let guard = self.session.lock();
        let session = guard
            .as_ref()
            .ok_or_else(|| BrokerError::not_connected(BACKEND))?;
        let (queue_url, receipt_handle) = receipt(message)?;
        self.runtime
            .block_on(
                session
                    .client
                    .change_message_visibility()
                    .queue_url(queue_url)
                    .receipt_handle(receipt_handle)
                    .visibility_timeout(0)
                    .send(),
            )
            .map(|_| ())
            .map_err(|err| BrokerError::Delivery(DisplayErrorContext(&err).to_string()))
    }
}

fn receipt(message: &Message) -> Result<(&str, &str), BrokerError> {
    match message.require_token()? {
        DeliveryToken::Receipt {
            queue_url,
            receipt_handle,
        } => Ok((queue_url, receipt_handle)),
        _ => Err(BrokerError::Delivery(
            "delivery token was not issued by SQS".into(),
        )),
    }
}

/// Whole seconds to long-poll for, within what SQS accepts.
fn wait_seconds(wait: Duration) -> i32 {
    wait.min(MAX_LONG_POLL).as_secs() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(Duration::ZERO, 0)]
    #[case(Duration::from_millis(999), 0)]
    #[case(Duration::from_millis(2500), 2)]
    #[case(Duration::from_secs(20), 20)]
    #[case(Duration::from_secs(90), 20)]
    fn long_poll_is_floored_and_capped(#[case] wait: Duration, #[case] expected: i32) {
        assert_eq!(wait_seconds(wait), expected);
    }

    #[test]
    fn max_messages_is_clamped() {
        assert_eq!(SqsOptions::default().with_max_messages(50).max_messages, 10);
        assert_eq!(SqsOptions::default().with_max_messages(0).max_messages, 1);
    }

    #[test]
    fn foreign_tokens_are_rejected() {
        let local = Message::new("jobs", json!(1));
        assert!(matches!(receipt(&local), Err(BrokerError::Delivery(_))));
    }

    #[test]
    fn operations_require_a_session() {
        let client = SqsClient::new(SqsOptions::default()).unwrap();
        assert!(!client.is_connected());
        assert!(matches!(
            client.publish(&Message::new("jobs", json!(1))),
            Err(BrokerError::Connection(_))
        ));
        assert!(matches!(
            client.listen(&["jobs".to_string()], Some(Duration::ZERO)),
            Err(BrokerError::Connection(_))
        ));
    }
}
