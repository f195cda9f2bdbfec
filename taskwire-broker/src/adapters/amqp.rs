//! AMQP 0-9-1 backend built on `lapin`.
//!
//! Messages go through the default exchange with the queue name as routing
//! key. Unacked deliveries return to their queue when the channel closes.

use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{select_all, SelectAll, Stream, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use uuid::Uuid;

use crate::adapters::build_runtime;
use crate::listen::{Listen, Polling, Receiver};
use crate::uri::redacted;
use crate::{BrokerClient, BrokerError, DeliveryToken, Headers, Message, RawDelivery};

const BACKEND: &str = "AMQP";

type DeliveryStream = Pin<Box<dyn Stream<Item = (String, lapin::Result<Delivery>)> + Send>>;

#[derive(Debug, Clone)]
pub struct AmqpOptions {
    /// Unacked deliveries the broker may push to this client at once.
    pub prefetch_count: u16,
    pub consumer_tag_prefix: String,
}

impl Default for AmqpOptions {
    fn default() -> Self {
        Self {
            prefetch_count: 1,
            consumer_tag_prefix: "taskwire".into(),
        }
    }
}

impl AmqpOptions {
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count.max(1);
        self
    }

    pub fn with_consumer_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_tag_prefix = prefix.into();
        self
    }
}

/// What to do with the running consumers before receiving from `queues`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumerPlan {
    Keep,
    Start,
    Replace,
}

fn consumer_plan(current: Option<&[String]>, queues: &[String]) -> ConsumerPlan {
    match current {
        None => ConsumerPlan::Start,
        Some(current) if current == queues => ConsumerPlan::Keep,
        Some(_) => ConsumerPlan::Replace,
    }
}

struct Consumers {
    queues: Vec<String>,
    tags: Vec<String>,
    stream: SelectAll<DeliveryStream>,
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
    consumers: Option<Consumers>,
}

impl AmqpSession {
    async fn open(uri: &str, options: &AmqpOptions) -> Result<Self, BrokerError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(connection_error)?;
        let channel = connection.create_channel().await.map_err(connection_error)?;
        channel
            .basic_qos(options.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(connection_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(connection_error)?;
        Ok(Self {
            connection,
            channel,
            consumers: None,
        })
    }

    async fn close(self) -> Result<(), BrokerError> {
        self.connection
            .close(200, "client disconnect")
            .await
            .map_err(connection_error)
    }

    async fn declare(&self, queue: &str) -> lapin::Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
    }

    async fn publish(&self, message: &Message, body: Vec<u8>) -> Result<(), BrokerError> {
        let queue = message.queue.as_str();
        self.declare(queue)
            .await
            .map_err(|err| BrokerError::publish(queue, err))?;

        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_headers(headers_to_table(&message.headers));
        let confirmation = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), &body, properties)
            .await
            .map_err(|err| BrokerError::publish(queue, err))?
            .await
            .map_err(|err| BrokerError::publish(queue, err))?;
        if confirmation.is_nack() {
            return Err(BrokerError::publish(queue, "broker nacked the message"));
        }
        Ok(())
    }

    async fn receive(
        &mut self,
        queues: &[String],
        wait: Option<Duration>,
        options: &AmqpOptions,
    ) -> Result<Vec<RawDelivery>, BrokerError> {
        let channel = self.channel.id();
        let plan = consumer_plan(
            self.consumers.as_ref().map(|consumers| consumers.queues.as_slice()),
            queues,
        );

        if wait.is_some_and(|wait| wait.is_zero()) {
            let mut received = Vec::new();
            match plan {
                ConsumerPlan::Keep => {
                    if let Some(consumers) = self.consumers.as_mut() {
                        while let Ok(Some(item)) =
                            tokio::time::timeout(Duration::ZERO, consumers.stream.next()).await
                        {
                            received.push(into_raw(channel, item)?);
                        }
                    }
                }
                ConsumerPlan::Replace => self.cancel_consumers().await,
                ConsumerPlan::Start => {}
            }
            for queue in queues {
                self.declare(queue).await.map_err(transport_error)?;
                let fetched = self
                    .channel
                    .basic_get(queue, BasicGetOptions { no_ack: false })
                    .await
                    .map_err(transport_error)?;
                if let Some(fetched) = fetched {
                    received.push(raw_delivery(channel, queue.clone(), fetched.delivery));
                }
            }
            return Ok(received);
        }

        if plan != ConsumerPlan::Keep {
            self.replace_consumers(queues, options).await?;
        }
        let Some(consumers) = self.consumers.as_mut() else {
            return Ok(Vec::new());
        };

        let next = consumers.stream.next();
        let item = match wait {
            None => next.await,
            Some(wait) => match tokio::time::timeout(wait, next).await {
                Ok(item) => item,
                Err(_) => return Ok(Vec::new()),
            },
        };
        match item {
            Some(item) => Ok(vec![into_raw(channel, item)?]),
            None => {
                self.consumers = None;
                Err(BrokerError::Transport(
                    "AMQP consumers were cancelled by the broker".into(),
                ))
            }
        }
    }

    /// Cancel the running consumers and hand their prefetched deliveries
    /// back to the broker.
    async fn cancel_consumers(&mut self) {
        let Some(mut previous) = self.consumers.take() else {
            return;
        };
        for tag in &previous.tags {
            if let Err(err) = self
                .channel
                .basic_cancel(tag, BasicCancelOptions::default())
                .await
            {
                warn!("Failed to cancel AMQP consumer {}: {}", tag, err);
            }
        }

        let options = BasicNackOptions {
            multiple: false,
            requeue: true,
        };
        while let Ok(Some((queue, delivery))) =
            tokio::time::timeout(Duration::ZERO, previous.stream.next()).await
        {
            let Ok(delivery) = delivery else {
                continue;
            };
            if let Err(err) = self.channel.basic_nack(delivery.delivery_tag, options).await {
                warn!("Failed to return prefetched delivery to AMQP queue {}: {}", queue, err);
            }
        }
        debug!("Cancelled AMQP consumers on {:?}", previous.queues);
    }

    async fn replace_consumers(
        &mut self,
        queues: &[String],
        options: &AmqpOptions,
    ) -> Result<(), BrokerError> {
        self.cancel_consumers().await;

        let mut streams: Vec<DeliveryStream> = Vec::with_capacity(queues.len());
        let mut tags = Vec::with_capacity(queues.len());
        for queue in queues {
            self.declare(queue).await.map_err(transport_error)?;
            let tag = format!("{}-{}", options.consumer_tag_prefix, Uuid::new_v4().simple());
            let consumer = self
                .channel
                .basic_consume(
                    queue,
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(transport_error)?;
            let queue = queue.clone();
            streams.push(Box::pin(
                consumer.map(move |delivery| (queue.clone(), delivery)),
            ));
            tags.push(tag);
        }
        debug!("Consuming from AMQP queues {:?}", queues);

        self.consumers = Some(Consumers {
            queues: queues.to_vec(),
            tags,
            stream: select_all(streams),
        });
        Ok(())
    }

    fn delivery_tag(&self, message: &Message) -> Result<u64, BrokerError> {
        match message.require_token()? {
            DeliveryToken::Tag { channel, tag } if *channel == self.channel.id() => Ok(*tag),
            DeliveryToken::Tag { .. } => Err(BrokerError::Delivery(
                "delivery tag belongs to a closed AMQP channel".into(),
            )),
            _ => Err(BrokerError::Delivery(
                "delivery token was not issued by an AMQP broker".into(),
            )),
        }
    }
}

/// Client for RabbitMQ and other AMQP 0-9-1 brokers.
pub struct AmqpClient {
    uri: String,
    options: AmqpOptions,
    runtime: Runtime,
    session: Mutex<Option<AmqpSession>>,
}

impl AmqpClient {
    pub fn new(uri: impl Into<String>) -> Result<Self, BrokerError> {
        Self::with_options(uri, AmqpOptions::default())
    }

    pub fn with_options(uri: impl Into<String>, options: AmqpOptions) -> Result<Self, BrokerError> {
        Ok(Self {
            uri: uri.into(),
            options,
            runtime: build_runtime(BACKEND)?,
            session: Mutex::new(None),
        })
    }
}

impl Receiver for AmqpClient {
    fn polling(&self) -> Polling {
        Polling::Multiplexed
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
        self.runtime
            .block_on(session.receive(queues, wait, &self.options))
    }
}

impl BrokerClient for AmqpClient {
    fn connect(&self) -> Result<(), BrokerError> {
        let mut guard = self.session.lock();
        if guard.is_some() {
            return Ok(());
        }
        let session = self
            .runtime
            .block_on(AmqpSession::open(&self.uri, &self.options))?;
        *guard = Some(session);
        debug!("Connected to AMQP broker {}", redacted(&self.uri));
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        self.runtime.block_on(session.close())?;
        debug!("Disconnected from AMQP broker {}", redacted(&self.uri));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    fn create_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let guard = self.session.lock();
        let session = guard
            .as_ref()
            .ok_or_else(|| BrokerError::not_connected(BACKEND))?;
        self.runtime
            .block_on(session.declare(queue))
            .map_err(|err| BrokerError::queue(queue, err))?;
        debug!("Declared AMQP queue {}", queue);
        Ok(())
    }

    fn destroy_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let guard = self.session.lock();
        let session = guard
            .as_ref()
            .ok_or_else(|| BrokerError::not_connected(BACKEND))?;
        self.runtime
            .block_on(
                session
                    .channel
                    .queue_delete(queue, QueueDeleteOptions::default()),
            )
            .map_err(|err| BrokerError::queue(queue, err))?;
        debug!("Deleted AMQP queue {}", queue);
        Ok(())
    }

    fn publish(&self, message: &Message) -> Result<(), BrokerError> {
        let guard = self.session.lock();
        let session = guard
            .as_ref()
            .ok_or_else(|| BrokerError::not_connected(BACKEND))?;
        let body = message.encode_body()?;
        self.runtime.block_on(session.publish(message, body))?;
        debug!("Published message to AMQP queue {}", message.queue);
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
        let tag = session.delivery_tag(message)?;
        self.runtime
            .block_on(session.channel.basic_ack(tag, BasicAckOptions::default()))
            .map_err(|err| BrokerError::Delivery(err.to_string()))
    }

    fn requeue(&self, message: &Message) -> Result<(), BrokerError> {
        let guard = self.session.lock();
        let session = guard
            .as_ref()
            .ok_or_else(|| BrokerError::not_connected(BACKEND))?;
        let tag = session.delivery_tag(message)?;
        let options = BasicNackOptions {
            multiple: false,
            requeue: true,
        };
        self.runtime
            .block_on(session.channel.basic_nack(tag, options))
            .map_err(|err| BrokerError::Delivery(err.to_string()))
    }
}

fn connection_error(err: lapin::Error) -> BrokerError {
    BrokerError::Connection(format!("AMQP: {err}"))
}

fn transport_error(err: lapin::Error) -> BrokerError {
    BrokerError::Transport(format!("AMQP: {err}"))
}

fn into_raw(channel: u16, item: (String, lapin::Result<Delivery>)) -> Result<RawDelivery, BrokerError> {
    let (queue, delivery) = item;
    Ok(raw_delivery(channel, queue, delivery.map_err(transport_error)?))
}

fn raw_delivery(channel: u16, queue: String, delivery: Delivery) -> RawDelivery {
    RawDelivery {
        queue,
        headers: headers_from(&delivery.properties),
        token: DeliveryToken::Tag {
            channel,
            tag: delivery.delivery_tag,
        },
        body: delivery.data,
    }
}

fn headers_to_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

fn headers_from(properties: &BasicProperties) -> Headers {
    properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_value(value).map(|value| (key.as_str().to_string(), value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        AMQPValue::ShortString(value) => Some(value.as_str().to_string()),
        AMQPValue::Boolean(value) => Some(value.to_string()),
        AMQPValue::LongInt(value) => Some(value.to_string()),
        AMQPValue::LongLongInt(value) => Some(value.to_string()),
        _ => None,
    }
}
