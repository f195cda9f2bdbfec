//! Building a client from a broker URI.
//!
//! | scheme            | backend                                             |
//! |-------------------|-----------------------------------------------------|
//! | `amqp`, `amqps`   | [`AmqpClient`](crate::adapters::amqp::AmqpClient), URI handed to lapin as is |
//! | `sqs`             | [`SqsClient`](crate::adapters::sqs::SqsClient): `sqs://[region][?endpoint=..&visibility_timeout=..&max_messages=..]` |
//! | `memory`          | a fresh in-memory broker: `memory://[?visibility_timeout=..]` |

use std::time::Duration;

use url::Url;

use crate::memory::MemoryBroker;
use crate::{BrokerClient, BrokerError};

pub fn client_from_uri(uri: &str) -> Result<Box<dyn BrokerClient>, BrokerError> {
    let parsed = Url::parse(uri).map_err(|err| BrokerError::InvalidUri(format!("{uri}: {err}")))?;
    match parsed.scheme() {
        "amqp" | "amqps" => amqp_client(uri),
        "sqs" => sqs_client(&parsed),
        "memory" => {
            let broker = match query_seconds(&parsed, "visibility_timeout")? {
                Some(timeout) => MemoryBroker::with_visibility_timeout(timeout),
                None => MemoryBroker::new(),
            };
            Ok(Box::new(broker.client()))
        }
        other => Err(BrokerError::UnsupportedScheme(other.to_string())),
    }
}

#[cfg(feature = "amqp")]
fn amqp_client(uri: &str) -> Result<Box<dyn BrokerClient>, BrokerError> {
    Ok(Box::new(crate::adapters::amqp::AmqpClient::new(uri)?))
}

#[cfg(not(feature = "amqp"))]
fn amqp_client(_uri: &str) -> Result<Box<dyn BrokerClient>, BrokerError> {
    Err(BrokerError::FeatureDisabled("amqp"))
}

#[cfg(feature = "sqs")]
fn sqs_client(parsed: &Url) -> Result<Box<dyn BrokerClient>, BrokerError> {
    use crate::adapters::sqs::{SqsClient, SqsOptions};

    let mut options = SqsOptions::default();
    if let Some(region) = parsed.host_str().filter(|host| !host.is_empty()) {
        options = options.with_region(region);
    }
    if let Some(endpoint) = query_value(parsed, "endpoint") {
        options = options.with_endpoint_url(endpoint);
    }
    if let Some(timeout) = query_seconds(parsed, "visibility_timeout")? {
        options = options.with_visibility_timeout(timeout);
    }
    if let Some(max) = query_value(parsed, "max_messages") {
        let max = max
            .parse()
            .map_err(|_| BrokerError::InvalidUri(format!("max_messages must be a number, got {max}")))?;
        options = options.with_max_messages(max);
    }
    Ok(Box::new(SqsClient::new(options)?))
}

#[cfg(not(feature = "sqs"))]
fn sqs_client(_parsed: &Url) -> Result<Box<dyn BrokerClient>, BrokerError> {
    Err(BrokerError::FeatureDisabled("sqs"))
}

fn query_value(parsed: &Url, key: &str) -> Option<String> {
    parsed
        .query_pairs()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
}

fn query_seconds(parsed: &Url, key: &str) -> Result<Option<Duration>, BrokerError> {
    query_value(parsed, key)
        .map(|value| {
            value
                .parse::<f64>()
                .ok()
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64)
                .ok_or_else(|| {
                    BrokerError::InvalidUri(format!("{key} must be a non-negative number of seconds, got {value}"))
                })
        })
        .transpose()
}

/// The URI with any password removed, for logging.
pub fn redacted(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(_) => uri.to_string(),
        Err(_) => "<invalid uri>".to_string(),
    }
}
