//! Process configuration shared by the worker and the ingestion API.

use crate::error::WorkerError;
use crate::retry::{RetryPolicy, DEFAULT_MAX_RETRIES};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Immutable configuration, built once at startup and passed by reference.
///
/// Use [`RelayConfig::from_env`] in the binaries or
/// [`RelayConfig::builder`] in code and tests.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub rabbitmq_host: String,
    pub rabbitmq_port: u16,
    pub rabbitmq_user: String,
    pub rabbitmq_password: String,
    pub rabbitmq_vhost: String,
    /// Direct exchange new and retried items are published to.
    pub exchange_name: String,
    /// Routing key binding the main queue (and the DLQ) to their exchanges.
    pub routing_key: String,
    /// The name of the queue to consume messages from.
    pub queue_name: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub retry_policy: RetryPolicy,
    /// The number of messages to fetch from the server at a time (QoS prefetch count).
    pub prefetch_count: u16,
    pub consumer_tag: String,
    /// Pause between reconnect attempts of the worker supervisor.
    pub reconnect_delay: Duration,
    pub api_bind_addr: SocketAddr,
    /// Probability that the simulated mail delivery fails.
    pub email_failure_rate: f64,
}

impl RelayConfig {
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Loads configuration from the process environment.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup. Unset
    /// variables fall back to their defaults; unparseable ones are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, WorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(host) = lookup("RABBITMQ_HOST") {
            builder = builder.rabbitmq_host(host);
        }
        if let Some(port) = parse_var(&lookup, "RABBITMQ_PORT")? {
            builder = builder.rabbitmq_port(port);
        }
        if let Some(user) = lookup("RABBITMQ_USER") {
            builder = builder.credentials(user, lookup("RABBITMQ_PASSWORD").unwrap_or_default());
        } else if let Some(password) = lookup("RABBITMQ_PASSWORD") {
            builder = builder.credentials("guest".to_string(), password);
        }
        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            builder = builder.rabbitmq_vhost(vhost);
        }
        if let Some(exchange) = lookup("EMAIL_EXCHANGE") {
            builder = builder.exchange_name(exchange);
        }
        if let Some(key) = lookup("ROUTING_KEY") {
            builder = builder.routing_key(key);
        }
        if let Some(queue) = lookup("EMAIL_QUEUE_NAME") {
            builder = builder.queue_name(queue);
        }
        if let Some(dlx) = lookup("DEAD_LETTER_EXCHANGE") {
            builder = builder.dead_letter_exchange(dlx);
        }
        if let Some(dlq) = lookup("DEAD_LETTER_QUEUE") {
            builder = builder.dead_letter_queue(dlq);
        }
        if let Some(max_retries) = parse_var(&lookup, "MAX_RETRIES")? {
            builder = builder.max_retries(max_retries);
        }
        if let Some(count) = parse_var(&lookup, "PREFETCH_COUNT")? {
            builder = builder.prefetch_count(count);
        }
        if let Some(tag) = lookup("CONSUMER_TAG") {
            builder = builder.consumer_tag(tag);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "RECONNECT_DELAY_SECS")? {
            builder = builder.reconnect_delay(Duration::from_secs(secs));
        }
        if let Some(addr) = parse_var(&lookup, "API_BIND_ADDR")? {
            builder = builder.api_bind_addr(addr);
        }
        if let Some(rate) = parse_var::<f64, _>(&lookup, "EMAIL_FAILURE_RATE")? {
            if !(0.0..=1.0).contains(&rate) {
                return Err(WorkerError::config(format!(
                    "EMAIL_FAILURE_RATE must be between 0 and 1, got {rate}"
                )));
            }
            builder = builder.email_failure_rate(rate);
        }

        Ok(builder.build())
    }

    /// Connection parameters for the configured broker.
    ///
    /// Built field by field, so credentials and vhost are used verbatim and
    /// never go through URI parsing.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.rabbitmq_user.clone(),
                    password: self.rabbitmq_password.clone(),
                },
                host: self.rabbitmq_host.clone(),
                port: self.rabbitmq_port,
            },
            vhost: self.rabbitmq_vhost.clone(),
            ..Default::default()
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, WorkerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| WorkerError::config(format!("invalid value {raw:?} for {name}: {e}"))),
    }
}

/// A builder for creating `RelayConfig` instances.
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    rabbitmq_host: Option<String>,
    rabbitmq_port: Option<u16>,
    credentials: Option<(String, String)>,
    rabbitmq_vhost: Option<String>,
    exchange_name: Option<String>,
    routing_key: Option<String>,
    queue_name: Option<String>,
    dead_letter_exchange: Option<String>,
    dead_letter_queue: Option<String>,
    max_retries: Option<u32>,
    prefetch_count: Option<u16>,
    consumer_tag: Option<String>,
    reconnect_delay: Option<Duration>,
    api_bind_addr: Option<SocketAddr>,
    email_failure_rate: Option<f64>,
}

impl RelayConfigBuilder {
    /// Defaults to `rabbitmq`.
    pub fn rabbitmq_host(mut self, host: String) -> Self {
        self.rabbitmq_host = Some(host);
        self
    }

    /// Defaults to 5672.
    pub fn rabbitmq_port(mut self, port: u16) -> Self {
        self.rabbitmq_port = Some(port);
        self
    }

    /// Defaults to `guest` / `guest`.
    pub fn credentials(mut self, user: String, password: String) -> Self {
        self.credentials = Some((user, password));
        self
    }

    /// Defaults to `/`.
    pub fn rabbitmq_vhost(mut self, vhost: String) -> Self {
        self.rabbitmq_vhost = Some(vhost);
        self
    }

    /// Defaults to `email.exchange`.
    pub fn exchange_name(mut self, exchange_name: String) -> Self {
        self.exchange_name = Some(exchange_name);
        self
    }

    /// Defaults to `email.send`.
    pub fn routing_key(mut self, routing_key: String) -> Self {
        self.routing_key = Some(routing_key);
        self
    }

    /// Defaults to `email_queue`.
    pub fn queue_name(mut self, queue_name: String) -> Self {
        self.queue_name = Some(queue_name);
        self
    }

    /// Defaults to `dlx.email`.
    pub fn dead_letter_exchange(mut self, exchange: String) -> Self {
        self.dead_letter_exchange = Some(exchange);
        self
    }

    /// Defaults to `dlq.email`.
    pub fn dead_letter_queue(mut self, queue: String) -> Self {
        self.dead_letter_queue = Some(queue);
        self
    }

    /// Defaults to 3.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets a custom prefetch count (QoS).
    /// Defaults to 1.
    ///
    /// **Warning:** with a value greater than 1 the broker pushes several
    /// deliveries ahead; they are still processed one at a time.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Defaults to `email_worker`.
    pub fn consumer_tag(mut self, consumer_tag: String) -> Self {
        self.consumer_tag = Some(consumer_tag);
        self
    }

    /// Defaults to 5 seconds.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    /// Defaults to `0.0.0.0:8000`.
    pub fn api_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.api_bind_addr = Some(addr);
        self
    }

    /// Defaults to 0.2.
    pub fn email_failure_rate(mut self, rate: f64) -> Self {
        self.email_failure_rate = Some(rate);
        self
    }

    /// Builds the final `RelayConfig`, applying defaults for any unset options.
    pub fn build(self) -> RelayConfig {
        let (rabbitmq_user, rabbitmq_password) = self
            .credentials
            .unwrap_or_else(|| ("guest".to_string(), "guest".to_string()));

        RelayConfig {
            rabbitmq_host: self.rabbitmq_host.unwrap_or_else(|| "rabbitmq".to_string()),
            rabbitmq_port: self.rabbitmq_port.unwrap_or(5672),
            rabbitmq_user,
            rabbitmq_password,
            rabbitmq_vhost: self.rabbitmq_vhost.unwrap_or_else(|| "/".to_string()),
            exchange_name: self.exchange_name.unwrap_or_else(|| "email.exchange".to_string()),
            routing_key: self.routing_key.unwrap_or_else(|| "email.send".to_string()),
            queue_name: self.queue_name.unwrap_or_else(|| "email_queue".to_string()),
            dead_letter_exchange: self.dead_letter_exchange.unwrap_or_else(|| "dlx.email".to_string()),
            dead_letter_queue: self.dead_letter_queue.unwrap_or_else(|| "dlq.email".to_string()),
            retry_policy: RetryPolicy::new(self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)),
            prefetch_count: self.prefetch_count.unwrap_or(1),
            consumer_tag: self.consumer_tag.unwrap_or_else(|| "email_worker".to_string()),
            reconnect_delay: self.reconnect_delay.unwrap_or(Duration::from_secs(5)),
            api_bind_addr: self
                .api_bind_addr
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8000))),
            email_failure_rate: self.email_failure_rate.unwrap_or(0.2),
        }
    }
}
