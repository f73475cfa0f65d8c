//! [`SentinelTransport`] over the `redis` crate.

use super::{Command, MessageStream, PubSubMessage, Reply, SentinelTransport};
use crate::error::TransportError;
use crate::types::Endpoint;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{Client, ConnectionAddr, ConnectionInfo, Msg, RedisConnectionInfo, Value};
use std::future::Future;
use std::pin::Pin;
use tokio::time::timeout;
use tracing::trace;

/// Opens a fresh connection per call; pooling belongs to the application.
#[derive(Debug, Clone, Default)]
pub struct RedisTransport;

impl RedisTransport {
    pub fn new() -> Self {
        Self
    }

    fn client(endpoint: &Endpoint) -> Result<Client, TransportError> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(endpoint.host.clone(), endpoint.port),
            redis: RedisConnectionInfo {
                password: endpoint.password.clone(),
                ..Default::default()
            },
        };
        Client::open(info).map_err(|e| TransportError::ConnectionFailed {
            addr: endpoint.to_string(),
            reason: e.to_string(),
        })
    }

    async fn connect(endpoint: &Endpoint) -> Result<MultiplexedConnection, TransportError> {
        let client = Self::client(endpoint)?;
        client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                addr: endpoint.to_string(),
                reason: e.to_string(),
            })
    }

    /// Bound `fut` by the endpoint's timeout.
    async fn bounded<T, F>(endpoint: &Endpoint, fut: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        match timeout(endpoint.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(endpoint.to_string())),
        }
    }
}

#[async_trait]
impl SentinelTransport for RedisTransport {
    async fn execute(
        &self,
        endpoint: &Endpoint,
        commands: &[Command],
    ) -> Result<Vec<Reply>, TransportError> {
        trace!(%endpoint, commands = commands.len(), "Executing pipeline");
        Self::bounded(endpoint, async {
            let mut conn = Self::connect(endpoint).await?;
            let mut pipe = redis::pipe();
            for command in commands {
                pipe.cmd(&command.name);
                for arg in &command.args {
                    pipe.arg(arg);
                }
            }
            let values: Vec<Value> = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| TransportError::from_redis(endpoint, e))?;
            Ok::<_, TransportError>(values.into_iter().map(Reply::from).collect())
        })
        .await
    }

    async fn subscribe(
        &self,
        endpoint: &Endpoint,
        channel: &str,
    ) -> Result<Box<dyn MessageStream>, TransportError> {
        let stream = Self::bounded(endpoint, async {
            let client = Self::client(endpoint)?;
            let mut pubsub = client
                .get_async_pubsub()
                .await
                .map_err(|e| TransportError::from_redis(endpoint, e))?;
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| TransportError::from_redis(endpoint, e))?;
            Ok::<_, TransportError>(pubsub.into_on_message())
        })
        .await?;

        Ok(Box::new(RedisMessageStream {
            stream: Some(Box::pin(stream)),
        }))
    }
}

type MsgStream = Pin<Box<dyn Stream<Item = Msg> + Send>>;

struct RedisMessageStream {
    stream: Option<MsgStream>,
}

#[async_trait]
impl MessageStream for RedisMessageStream {
    async fn next_message(&mut self) -> Option<PubSubMessage> {
        loop {
            let msg = self.stream.as_mut()?.next().await?;
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    trace!(error = %e, "Skipping non-string pub/sub payload");
                    continue;
                }
            };
            let kind = if msg.from_pattern() { "pmessage" } else { "message" };
            return Some(PubSubMessage {
                kind: kind.to_string(),
                channel: msg.get_channel_name().to_string(),
                payload,
            });
        }
    }

    async fn close(&mut self) {
        // Dropping the stream drops the pub/sub connection.
        self.stream = None;
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        match value {
            Value::Nil => Reply::Nil,
            Value::Int(n) => Reply::Int(n),
            Value::BulkString(bytes) => Reply::Bulk(String::from_utf8_lossy(&bytes).into_owned()),
            Value::SimpleString(s) => Reply::Status(s),
            Value::Okay => Reply::Status("OK".to_string()),
            Value::Array(items) | Value::Set(items) => {
                Reply::Array(items.into_iter().map(Reply::from).collect())
            }
            Value::Map(pairs) => Reply::Array(
                pairs
                    .into_iter()
                    .flat_map(|(k, v)| [Reply::from(k), Reply::from(v)])
                    .collect(),
            ),
            Value::ServerError(e) => Reply::Error(format!("{:?}", e)),
            other => Reply::Bulk(format!("{:?}", other)),
        }
    }
}
