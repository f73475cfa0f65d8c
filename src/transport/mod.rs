//! Command execution and pub/sub against sentinels and data nodes.
//!
//! The resolver never speaks the wire protocol itself. It consumes a
//! [`SentinelTransport`], which can:
//!
//! - run a batch of commands against an endpoint in one round trip,
//! - open a long-lived subscription to a channel on an endpoint.
//!
//! [`RedisTransport`] implements both with the `redis` crate. Tests use
//! [`MockTransport`](crate::testing::MockTransport).

pub mod redis;

pub use self::redis::RedisTransport;

use crate::error::TransportError;
use crate::types::{Address, Endpoint};
use async_trait::async_trait;
use std::collections::HashMap;

/// A command and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    /// Create a command with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `SENTINEL get-master-addr-by-name <name>`
    pub fn get_master_addr_by_name(master_name: &str) -> Self {
        Self::new("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(master_name)
    }

    /// `SENTINEL slaves <name>`
    pub fn replicas(master_name: &str) -> Self {
        Self::new("SENTINEL").arg("slaves").arg(master_name)
    }

    /// `SENTINEL sentinels <name>`
    pub fn sentinels(master_name: &str) -> Self {
        Self::new("SENTINEL").arg("sentinels").arg(master_name)
    }

    /// `ROLE`
    pub fn role() -> Self {
        Self::new("ROLE")
    }

    /// Sub-command, lowercased, if this is a `SENTINEL` command.
    pub fn sentinel_subcommand(&self) -> Option<String> {
        if self.name.eq_ignore_ascii_case("SENTINEL") {
            self.args.first().map(|s| s.to_ascii_lowercase())
        } else {
            None
        }
    }
}

/// A structured reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Int(i64),
    Bulk(String),
    Status(String),
    Array(Vec<Reply>),
    Error(String),
}

impl Reply {
    /// Build an array of bulk strings.
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Reply::Array(items.into_iter().map(|s| Reply::Bulk(s.into())).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Bulk(s) | Reply::Status(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// Read a flattened `[k1, v1, k2, v2, ...]` array into a map.
    pub fn to_field_map(&self) -> Option<HashMap<String, String>> {
        let items = self.as_array()?;
        let mut fields = HashMap::with_capacity(items.len() / 2);
        for pair in items.chunks_exact(2) {
            let key = pair[0].as_str()?;
            let value = match &pair[1] {
                Reply::Int(n) => n.to_string(),
                other => other.as_str()?.to_string(),
            };
            fields.insert(key.to_string(), value);
        }
        Some(fields)
    }

    /// Read the `ip`/`port` fields of a flattened instance description.
    pub fn to_instance_address(&self) -> Option<Address> {
        let fields = self.to_field_map()?;
        let host = fields.get("ip")?;
        let port = fields.get("port")?.parse().ok()?;
        Some(Address::new(host.clone(), port))
    }
}

/// A message received on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Message kind: `message` for channel messages, `pmessage` for patterns.
    pub kind: String,
    pub channel: String,
    pub payload: String,
}

impl PubSubMessage {
    /// A plain channel message.
    pub fn message(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// An open subscription.
#[async_trait]
pub trait MessageStream: Send {
    /// Wait for the next message. None once the subscription has ended.
    async fn next_message(&mut self) -> Option<PubSubMessage>;

    /// Release the subscription.
    async fn close(&mut self);
}

/// Transport used by the resolver to reach sentinels and data nodes.
#[async_trait]
pub trait SentinelTransport: Send + Sync + 'static {
    /// Run `commands` against `endpoint` as one pipelined round trip.
    ///
    /// Implementations must honour `endpoint.timeout`. Replies are returned
    /// in command order.
    async fn execute(
        &self,
        endpoint: &Endpoint,
        commands: &[Command],
    ) -> Result<Vec<Reply>, TransportError>;

    /// Subscribe to `channel` on `endpoint`.
    async fn subscribe(
        &self,
        endpoint: &Endpoint,
        channel: &str,
    ) -> Result<Box<dyn MessageStream>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_commands() {
        let cmd = Command::get_master_addr_by_name("m1");
        assert_eq!(cmd.name, "SENTINEL");
        assert_eq!(cmd.args, vec!["get-master-addr-by-name", "m1"]);
        assert_eq!(
            cmd.sentinel_subcommand().as_deref(),
            Some("get-master-addr-by-name")
        );
        assert_eq!(Command::role().sentinel_subcommand(), None);
    }

    #[test]
    fn test_instance_address_from_field_array() {
        let reply = Reply::strings(["name", "10.0.0.2:6379", "ip", "10.0.0.2", "port", "6379"]);
        assert_eq!(
            reply.to_instance_address(),
            Some(Address::new("10.0.0.2", 6379))
        );
    }

    #[test]
    fn test_instance_address_rejects_bad_port() {
        let reply = Reply::strings(["ip", "10.0.0.2", "port", "not-a-port"]);
        assert_eq!(reply.to_instance_address(), None);
        assert_eq!(Reply::Nil.to_instance_address(), None);
    }
}
