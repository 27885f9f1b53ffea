use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::scope::ScopeId;
use super::value::Value;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("message channel closed while sending {0}")]
    Closed(String),
}

/// One-way, ordered, named-message transport between the host and the script side.
///
/// `scope` names the document the message concerns: the target when the host sends, the
/// source when a document sends.
pub trait MessageChannel: Send + Sync {
    fn send(&self, scope: ScopeId, name: &str, args: Vec<Value>) -> Result<(), ChannelError>;
}

/// A message as delivered to the receiving side.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub scope: ScopeId,
    pub name: String,
    pub args: Vec<Value>,
}

/// Sending half of an in-process link.
#[derive(Clone)]
pub struct MemoryChannel {
    tx: UnboundedSender<Envelope>,
}

impl MessageChannel for MemoryChannel {
    fn send(&self, scope: ScopeId, name: &str, args: Vec<Value>) -> Result<(), ChannelError> {
        self.tx
            .send(Envelope {
                scope,
                name: name.to_string(),
                args,
            })
            .map_err(|_| ChannelError::Closed(name.to_string()))
    }
}

/// Receiving half of an in-process link.
pub struct Inbox {
    rx: UnboundedReceiver<Envelope>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

/// Both directions of an in-process link, seen from one side.
pub struct LinkEndpoint {
    pub outbound: MemoryChannel,
    pub inbox: Inbox,
}

/// Build a connected pair of endpoints: `(host, script)`.
///
/// Messages the host sends arrive in the script endpoint's inbox and vice versa, in send
/// order per direction.
pub fn memory_link() -> (LinkEndpoint, LinkEndpoint) {
    let (to_script_tx, to_script_rx) = unbounded_channel();
    let (to_host_tx, to_host_rx) = unbounded_channel();
    let host = LinkEndpoint {
        outbound: MemoryChannel { tx: to_script_tx },
        inbox: Inbox { rx: to_host_rx },
    };
    let script = LinkEndpoint {
        outbound: MemoryChannel { tx: to_host_tx },
        inbox: Inbox { rx: to_script_rx },
    };
    (host, script)
}
