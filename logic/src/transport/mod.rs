use std::{borrow::Cow, fmt::Debug, future::Future, net::SocketAddr};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Timestamp;
use crate::id::Id;

/// A transport-level address.
///
/// The routing logic never looks inside an endpoint: it stores it, hands it
/// back to the transport, and compares it through [`Endpoint::canonical`].
/// The canonical form keys the endpoint-to-id map, so two endpoints are the
/// same peer address exactly when their canonical bytes are equal.
pub trait Endpoint: Clone + Eq + Debug + Send + Sync + 'static {
    fn canonical(&self) -> Vec<u8>;
}

impl Endpoint for String {
    fn canonical(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl Endpoint for SocketAddr {
    fn canonical(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

/// Object able to deliver a request to an endpoint and await its answer.
// Should use some sort of interior mutability and refcounting:
// a Transport copy must be cheap and sendable between task boundaries.
pub trait Transport: Clone + Send + Sync + 'static {
    type Endpoint: Endpoint;

    /// Future returned when sending a request to another peer
    type Fut: Future<Output = Result<Response<Self::Endpoint>, RpcError>> + Send;

    /// Sends a request to a peer and waits for the response.
    fn send(&self, to: &Self::Endpoint, request: Request) -> Self::Fut;
}

/// A peer as it travels on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeerInfo<E> {
    pub id: Id,
    pub endpoint: E,
}

/// One (subkey, value) pair of a find-value answer.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ValueEntry {
    pub subkey: String,
    pub value: Vec<u8>,
    /// Absolute expiration; `None` marks a publisher-held entry.
    pub expire: Option<Timestamp>,
}

/// Which subkeys of a key a query is after.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SubkeySelect {
    Single(String),
    Many(Vec<String>),
    All,
}

impl SubkeySelect {
    pub fn is_single(&self) -> bool {
        matches!(self, SubkeySelect::Single(_))
    }
}

/// `id` is always the sender's own identifier; receivers use it together
/// with the observed source endpoint to learn about the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Request {
    Ping {
        id: Id,
    },
    Store {
        id: Id,
        idkey: String,
        subkey: String,
        value: Vec<u8>,
        expire: Option<Timestamp>,
    },
    FindNode {
        id: Id,
        target: Id,
    },
    FindValue {
        id: Id,
        target: Id,
        idkey: String,
        subkeys: SubkeySelect,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Response<E> {
    Pong { id: Id },
    Stored,
    Nodes(Vec<PeerInfo<E>>),
    Value(Vec<ValueEntry>),
    // Generic bad response (should never be seen from a correct peer)
    Error,
}

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum RpcError {
    #[error("Peer unreachable")]
    Unreachable,

    #[error("Cannot find peer address")]
    ContactLost,

    #[error("Request timed out")]
    TimedOut,

    #[error("Unknown transport error {0}")]
    Unknown(Cow<'static, str>),
}

impl From<&'static str> for RpcError {
    fn from(x: &'static str) -> Self {
        RpcError::Unknown(Cow::Borrowed(x))
    }
}

impl From<String> for RpcError {
    fn from(x: String) -> Self {
        RpcError::Unknown(Cow::Owned(x))
    }
}
