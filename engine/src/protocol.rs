//! Wire protocol frame definitions.
//!
//! Every frame is a tagged JSON object; the `type` field carries the
//! frame kind. These are pure data types shared by the client and server
//! transports.

use crate::{EncodedField, FieldValue, Mutation, MutationMeta, QueryRequest, Record, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Frames sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// Register a live query. `id` is the client's correlation id; the
    /// server answers with a `QUERY_RESULT` carrying the same id.
    #[serde(rename_all = "camelCase")]
    Subscribe { id: u64, query: QueryRequest },

    /// Drop a live query previously registered under `id`.
    #[serde(rename_all = "camelCase")]
    Unsubscribe { id: u64 },

    /// Execute a mutation. Answered with `MUTATE_ACK` or `ERROR`.
    #[serde(rename_all = "camelCase")]
    Mutate {
        id: u64,
        #[serde(flatten)]
        mutation: Mutation,
    },

    /// Keep-alive.
    Ping,
}

/// Frames sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// Initial (and re-sent) result set of a registered query.
    #[serde(rename_all = "camelCase")]
    QueryResult {
        id: u64,
        data: BTreeMap<RecordId, Record>,
    },

    /// Acknowledgement of a mutation. `accepted_values` is `null` when
    /// the mutation was entirely stale (a no-op).
    #[serde(rename_all = "camelCase")]
    MutateAck {
        id: u64,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default)]
        accepted_values: Option<BTreeMap<String, FieldValue>>,
    },

    /// A committed mutation pushed to affected subscribers.
    #[serde(rename_all = "camelCase")]
    Broadcast {
        resource: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource_id: Option<RecordId>,
        procedure: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        payload: BTreeMap<String, EncodedField>,
        /// Present only for broadcast-enabled custom mutations
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        meta: MutationMeta,
    },

    /// Keep-alive response.
    Pong,

    /// An error. `id` correlates to the originating frame when known.
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
}

impl ServerFrame {
    /// Create an error frame.
    pub fn error(code: ErrorCode, message: impl Into<String>, id: Option<u64>) -> Self {
        ServerFrame::Error {
            id,
            code,
            message: message.into(),
        }
    }
}

/// Error codes shared by the frame and HTTP surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidQuery,
    InvalidRequest,
    InvalidResource,
    NotFound,
    Unauthorized,
    InternalServerError,
}
