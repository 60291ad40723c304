//! Tagged messages crossing the page/worker boundary.
//!
//! The two contexts share no memory; everything they exchange is one of
//! these serde-serializable messages, delivered over a channel that stands
//! in for the structured-clone message port. The `type` tag values are the
//! wire protocol and must not change.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{SearchResult, SyncPayload};

/// Messages posted by the page to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Readiness probe; the worker answers the source with `PONG`.
    #[serde(rename = "PING")]
    Ping,
    /// The page observed `PONG`; the worker may drain buffered work.
    #[serde(rename = "CLIENT_READY")]
    ClientReady,
    /// Legacy sync trigger carrying a full payload.
    #[serde(rename = "SYNC_DATA")]
    SyncData { payload: SyncPayload },
    /// Legacy sync trigger carrying bare results.
    #[serde(rename = "CACHE_NEW_ENTRY")]
    CacheNewEntry { results: Vec<SearchResult> },
}

/// Messages posted by the worker to a page client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Handshake answer, addressed to the `PING` source.
    #[serde(rename = "PONG")]
    Pong,
    /// A submission was accepted by the webhook.
    #[serde(rename = "SYNC_SUCCESS")]
    SyncSuccess,
    /// A legacy sync message was taken in.
    #[serde(rename = "SYNC_RECEIVED")]
    SyncReceived,
}

/// A page-side message port the worker can address replies to.
pub type ClientPort = mpsc::UnboundedSender<WorkerMessage>;

/// A client message together with the port of the page that sent it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: ClientMessage,
    pub source: ClientPort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_tags() {
        let ping = serde_json::to_value(ClientMessage::Ping).unwrap();
        assert_eq!(ping["type"], "PING");

        let ready = serde_json::to_value(ClientMessage::ClientReady).unwrap();
        assert_eq!(ready["type"], "CLIENT_READY");

        let entry = serde_json::to_value(ClientMessage::CacheNewEntry { results: vec![] }).unwrap();
        assert_eq!(entry["type"], "CACHE_NEW_ENTRY");
        assert!(entry["results"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_worker_message_wire_tags() {
        for (msg, tag) in [
            (WorkerMessage::Pong, "PONG"),
            (WorkerMessage::SyncSuccess, "SYNC_SUCCESS"),
            (WorkerMessage::SyncReceived, "SYNC_RECEIVED"),
        ] {
            let v = serde_json::to_value(msg).unwrap();
            assert_eq!(v["type"], tag);
        }
    }

    #[test]
    fn test_tag_roundtrip() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"PING"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }
}
