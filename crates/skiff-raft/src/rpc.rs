//! Protocol message types.
//!
//! The engine speaks six request/response pairs:
//!
//! ```text
//! Leader liveness:      Leader ──Ping───▶ Follower
//! Leader election:      Candidate ──Poll───▶ Member
//! Log replication:      Leader ──Append───▶ Follower
//! Client reads:         Client ──Query───▶ Node (forwarded per consistency)
//! Client writes:        Client ──Commit──▶ Node (forwarded to the leader)
//! Snapshot transfer:    Leader ──Sync───▶ Lagging follower
//! ```
//!
//! Message bodies travel as bincode; each message kind maps to a transport
//! topic so that many resources can share one server.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::member::Uri;
use crate::{LogIndex, Term};

/// Topic names, one per message kind.
pub mod topics {
    /// Leader liveness heartbeat.
    pub const PING: &str = "ping";
    /// Vote request.
    pub const POLL: &str = "poll";
    /// Log replication.
    pub const APPEND: &str = "append";
    /// Client read.
    pub const QUERY: &str = "query";
    /// Client write.
    pub const COMMIT: &str = "commit";
    /// Snapshot transfer.
    pub const SYNC: &str = "sync";
}

/// Read consistency level for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Consistency {
    /// The leader must reconfirm leadership with a heartbeat round before
    /// responding.
    #[default]
    Strong,
    /// The leader answers from local state without reconfirmation.
    Lease,
    /// Any node answers from local state.
    Weak,
}

/// Liveness heartbeat from the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    /// Leader's term.
    pub term: Term,
    /// The leader URI.
    pub leader: Uri,
    /// Index of the leader's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the leader's last log entry.
    pub last_log_term: Term,
    /// Leader's commit index.
    pub commit_index: LogIndex,
}

/// Response to a [`PingRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Responder's term.
    pub term: Term,
    /// True if the responder's log is consistent with the leader's position.
    pub succeeded: bool,
}

/// Vote request from a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    /// Candidate's term.
    pub term: Term,
    /// The candidate URI.
    pub candidate: Uri,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// Response to a [`PollRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    /// Responder's term.
    pub term: Term,
    /// True if the vote was granted.
    pub vote_granted: bool,
}

/// Log replication request from the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Leader's term.
    pub term: Term,
    /// The leader URI.
    pub leader: Uri,
    /// Index of the entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Entries to store. Empty for a heartbeat.
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// Response to an [`AppendRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    /// Responder's term.
    pub term: Term,
    /// True if the entries were accepted.
    pub succeeded: bool,
    /// The responder's last log index. On rejection this is the hint for the
    /// leader's next attempt.
    pub log_index: LogIndex,
}

/// Status of a query or commit response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// The operation completed.
    Ok,
    /// The operation failed; see the error field.
    Error,
}

/// Client read request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Required consistency level.
    pub consistency: Consistency,
    /// Opaque query payload.
    pub payload: Bytes,
}

/// Response to a [`QueryRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Completion status.
    pub status: ResponseStatus,
    /// Query result when `status` is `Ok`.
    pub result: Option<Bytes>,
    /// Error description when `status` is `Error`.
    pub error: Option<String>,
}

/// Client write request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Opaque command payload.
    pub payload: Bytes,
}

/// Response to a [`CommitRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResponse {
    /// Completion status.
    pub status: ResponseStatus,
    /// The consumer's output when `status` is `Ok`.
    pub result: Option<Bytes>,
    /// Error description when `status` is `Error`.
    pub error: Option<String>,
}

/// Snapshot transfer request from the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Leader's term.
    pub term: Term,
    /// The leader URI.
    pub leader: Uri,
    /// The snapshot replaces all entries through this index.
    pub snapshot_index: LogIndex,
    /// Term of the entry at `snapshot_index`.
    pub snapshot_term: Term,
    /// Byte offset of this chunk within the snapshot.
    pub offset: u64,
    /// Snapshot chunk data.
    pub data: Bytes,
    /// True if this is the final chunk.
    pub done: bool,
}

/// Response to a [`SyncRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Responder's term.
    pub term: Term,
    /// True if the chunk was accepted.
    pub succeeded: bool,
}

/// Any protocol request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Liveness heartbeat.
    Ping(PingRequest),
    /// Vote request.
    Poll(PollRequest),
    /// Log replication.
    Append(AppendRequest),
    /// Client read.
    Query(QueryRequest),
    /// Client write.
    Commit(CommitRequest),
    /// Snapshot transfer.
    Sync(SyncRequest),
}

impl Request {
    /// The transport topic for this request kind.
    pub fn topic(&self) -> &'static str {
        match self {
            Request::Ping(_) => topics::PING,
            Request::Poll(_) => topics::POLL,
            Request::Append(_) => topics::APPEND,
            Request::Query(_) => topics::QUERY,
            Request::Commit(_) => topics::COMMIT,
            Request::Sync(_) => topics::SYNC,
        }
    }

    /// A short name for logging.
    pub fn kind(&self) -> &'static str {
        self.topic()
    }
}

/// Any protocol response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Response to a ping.
    Ping(PingResponse),
    /// Response to a poll.
    Poll(PollResponse),
    /// Response to an append.
    Append(AppendResponse),
    /// Response to a query.
    Query(QueryResponse),
    /// Response to a commit.
    Commit(CommitResponse),
    /// Response to a sync.
    Sync(SyncResponse),
}

impl Response {
    /// Builds the failure response matching a request kind. Used when a node
    /// cannot process the request at all (e.g. its context is closed).
    pub fn failure_for(request: &Request, term: Term, error: impl Into<String>) -> Response {
        let error = error.into();
        match request {
            Request::Ping(_) => Response::Ping(PingResponse {
                term,
                succeeded: false,
            }),
            Request::Poll(_) => Response::Poll(PollResponse {
                term,
                vote_granted: false,
            }),
            Request::Append(_) => Response::Append(AppendResponse {
                term,
                succeeded: false,
                log_index: 0,
            }),
            Request::Query(_) => Response::Query(QueryResponse {
                status: ResponseStatus::Error,
                result: None,
                error: Some(error),
            }),
            Request::Commit(_) => Response::Commit(CommitResponse {
                status: ResponseStatus::Error,
                result: None,
                error: Some(error),
            }),
            Request::Sync(_) => Response::Sync(SyncResponse {
                term,
                succeeded: false,
            }),
        }
    }
}

/// Encodes a request for the wire.
pub fn encode_request(request: &Request) -> crate::Result<Bytes> {
    bincode::serialize(request)
        .map(Bytes::from)
        .map_err(|e| crate::Error::Protocol(format!("encode request: {}", e)))
}

/// Decodes a request from the wire.
pub fn decode_request(data: &[u8]) -> crate::Result<Request> {
    bincode::deserialize(data).map_err(|e| crate::Error::Protocol(format!("decode request: {}", e)))
}

/// Encodes a response for the wire.
pub fn encode_response(response: &Response) -> crate::Result<Bytes> {
    bincode::serialize(response)
        .map(Bytes::from)
        .map_err(|e| crate::Error::Protocol(format!("encode response: {}", e)))
}

/// Decodes a response from the wire.
pub fn decode_response(data: &[u8]) -> crate::Result<Response> {
    bincode::deserialize(data)
        .map_err(|e| crate::Error::Protocol(format!("decode response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_requests() -> Vec<Request> {
        vec![
            Request::Ping(PingRequest {
                term: 3,
                leader: "local://m0".into(),
                last_log_index: 10,
                last_log_term: 3,
                commit_index: 9,
            }),
            Request::Poll(PollRequest {
                term: 4,
                candidate: "local://m1".into(),
                last_log_index: 10,
                last_log_term: 3,
            }),
            Request::Append(AppendRequest {
                term: 3,
                leader: "local://m0".into(),
                prev_log_index: 9,
                prev_log_term: 3,
                entries: vec![LogEntry::new(10, 3, Bytes::from("put k=v"))],
                leader_commit: 9,
            }),
            Request::Query(QueryRequest {
                consistency: Consistency::Strong,
                payload: Bytes::from("get k"),
            }),
            Request::Commit(CommitRequest {
                payload: Bytes::from("put k=v"),
            }),
            Request::Sync(SyncRequest {
                term: 3,
                leader: "local://m0".into(),
                snapshot_index: 100,
                snapshot_term: 2,
                offset: 0,
                data: Bytes::from("blob"),
                done: true,
            }),
        ]
    }

    #[test]
    fn test_request_roundtrip() {
        for request in sample_requests() {
            let encoded = encode_request(&request).unwrap();
            let decoded = decode_request(&encoded).unwrap();
            assert_eq!(request, decoded);
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let responses = vec![
            Response::Ping(PingResponse {
                term: 3,
                succeeded: true,
            }),
            Response::Poll(PollResponse {
                term: 4,
                vote_granted: false,
            }),
            Response::Append(AppendResponse {
                term: 3,
                succeeded: false,
                log_index: 7,
            }),
            Response::Query(QueryResponse {
                status: ResponseStatus::Ok,
                result: Some(Bytes::from("v")),
                error: None,
            }),
            Response::Commit(CommitResponse {
                status: ResponseStatus::Error,
                result: None,
                error: Some("no known leader".into()),
            }),
            Response::Sync(SyncResponse {
                term: 3,
                succeeded: true,
            }),
        ];

        for response in responses {
            let encoded = encode_response(&response).unwrap();
            let decoded = decode_response(&encoded).unwrap();
            assert_eq!(response, decoded);
        }
    }

    #[test]
    fn test_topics() {
        let topics: Vec<_> = sample_requests().iter().map(|r| r.topic()).collect();
        assert_eq!(topics, vec!["ping", "poll", "append", "query", "commit", "sync"]);
    }

    #[test]
    fn test_default_consistency() {
        assert_eq!(Consistency::default(), Consistency::Strong);
    }

    #[test]
    fn test_failure_for() {
        let request = Request::Commit(CommitRequest {
            payload: Bytes::from("x"),
        });
        match Response::failure_for(&request, 5, "context closed") {
            Response::Commit(resp) => {
                assert_eq!(resp.status, ResponseStatus::Error);
                assert_eq!(resp.error.as_deref(), Some("context closed"));
            }
            other => panic!("unexpected response {:?}", other),
        }

        let request = Request::Poll(PollRequest {
            term: 1,
            candidate: "local://m1".into(),
            last_log_index: 0,
            last_log_term: 0,
        });
        match Response::failure_for(&request, 5, "closed") {
            Response::Poll(resp) => {
                assert!(!resp.vote_granted);
                assert_eq!(resp.term, 5);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode_request(b"\xff\xff\xff\xff garbage").is_err());
    }
}
