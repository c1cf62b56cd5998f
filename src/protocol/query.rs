//! Wire messages: one JSON object per line
//!
//! Every message carries its operation code in `q` and, for correlated
//! operations, the request id in `rid`. The payload shape is fixed by the
//! code, so each family of codes is its own [`QueryBody`] variant.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::node::{Member, NodeId, NodeInfo};
use crate::common::{Error, ErrorCode, Result};
use crate::protocol::query_type::QueryType;

/// A message exchanged between nodes. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(rename = "rid", default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(flatten)]
    pub body: QueryBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "q")]
pub enum QueryBody {
    // === Datastore / collection operations ===
    #[serde(rename = "CREATE-DS", alias = "CREATE-DB")]
    CreateDatastore { datastore: String },
    #[serde(rename = "DROP-DS", alias = "DROP-DB")]
    DropDatastore { datastore: String },
    #[serde(rename = "LIST-DS")]
    ListDatastores,
    #[serde(rename = "CREATE-COLLECTION", alias = "CREATE-TABLE")]
    CreateCollection {
        datastore: String,
        collection: String,
        #[serde(default)]
        schema: Value,
    },
    #[serde(rename = "DROP-COLLECTION", alias = "DROP-TABLE")]
    DropCollection {
        datastore: String,
        collection: String,
    },
    #[serde(rename = "LIST-COLLECTIONS", alias = "LIST-TABLES")]
    ListCollections { datastore: String },
    #[serde(rename = "INSERT")]
    Insert {
        datastore: String,
        collection: String,
        records: Vec<Record>,
    },

    // === Master -> participant finalization ===
    #[serde(rename = "C")]
    Commit,
    #[serde(rename = "R")]
    Rollback,

    // === Participant -> master acknowledgements ===
    #[serde(rename = "SCS")]
    SoftCommitSuccess,
    #[serde(rename = "CS")]
    CommitSuccess,
    #[serde(rename = "RS")]
    RollbackSuccess,
    #[serde(rename = "QR")]
    QueryResponse(Response),

    // === Cluster administration ===
    #[serde(rename = "NODE-ID")]
    NodeId(Member),
    #[serde(rename = "ADD-NODE")]
    AddNode { address: String },
    #[serde(rename = "LIST-NODES")]
    ListNodes,
    #[serde(rename = "DROP-NODE")]
    DropNode { node_id: NodeId },

    // === Onboarding ===
    #[serde(rename = "ONB1")]
    Onb1 {
        cluster_id: String,
        members: Vec<Member>,
    },
    #[serde(rename = "ONB1_ACK")]
    Onb1Ack(Ack),
    #[serde(rename = "ONB2")]
    Onb2 { schemas: Vec<DatastoreSchema> },
    #[serde(rename = "ONB2_ACK")]
    Onb2Ack(Ack),
    #[serde(rename = "ONB3")]
    Onb3 { tables: SystemTables },
    #[serde(rename = "ONB3_ACK")]
    Onb3Ack(Ack),
    #[serde(rename = "ONB4")]
    Onb4 { procedures: Vec<ProcedureArtifact> },
    #[serde(rename = "ONB4_ACK")]
    Onb4Ack(Ack),
    #[serde(rename = "ONB5_1")]
    Onb51 { member: Member },
    #[serde(rename = "ONB5_1_ACK")]
    Onb51Ack(Ack),
    #[serde(rename = "ONB5_2")]
    Onb52 { members: Vec<Member> },
    #[serde(rename = "ONB5_2_ACK")]
    Onb52Ack(Ack),
    #[serde(rename = "ONB_SUCCESS")]
    OnbSuccess {
        node_id: NodeId,
        /// Member list at the time the node was added.
        #[serde(default)]
        members: Vec<Member>,
    },

    #[serde(rename = "PING")]
    Ping,
}

impl QueryBody {
    /// Operation code of this body. Aliased codes report their canonical form.
    pub fn query_type(&self) -> QueryType {
        match self {
            QueryBody::CreateDatastore { .. } => QueryType::CreateDs,
            QueryBody::DropDatastore { .. } => QueryType::DropDs,
            QueryBody::ListDatastores => QueryType::ListDs,
            QueryBody::CreateCollection { .. } => QueryType::CreateCollection,
            QueryBody::DropCollection { .. } => QueryType::DropCollection,
            QueryBody::ListCollections { .. } => QueryType::ListCollections,
            QueryBody::Insert { .. } => QueryType::Insert,
            QueryBody::Commit => QueryType::Commit,
            QueryBody::Rollback => QueryType::Rollback,
            QueryBody::SoftCommitSuccess => QueryType::SoftCommitSuccess,
            QueryBody::CommitSuccess => QueryType::CommitSuccess,
            QueryBody::RollbackSuccess => QueryType::RollbackSuccess,
            QueryBody::QueryResponse(_) => QueryType::QueryResponse,
            QueryBody::NodeId(_) => QueryType::NodeId,
            QueryBody::AddNode { .. } => QueryType::AddNode,
            QueryBody::ListNodes => QueryType::ListNodes,
            QueryBody::DropNode { .. } => QueryType::DropNode,
            QueryBody::Onb1 { .. } => QueryType::Onb1,
            QueryBody::Onb1Ack(_) => QueryType::Onb1Ack,
            QueryBody::Onb2 { .. } => QueryType::Onb2,
            QueryBody::Onb2Ack(_) => QueryType::Onb2Ack,
            QueryBody::Onb3 { .. } => QueryType::Onb3,
            QueryBody::Onb3Ack(_) => QueryType::Onb3Ack,
            QueryBody::Onb4 { .. } => QueryType::Onb4,
            QueryBody::Onb4Ack(_) => QueryType::Onb4Ack,
            QueryBody::Onb51 { .. } => QueryType::Onb51,
            QueryBody::Onb51Ack(_) => QueryType::Onb51Ack,
            QueryBody::Onb52 { .. } => QueryType::Onb52,
            QueryBody::Onb52Ack(_) => QueryType::Onb52Ack,
            QueryBody::OnbSuccess { .. } => QueryType::OnbSuccess,
            QueryBody::Ping => QueryType::Ping,
        }
    }

    /// Read-only operations run immediately and are never registered.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            QueryBody::ListDatastores | QueryBody::ListCollections { .. }
        )
    }

    /// The ACK payload of an onboarding acknowledgement.
    pub fn onboarding_ack(&self) -> Option<&Ack> {
        match self {
            QueryBody::Onb1Ack(ack)
            | QueryBody::Onb2Ack(ack)
            | QueryBody::Onb3Ack(ack)
            | QueryBody::Onb4Ack(ack)
            | QueryBody::Onb51Ack(ack)
            | QueryBody::Onb52Ack(ack) => Some(ack),
            _ => None,
        }
    }
}

impl Query {
    pub fn new(request_id: impl Into<String>, body: QueryBody) -> Self {
        Self {
            request_id: request_id.into(),
            body,
        }
    }

    /// A message not correlated with any request.
    pub fn bare(body: QueryBody) -> Self {
        Self::new(String::new(), body)
    }

    pub fn query_type(&self) -> QueryType {
        self.body.query_type()
    }

    /// Reply correlated with this message's request id.
    pub fn reply(&self, body: QueryBody) -> Query {
        Query::new(self.request_id.clone(), body)
    }

    /// Serialize to one line of text (no trailing newline).
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one received line. The operation code is matched case-insensitively.
    pub fn decode(line: &str) -> Result<Query> {
        let mut value: Value = serde_json::from_str(line)
            .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| Error::Protocol("message is not a JSON object".into()))?;
        let code = obj
            .get("q")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("message has no operation code".into()))?;
        let query_type = QueryType::from_code(code)
            .ok_or_else(|| Error::Protocol(format!("unknown operation code: {}", code)))?;
        obj.insert("q".into(), Value::String(query_type.code().to_string()));

        serde_json::from_value(value).map_err(|e| {
            Error::Protocol(format!("unsupported {} message: {}", query_type, e))
        })
    }
}

/// Outcome of one onboarding step on the joining node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            cause: None,
        }
    }

    pub fn failed(cause: impl Into<String>) -> Self {
        Self {
            ok: false,
            cause: Some(cause.into()),
        }
    }

    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Ack::ok(),
            Err(e) => Ack::failed(e.to_string()),
        }
    }
}

/// Generic operation response (`{"ack": true, "rows": 3}`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    pub ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ack: true,
            ..Default::default()
        }
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            ack: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn with_rows(rows: u64) -> Self {
        Self {
            ack: true,
            rows: Some(rows),
            ..Default::default()
        }
    }

    pub fn failure(err: &Error) -> Self {
        Self {
            ack: false,
            code: err.code(),
            cause: Some(match err {
                Error::Operation { message, .. } => message.clone(),
                other => other.to_string(),
            }),
            ..Default::default()
        }
    }

    /// The failure carried by a negative response.
    pub fn to_error(&self) -> Option<Error> {
        if self.ack {
            return None;
        }
        let cause = self.cause.clone().unwrap_or_else(|| "unspecified failure".into());
        Some(match self.code {
            Some(code) => Error::operation(code, cause),
            None => Error::Internal(cause),
        })
    }

    pub fn nodes(nodes: &[NodeInfo]) -> Result<Self> {
        Ok(Self::with_data(serde_json::to_value(nodes)?))
    }
}

/// One row of an INSERT, keyed by the master so every replica agrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub data: Value,
}

/// Schema of one datastore, shipped during ONB2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastoreSchema {
    pub datastore: String,
    pub collections: Vec<CollectionSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    #[serde(default)]
    pub schema: Value,
}

/// System-level tables synced during ONB3.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemTables {
    #[serde(default)]
    pub users: Vec<Value>,
    #[serde(default)]
    pub procedures: Vec<Value>,
}

/// Stored-procedure artifact transferred during ONB4.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureArtifact {
    pub name: String,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
