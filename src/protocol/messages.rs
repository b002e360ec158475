use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::config::MigrationLevel;

/// Payloads of multicast messages, keyed by the name of the client sub-protocol they are
///  serialized for (e.g. `json`, `messagepack`). The relay picks the right one per client.
pub type Payloads = Vec<(String, Bytes)>;

/// Headers of a client's request, a header can have several values
pub type Headers = Vec<(String, Vec<String>)>;

/// Type tag registry of the wire protocol. These values are stable: a tag is never reused for a
///  different message.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    HandshakeRequest = 1,
    HandshakeResponse = 2,
    Ping = 3,
    OpenConnection = 4,
    CloseConnection = 5,
    ConnectionData = 6,
    MultiConnectionData = 7,
    UserData = 8,
    MultiUserData = 9,
    BroadcastData = 10,
    JoinGroup = 11,
    LeaveGroup = 12,
    GroupBroadcastData = 13,
    MultiGroupBroadcastData = 14,
    ServiceError = 15,
    UserJoinGroup = 16,
    UserLeaveGroup = 17,
    JoinGroupWithAck = 18,
    LeaveGroupWithAck = 19,
    Ack = 20,
    CheckUserInGroupWithAck = 21,
    ServiceEvent = 22,
    CheckGroupExistenceWithAck = 23,
    CheckConnectionExistenceWithAck = 24,
    CheckUserExistenceWithAck = 25,
    UserJoinGroupWithAck = 26,
    UserLeaveGroupWithAck = 27,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum ConnectionType {
    /// one of the fixed connections of a pool
    #[default]
    Default = 0,
    /// an additional connection, opened because the service asked for it
    OnDemand = 1,
    /// a connection that relays messages, but never carries client connections
    Weak = 2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum AckStatus {
    Ok = 1,
    NotFound = 2,
    Timeout = 3,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum ServiceEventObjectType {
    Connection = 0,
    User = 1,
    Group = 2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum ServiceEventKind {
    Invalid = 0,
    NotExisted = 1,
    BufferFull = 2,
}

/// The current protocol version, sent as part of the handshake
pub const PROTOCOL_VERSION: i32 = 1;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeRequestData {
    pub version: i32,
    pub connection_type: ConnectionType,
    /// only for on-demand connections: the target the service asked this server to connect to
    pub target: Option<String>,
    pub migration_level: MigrationLevel,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct HandshakeResponseData {
    /// empty on success
    pub error_message: String,
    pub connection_id: Option<String>,
}

/// Pings carry a flat list of key / value strings: `[k1, v1, k2, v2, ...]`. An empty ping is a
///  plain keepalive.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct PingData {
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenConnectionData {
    pub connection_id: String,
    /// (claim type, claim value)
    pub claims: Vec<(String, String)>,
    pub headers: Headers,
    pub query_string: String,
    pub tracing_id: Option<u64>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CloseConnectionData {
    pub connection_id: String,
    pub error_message: String,
    pub headers: Headers,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionPayloadData {
    pub connection_id: String,
    pub payload: Bytes,
    pub tracing_id: Option<u64>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MultiConnectionPayloadData {
    pub connection_ids: Vec<String>,
    pub payloads: Payloads,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserPayloadData {
    pub user_id: String,
    pub payloads: Payloads,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MultiUserPayloadData {
    pub user_ids: Vec<String>,
    pub payloads: Payloads,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BroadcastPayloadData {
    pub excluded: Vec<String>,
    pub payloads: Payloads,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GroupBroadcastPayloadData {
    pub group: String,
    pub excluded: Vec<String>,
    pub payloads: Payloads,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MultiGroupBroadcastPayloadData {
    pub groups: Vec<String>,
    pub payloads: Payloads,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GroupMembershipData {
    pub connection_id: String,
    pub group: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GroupMembershipAckData {
    pub connection_id: String,
    pub group: String,
    pub ack_id: i32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserJoinGroupData {
    pub user_id: String,
    pub group: String,
    /// time to live of the membership in seconds, `None` for an unlimited membership
    pub ttl: Option<i32>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserJoinGroupAckData {
    pub user_id: String,
    pub group: String,
    pub ttl: Option<i32>,
    pub ack_id: i32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserGroupData {
    pub user_id: String,
    pub group: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserGroupAckData {
    pub user_id: String,
    pub group: String,
    pub ack_id: i32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GroupAckData {
    pub group: String,
    pub ack_id: i32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionAckData {
    pub connection_id: String,
    pub ack_id: i32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserAckData {
    pub user_id: String,
    pub ack_id: i32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServiceErrorData {
    pub error_message: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckData {
    pub ack_id: i32,
    pub status: AckStatus,
    pub message: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServiceEventData {
    pub object_type: ServiceEventObjectType,
    pub kind: ServiceEventKind,
    pub id: String,
    pub message: String,
}

/// All messages exchanged between an application server and the service, one variant per
///  [MessageType]
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ServiceMessage {
    HandshakeRequest(HandshakeRequestData),
    HandshakeResponse(HandshakeResponseData),
    Ping(PingData),
    OpenConnection(OpenConnectionData),
    CloseConnection(CloseConnectionData),
    ConnectionData(ConnectionPayloadData),
    MultiConnectionData(MultiConnectionPayloadData),
    UserData(UserPayloadData),
    MultiUserData(MultiUserPayloadData),
    BroadcastData(BroadcastPayloadData),
    JoinGroup(GroupMembershipData),
    LeaveGroup(GroupMembershipData),
    GroupBroadcastData(GroupBroadcastPayloadData),
    MultiGroupBroadcastData(MultiGroupBroadcastPayloadData),
    ServiceError(ServiceErrorData),
    UserJoinGroup(UserJoinGroupData),
    UserLeaveGroup(UserGroupData),
    JoinGroupWithAck(GroupMembershipAckData),
    LeaveGroupWithAck(GroupMembershipAckData),
    Ack(AckData),
    CheckUserInGroupWithAck(UserGroupAckData),
    ServiceEvent(ServiceEventData),
    CheckGroupExistenceWithAck(GroupAckData),
    CheckConnectionExistenceWithAck(ConnectionAckData),
    CheckUserExistenceWithAck(UserAckData),
    UserJoinGroupWithAck(UserJoinGroupAckData),
    UserLeaveGroupWithAck(UserGroupAckData),
}

/// The addressing of an outbound message, which determines the endpoints it is sent to
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageTarget<'a> {
    Broadcast,
    User(&'a str),
    Users(&'a [String]),
    Group(&'a str),
    Groups(&'a [String]),
    Connection(&'a str),
    Connections(&'a [String]),
    /// protocol level messages that belong to a single service connection
    Control,
}

impl ServiceMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServiceMessage::HandshakeRequest(_) => MessageType::HandshakeRequest,
            ServiceMessage::HandshakeResponse(_) => MessageType::HandshakeResponse,
            ServiceMessage::Ping(_) => MessageType::Ping,
            ServiceMessage::OpenConnection(_) => MessageType::OpenConnection,
            ServiceMessage::CloseConnection(_) => MessageType::CloseConnection,
            ServiceMessage::ConnectionData(_) => MessageType::ConnectionData,
            ServiceMessage::MultiConnectionData(_) => MessageType::MultiConnectionData,
            ServiceMessage::UserData(_) => MessageType::UserData,
            ServiceMessage::MultiUserData(_) => MessageType::MultiUserData,
            ServiceMessage::BroadcastData(_) => MessageType::BroadcastData,
            ServiceMessage::JoinGroup(_) => MessageType::JoinGroup,
            ServiceMessage::LeaveGroup(_) => MessageType::LeaveGroup,
            ServiceMessage::GroupBroadcastData(_) => MessageType::GroupBroadcastData,
            ServiceMessage::MultiGroupBroadcastData(_) => MessageType::MultiGroupBroadcastData,
            ServiceMessage::ServiceError(_) => MessageType::ServiceError,
            ServiceMessage::UserJoinGroup(_) => MessageType::UserJoinGroup,
            ServiceMessage::UserLeaveGroup(_) => MessageType::UserLeaveGroup,
            ServiceMessage::JoinGroupWithAck(_) => MessageType::JoinGroupWithAck,
            ServiceMessage::LeaveGroupWithAck(_) => MessageType::LeaveGroupWithAck,
            ServiceMessage::Ack(_) => MessageType::Ack,
            ServiceMessage::CheckUserInGroupWithAck(_) => MessageType::CheckUserInGroupWithAck,
            ServiceMessage::ServiceEvent(_) => MessageType::ServiceEvent,
            ServiceMessage::CheckGroupExistenceWithAck(_) => MessageType::CheckGroupExistenceWithAck,
            ServiceMessage::CheckConnectionExistenceWithAck(_) => MessageType::CheckConnectionExistenceWithAck,
            ServiceMessage::CheckUserExistenceWithAck(_) => MessageType::CheckUserExistenceWithAck,
            ServiceMessage::UserJoinGroupWithAck(_) => MessageType::UserJoinGroupWithAck,
            ServiceMessage::UserLeaveGroupWithAck(_) => MessageType::UserLeaveGroupWithAck,
        }
    }

    /// The ack id of a message that asks for an ack. NB: [ServiceMessage::Ack] itself refers to
    ///  some other message's ack id and is not ack-capable.
    pub fn ack_id(&self) -> Option<i32> {
        match self {
            ServiceMessage::JoinGroupWithAck(d) | ServiceMessage::LeaveGroupWithAck(d) => Some(d.ack_id),
            ServiceMessage::CheckUserInGroupWithAck(d) | ServiceMessage::UserLeaveGroupWithAck(d) => Some(d.ack_id),
            ServiceMessage::CheckGroupExistenceWithAck(d) => Some(d.ack_id),
            ServiceMessage::CheckConnectionExistenceWithAck(d) => Some(d.ack_id),
            ServiceMessage::CheckUserExistenceWithAck(d) => Some(d.ack_id),
            ServiceMessage::UserJoinGroupWithAck(d) => Some(d.ack_id),
            _ => None,
        }
    }

    /// Replaces the ack id of an ack-capable message, returning `false` for other messages
    pub fn set_ack_id(&mut self, ack_id: i32) -> bool {
        let slot = match self {
            ServiceMessage::JoinGroupWithAck(d) | ServiceMessage::LeaveGroupWithAck(d) => &mut d.ack_id,
            ServiceMessage::CheckUserInGroupWithAck(d) | ServiceMessage::UserLeaveGroupWithAck(d) => &mut d.ack_id,
            ServiceMessage::CheckGroupExistenceWithAck(d) => &mut d.ack_id,
            ServiceMessage::CheckConnectionExistenceWithAck(d) => &mut d.ack_id,
            ServiceMessage::CheckUserExistenceWithAck(d) => &mut d.ack_id,
            ServiceMessage::UserJoinGroupWithAck(d) => &mut d.ack_id,
            _ => return false,
        };
        *slot = ack_id;
        true
    }

    pub fn target(&self) -> MessageTarget<'_> {
        match self {
            ServiceMessage::BroadcastData(_) => MessageTarget::Broadcast,

            ServiceMessage::UserData(d) => MessageTarget::User(&d.user_id),
            ServiceMessage::UserJoinGroup(d) => MessageTarget::User(&d.user_id),
            ServiceMessage::UserLeaveGroup(d) => MessageTarget::User(&d.user_id),
            ServiceMessage::UserJoinGroupWithAck(d) => MessageTarget::User(&d.user_id),
            ServiceMessage::UserLeaveGroupWithAck(d) => MessageTarget::User(&d.user_id),
            ServiceMessage::CheckUserInGroupWithAck(d) => MessageTarget::User(&d.user_id),
            ServiceMessage::CheckUserExistenceWithAck(d) => MessageTarget::User(&d.user_id),
            ServiceMessage::MultiUserData(d) => MessageTarget::Users(&d.user_ids),

            ServiceMessage::GroupBroadcastData(d) => MessageTarget::Group(&d.group),
            ServiceMessage::CheckGroupExistenceWithAck(d) => MessageTarget::Group(&d.group),
            ServiceMessage::MultiGroupBroadcastData(d) => MessageTarget::Groups(&d.groups),

            ServiceMessage::OpenConnection(d) => MessageTarget::Connection(&d.connection_id),
            ServiceMessage::CloseConnection(d) => MessageTarget::Connection(&d.connection_id),
            ServiceMessage::ConnectionData(d) => MessageTarget::Connection(&d.connection_id),
            ServiceMessage::JoinGroup(d) | ServiceMessage::LeaveGroup(d) => MessageTarget::Connection(&d.connection_id),
            ServiceMessage::JoinGroupWithAck(d) | ServiceMessage::LeaveGroupWithAck(d) => MessageTarget::Connection(&d.connection_id),
            ServiceMessage::CheckConnectionExistenceWithAck(d) => MessageTarget::Connection(&d.connection_id),
            ServiceMessage::MultiConnectionData(d) => MessageTarget::Connections(&d.connection_ids),

            ServiceMessage::HandshakeRequest(_)
            | ServiceMessage::HandshakeResponse(_)
            | ServiceMessage::Ping(_)
            | ServiceMessage::ServiceError(_)
            | ServiceMessage::Ack(_)
            | ServiceMessage::ServiceEvent(_) => MessageTarget::Control,
        }
    }
}
