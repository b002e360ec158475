use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use tracing::trace;

use crate::config::MigrationLevel;
use crate::protocol::messages::*;
use crate::protocol::msgpack::{MsgPackArrayReader, MsgPackWriter};

/// a u32 length needs at most 5 bytes as a varint
const MAX_LENGTH_PREFIX_LEN: usize = 5;

/// Result of decoding a single frame
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Decoded {
    Message(ServiceMessage),
    /// A message type this version does not know. Newer service versions may send those, and
    ///  they are skipped rather than treated as errors.
    Unknown(i64),
}

/// The binary service protocol: every frame is `[varint length][MessagePack array]`, and the
///  array's first element is the [MessageType] tag.
#[derive(Debug, Clone)]
pub struct ServiceProtocol {
    max_frame_size: usize,
}

impl ServiceProtocol {
    pub fn new(max_frame_size: usize) -> ServiceProtocol {
        ServiceProtocol {
            max_frame_size,
        }
    }

    pub fn write_message(&self, msg: &ServiceMessage, buf: &mut BytesMut) -> anyhow::Result<()> {
        let body = encode_body(msg)?;
        if body.len() > self.max_frame_size {
            bail!("message of type {:?} has {} bytes, exceeding the maximum frame size of {}", msg.message_type(), body.len(), self.max_frame_size);
        }

        buf.reserve(body.len() + MAX_LENGTH_PREFIX_LEN);
        buf.put_u32_varint(body.len().try_into()?);
        buf.put_slice(&body);
        Ok(())
    }

    /// Splits the next complete frame off the front of `buf`. Returns `None` if `buf` does not
    ///  contain a complete frame yet, leaving `buf` untouched.
    pub fn try_parse_frame(&self, buf: &mut BytesMut) -> anyhow::Result<Option<Bytes>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let mut peek: &[u8] = buf.as_ref();
        let len = match peek.try_get_u32_varint() {
            Ok(len) => len as usize,
            Err(_) if buf.len() < MAX_LENGTH_PREFIX_LEN => return Ok(None),
            Err(e) => return Err(anyhow!("invalid frame length prefix: {:?}", e)),
        };
        if len > self.max_frame_size {
            bail!("frame of {} bytes exceeds the maximum frame size of {}", len, self.max_frame_size);
        }

        let prefix_len = buf.len() - peek.len();
        if peek.len() < len {
            return Ok(None);
        }

        buf.advance(prefix_len);
        Ok(Some(buf.split_to(len).freeze()))
    }

    pub fn parse_message(&self, frame: &Bytes) -> anyhow::Result<Decoded> {
        decode_body(frame)
    }

    /// Convenience for reading: the next complete message in `buf`, skipping unknown message types
    pub fn try_parse_message(&self, buf: &mut BytesMut) -> anyhow::Result<Option<ServiceMessage>> {
        while let Some(frame) = self.try_parse_frame(buf)? {
            match self.parse_message(&frame)? {
                Decoded::Message(msg) => return Ok(Some(msg)),
                Decoded::Unknown(tag) => trace!("skipping message of unknown type {}", tag),
            }
        }
        Ok(None)
    }
}

fn encode_body(msg: &ServiceMessage) -> anyhow::Result<Vec<u8>> {
    let mut w = MsgPackWriter::new();
    let tag = u8::from(msg.message_type()) as u64;

    match msg {
        ServiceMessage::HandshakeRequest(d) => {
            w.array_len(5)?;
            w.uint(tag)?;
            w.int(d.version.into())?;
            w.int(i32::from(d.connection_type).into())?;
            w.opt_string(d.target.as_deref())?;
            w.int(i32::from(d.migration_level).into())?;
        }
        ServiceMessage::HandshakeResponse(d) => {
            w.array_len(3)?;
            w.uint(tag)?;
            w.string(&d.error_message)?;
            w.opt_string(d.connection_id.as_deref())?;
        }
        ServiceMessage::Ping(d) => {
            w.array_len(2)?;
            w.uint(tag)?;
            w.string_list(&d.messages)?;
        }
        ServiceMessage::OpenConnection(d) => {
            w.array_len(6)?;
            w.uint(tag)?;
            w.string(&d.connection_id)?;
            w.claims(&d.claims)?;
            w.headers(&d.headers)?;
            w.string(&d.query_string)?;
            w.opt_uint(d.tracing_id)?;
        }
        ServiceMessage::CloseConnection(d) => {
            w.array_len(4)?;
            w.uint(tag)?;
            w.string(&d.connection_id)?;
            w.string(&d.error_message)?;
            w.headers(&d.headers)?;
        }
        ServiceMessage::ConnectionData(d) => {
            w.array_len(4)?;
            w.uint(tag)?;
            w.string(&d.connection_id)?;
            w.bin(&d.payload)?;
            w.opt_uint(d.tracing_id)?;
        }
        ServiceMessage::MultiConnectionData(d) => {
            w.array_len(3)?;
            w.uint(tag)?;
            w.string_list(&d.connection_ids)?;
            w.payloads(&d.payloads)?;
        }
        ServiceMessage::UserData(d) => {
            w.array_len(3)?;
            w.uint(tag)?;
            w.string(&d.user_id)?;
            w.payloads(&d.payloads)?;
        }
        ServiceMessage::MultiUserData(d) => {
            w.array_len(3)?;
            w.uint(tag)?;
            w.string_list(&d.user_ids)?;
            w.payloads(&d.payloads)?;
        }
        ServiceMessage::BroadcastData(d) => {
            w.array_len(3)?;
            w.uint(tag)?;
            w.string_list(&d.excluded)?;
            w.payloads(&d.payloads)?;
        }
        ServiceMessage::JoinGroup(d) | ServiceMessage::LeaveGroup(d) => {
            w.array_len(3)?;
            w.uint(tag)?;
            w.string(&d.connection_id)?;
            w.string(&d.group)?;
        }
        ServiceMessage::GroupBroadcastData(d) => {
            w.array_len(4)?;
            w.uint(tag)?;
            w.string(&d.group)?;
            w.string_list(&d.excluded)?;
            w.payloads(&d.payloads)?;
        }
        ServiceMessage::MultiGroupBroadcastData(d) => {
            w.array_len(3)?;
            w.uint(tag)?;
            w.string_list(&d.groups)?;
            w.payloads(&d.payloads)?;
        }
        ServiceMessage::ServiceError(d) => {
            w.array_len(2)?;
            w.uint(tag)?;
            w.string(&d.error_message)?;
        }
        ServiceMessage::UserJoinGroup(d) => {
            w.array_len(4)?;
            w.uint(tag)?;
            w.string(&d.user_id)?;
            w.string(&d.group)?;
            w.opt_int(d.ttl.map(i64::from))?;
        }
        ServiceMessage::UserLeaveGroup(d) => {
            w.array_len(3)?;
            w.uint(tag)?;
            w.string(&d.user_id)?;
            w.string(&d.group)?;
        }
        ServiceMessage::JoinGroupWithAck(d) | ServiceMessage::LeaveGroupWithAck(d) => {
            w.array_len(4)?;
            w.uint(tag)?;
            w.string(&d.connection_id)?;
            w.string(&d.group)?;
            w.int(d.ack_id.into())?;
        }
        ServiceMessage::Ack(d) => {
            w.array_len(4)?;
            w.uint(tag)?;
            w.int(d.ack_id.into())?;
            w.int(i32::from(d.status).into())?;
            w.string(&d.message)?;
        }
        ServiceMessage::CheckUserInGroupWithAck(d) | ServiceMessage::UserLeaveGroupWithAck(d) => {
            w.array_len(4)?;
            w.uint(tag)?;
            w.string(&d.user_id)?;
            w.string(&d.group)?;
            w.int(d.ack_id.into())?;
        }
        ServiceMessage::ServiceEvent(d) => {
            w.array_len(5)?;
            w.uint(tag)?;
            w.int(i32::from(d.object_type).into())?;
            w.int(i32::from(d.kind).into())?;
            w.string(&d.id)?;
            w.string(&d.message)?;
        }
        ServiceMessage::CheckGroupExistenceWithAck(d) => {
            w.array_len(3)?;
            w.uint(tag)?;
            w.string(&d.group)?;
            w.int(d.ack_id.into())?;
        }
        ServiceMessage::CheckConnectionExistenceWithAck(d) => {
            w.array_len(3)?;
            w.uint(tag)?;
            w.string(&d.connection_id)?;
            w.int(d.ack_id.into())?;
        }
        ServiceMessage::CheckUserExistenceWithAck(d) => {
            w.array_len(3)?;
            w.uint(tag)?;
            w.string(&d.user_id)?;
            w.int(d.ack_id.into())?;
        }
        ServiceMessage::UserJoinGroupWithAck(d) => {
            w.array_len(5)?;
            w.uint(tag)?;
            w.string(&d.user_id)?;
            w.string(&d.group)?;
            w.opt_int(d.ttl.map(i64::from))?;
            w.int(d.ack_id.into())?;
        }
    }

    Ok(w.into_inner())
}

fn decode_body(frame: &Bytes) -> anyhow::Result<Decoded> {
    let mut r = MsgPackArrayReader::new(frame)?;
    let tag = r.i64("type")?;

    let message_type = match u8::try_from(tag).ok().and_then(|t| MessageType::try_from(t).ok()) {
        Some(t) => t,
        None => return Ok(Decoded::Unknown(tag)),
    };

    let msg = match message_type {
        MessageType::HandshakeRequest => ServiceMessage::HandshakeRequest(HandshakeRequestData {
            version: r.i32("version")?,
            connection_type: r.trailing(|r| Ok(ConnectionType::try_from(r.i32("connectionType")?)?))?,
            target: r.trailing(|r| r.opt_string("target"))?,
            migration_level: r.trailing(|r| Ok(MigrationLevel::try_from(r.i32("migrationLevel")?)?))?,
        }),
        MessageType::HandshakeResponse => ServiceMessage::HandshakeResponse(HandshakeResponseData {
            error_message: r.string("errorMessage")?,
            connection_id: r.trailing(|r| r.opt_string("connectionId"))?,
        }),
        MessageType::Ping => ServiceMessage::Ping(PingData {
            messages: r.trailing(|r| r.string_list("messages"))?,
        }),
        MessageType::OpenConnection => ServiceMessage::OpenConnection(OpenConnectionData {
            connection_id: r.string("connectionId")?,
            claims: r.claims("claims")?,
            headers: r.trailing(|r| r.headers("headers"))?,
            query_string: r.trailing(|r| r.string("queryString"))?,
            tracing_id: r.trailing(|r| r.opt_u64("tracingId"))?,
        }),
        MessageType::CloseConnection => ServiceMessage::CloseConnection(CloseConnectionData {
            connection_id: r.string("connectionId")?,
            error_message: r.trailing(|r| r.string("errorMessage"))?,
            headers: r.trailing(|r| r.headers("headers"))?,
        }),
        MessageType::ConnectionData => ServiceMessage::ConnectionData(ConnectionPayloadData {
            connection_id: r.string("connectionId")?,
            payload: r.bin("payload")?,
            tracing_id: r.trailing(|r| r.opt_u64("tracingId"))?,
        }),
        MessageType::MultiConnectionData => ServiceMessage::MultiConnectionData(MultiConnectionPayloadData {
            connection_ids: r.string_list("connectionIds")?,
            payloads: r.payloads("payloads")?,
        }),
        MessageType::UserData => ServiceMessage::UserData(UserPayloadData {
            user_id: r.string("userId")?,
            payloads: r.payloads("payloads")?,
        }),
        MessageType::MultiUserData => ServiceMessage::MultiUserData(MultiUserPayloadData {
            user_ids: r.string_list("userIds")?,
            payloads: r.payloads("payloads")?,
        }),
        MessageType::BroadcastData => ServiceMessage::BroadcastData(BroadcastPayloadData {
            excluded: r.string_list("excludedList")?,
            payloads: r.payloads("payloads")?,
        }),
        MessageType::JoinGroup => ServiceMessage::JoinGroup(read_group_membership(&mut r)?),
        MessageType::LeaveGroup => ServiceMessage::LeaveGroup(read_group_membership(&mut r)?),
        MessageType::GroupBroadcastData => ServiceMessage::GroupBroadcastData(GroupBroadcastPayloadData {
            group: r.string("groupName")?,
            excluded: r.string_list("excludedList")?,
            payloads: r.payloads("payloads")?,
        }),
        MessageType::MultiGroupBroadcastData => ServiceMessage::MultiGroupBroadcastData(MultiGroupBroadcastPayloadData {
            groups: r.string_list("groupList")?,
            payloads: r.payloads("payloads")?,
        }),
        MessageType::ServiceError => ServiceMessage::ServiceError(ServiceErrorData {
            error_message: r.string("errorMessage")?,
        }),
        MessageType::UserJoinGroup => ServiceMessage::UserJoinGroup(UserJoinGroupData {
            user_id: r.string("userId")?,
            group: r.string("groupName")?,
            ttl: r.trailing(|r| r.opt_i32("ttl"))?,
        }),
        MessageType::UserLeaveGroup => ServiceMessage::UserLeaveGroup(UserGroupData {
            user_id: r.string("userId")?,
            group: r.string("groupName")?,
        }),
        MessageType::JoinGroupWithAck => ServiceMessage::JoinGroupWithAck(read_group_membership_ack(&mut r)?),
        MessageType::LeaveGroupWithAck => ServiceMessage::LeaveGroupWithAck(read_group_membership_ack(&mut r)?),
        MessageType::Ack => ServiceMessage::Ack(AckData {
            ack_id: r.i32("ackId")?,
            // statuses added by newer services are no definite answer
            status: AckStatus::try_from(r.i32("status")?).unwrap_or(AckStatus::Timeout),
            message: r.trailing(|r| r.string("message"))?,
        }),
        MessageType::CheckUserInGroupWithAck => ServiceMessage::CheckUserInGroupWithAck(read_user_group_ack(&mut r)?),
        MessageType::ServiceEvent => ServiceMessage::ServiceEvent(ServiceEventData {
            object_type: ServiceEventObjectType::try_from(r.i32("type")?)?,
            kind: ServiceEventKind::try_from(r.i32("kind")?)?,
            id: r.string("id")?,
            message: r.trailing(|r| r.string("message"))?,
        }),
        MessageType::CheckGroupExistenceWithAck => ServiceMessage::CheckGroupExistenceWithAck(GroupAckData {
            group: r.string("groupName")?,
            ack_id: r.i32("ackId")?,
        }),
        MessageType::CheckConnectionExistenceWithAck => ServiceMessage::CheckConnectionExistenceWithAck(ConnectionAckData {
            connection_id: r.string("connectionId")?,
            ack_id: r.i32("ackId")?,
        }),
        MessageType::CheckUserExistenceWithAck => ServiceMessage::CheckUserExistenceWithAck(UserAckData {
            user_id: r.string("userId")?,
            ack_id: r.i32("ackId")?,
        }),
        MessageType::UserJoinGroupWithAck => ServiceMessage::UserJoinGroupWithAck(UserJoinGroupAckData {
            user_id: r.string("userId")?,
            group: r.string("groupName")?,
            ttl: r.opt_i32("ttl")?,
            ack_id: r.i32("ackId")?,
        }),
        MessageType::UserLeaveGroupWithAck => ServiceMessage::UserLeaveGroupWithAck(read_user_group_ack(&mut r)?),
    };

    Ok(Decoded::Message(msg))
}

fn read_group_membership(r: &mut MsgPackArrayReader) -> anyhow::Result<GroupMembershipData> {
    Ok(GroupMembershipData {
        connection_id: r.string("connectionId")?,
        group: r.string("groupName")?,
    })
}

fn read_group_membership_ack(r: &mut MsgPackArrayReader) -> anyhow::Result<GroupMembershipAckData> {
    Ok(GroupMembershipAckData {
        connection_id: r.string("connectionId")?,
        group: r.string("groupName")?,
        ack_id: r.i32("ackId")?,
    })
}

fn read_user_group_ack(r: &mut MsgPackArrayReader) -> anyhow::Result<UserGroupAckData> {
    Ok(UserGroupAckData {
        user_id: r.string("userId")?,
        group: r.string("groupName")?,
        ack_id: r.i32("ackId")?,
    })
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use rstest::rstest;

    use ServiceMessage::*;

    use super::*;

    fn payloads() -> Payloads {
        vec![
            ("json".to_string(), Bytes::from_static(b"{\"type\":1}\x1e")),
            ("messagepack".to_string(), Bytes::from_static(&[0x95, 0x01, 0x80, 0xc0])),
        ]
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn protocol() -> ServiceProtocol {
        ServiceProtocol::new(1024 * 1024)
    }

    #[rstest]
    #[case::handshake_request(HandshakeRequest(HandshakeRequestData { version: 1, connection_type: ConnectionType::Default, target: None, migration_level: MigrationLevel::Off }))]
    #[case::handshake_request_on_demand(HandshakeRequest(HandshakeRequestData { version: 1, connection_type: ConnectionType::OnDemand, target: Some("target-1".to_string()), migration_level: MigrationLevel::All }))]
    #[case::handshake_response_ok(HandshakeResponse(HandshakeResponseData { error_message: String::new(), connection_id: None }))]
    #[case::handshake_response_error(HandshakeResponse(HandshakeResponseData { error_message: "unsupported version".to_string(), connection_id: Some("abc".to_string()) }))]
    #[case::ping_empty(Ping(PingData { messages: vec![] }))]
    #[case::ping_target(Ping(PingData { messages: strings(&["target", "server-2"]) }))]
    #[case::open_connection_minimal(OpenConnection(OpenConnectionData { connection_id: "c1".to_string(), claims: vec![], headers: vec![], query_string: String::new(), tracing_id: None }))]
    #[case::open_connection_full(OpenConnection(OpenConnectionData {
        connection_id: "c1".to_string(),
        claims: vec![("role".to_string(), "admin".to_string()), ("role".to_string(), "user".to_string()), ("sub".to_string(), "u1".to_string())],
        headers: vec![("User-Agent".to_string(), strings(&["test"])), ("Accept".to_string(), strings(&["a", "b"]))],
        query_string: "?a=b&c=d".to_string(),
        tracing_id: Some(u64::MAX),
    }))]
    #[case::close_connection(CloseConnection(CloseConnectionData { connection_id: "c1".to_string(), error_message: "gone".to_string(), headers: vec![] }))]
    #[case::connection_data(ConnectionData(ConnectionPayloadData { connection_id: "c1".to_string(), payload: Bytes::from_static(b"hello"), tracing_id: None }))]
    #[case::connection_data_empty_payload(ConnectionData(ConnectionPayloadData { connection_id: "c1".to_string(), payload: Bytes::new(), tracing_id: Some(5) }))]
    #[case::multi_connection_data(MultiConnectionData(MultiConnectionPayloadData { connection_ids: strings(&["c1", "c2"]), payloads: payloads() }))]
    #[case::multi_connection_data_empty(MultiConnectionData(MultiConnectionPayloadData { connection_ids: vec![], payloads: vec![] }))]
    #[case::user_data(UserData(UserPayloadData { user_id: "u1".to_string(), payloads: payloads() }))]
    #[case::multi_user_data(MultiUserData(MultiUserPayloadData { user_ids: strings(&["u1", "u2", "u3"]), payloads: payloads() }))]
    #[case::broadcast(BroadcastData(BroadcastPayloadData { excluded: vec![], payloads: payloads() }))]
    #[case::broadcast_excluded(BroadcastData(BroadcastPayloadData { excluded: strings(&["c2", "c1"]), payloads: payloads() }))]
    #[case::join_group(JoinGroup(GroupMembershipData { connection_id: "c1".to_string(), group: "g".to_string() }))]
    #[case::leave_group(LeaveGroup(GroupMembershipData { connection_id: "c1".to_string(), group: "g".to_string() }))]
    #[case::group_broadcast(GroupBroadcastData(GroupBroadcastPayloadData { group: "g".to_string(), excluded: strings(&["c1"]), payloads: payloads() }))]
    #[case::multi_group_broadcast(MultiGroupBroadcastData(MultiGroupBroadcastPayloadData { groups: strings(&["g2", "g1"]), payloads: payloads() }))]
    #[case::service_error(ServiceError(ServiceErrorData { error_message: "quota exceeded".to_string() }))]
    #[case::user_join_group(UserJoinGroup(UserJoinGroupData { user_id: "u1".to_string(), group: "g".to_string(), ttl: None }))]
    #[case::user_join_group_ttl(UserJoinGroup(UserJoinGroupData { user_id: "u1".to_string(), group: "g".to_string(), ttl: Some(3600) }))]
    #[case::user_leave_group(UserLeaveGroup(UserGroupData { user_id: "u1".to_string(), group: "g".to_string() }))]
    #[case::join_group_ack(JoinGroupWithAck(GroupMembershipAckData { connection_id: "c1".to_string(), group: "g".to_string(), ack_id: 7 }))]
    #[case::leave_group_ack(LeaveGroupWithAck(GroupMembershipAckData { connection_id: "c1".to_string(), group: "g".to_string(), ack_id: i32::MAX }))]
    #[case::ack_ok(Ack(AckData { ack_id: 7, status: AckStatus::Ok, message: String::new() }))]
    #[case::ack_not_found(Ack(AckData { ack_id: -3, status: AckStatus::NotFound, message: "no such group".to_string() }))]
    #[case::ack_timeout(Ack(AckData { ack_id: 1, status: AckStatus::Timeout, message: String::new() }))]
    #[case::check_user_in_group(CheckUserInGroupWithAck(UserGroupAckData { user_id: "u1".to_string(), group: "g".to_string(), ack_id: 9 }))]
    #[case::service_event(ServiceEvent(ServiceEventData { object_type: ServiceEventObjectType::Connection, kind: ServiceEventKind::BufferFull, id: "c1".to_string(), message: "slow client".to_string() }))]
    #[case::check_group(CheckGroupExistenceWithAck(GroupAckData { group: "g".to_string(), ack_id: 10 }))]
    #[case::check_connection(CheckConnectionExistenceWithAck(ConnectionAckData { connection_id: "c1".to_string(), ack_id: 11 }))]
    #[case::check_user(CheckUserExistenceWithAck(UserAckData { user_id: "u1".to_string(), ack_id: 12 }))]
    #[case::user_join_group_with_ack(UserJoinGroupWithAck(UserJoinGroupAckData { user_id: "u1".to_string(), group: "g".to_string(), ttl: Some(60), ack_id: 13 }))]
    #[case::user_join_group_with_ack_no_ttl(UserJoinGroupWithAck(UserJoinGroupAckData { user_id: "u1".to_string(), group: "g".to_string(), ttl: None, ack_id: 13 }))]
    #[case::user_leave_group_with_ack(UserLeaveGroupWithAck(UserGroupAckData { user_id: "u1".to_string(), group: "g".to_string(), ack_id: 14 }))]
    fn test_ser_message(#[case] msg: ServiceMessage) {
        let protocol = protocol();

        let mut buf = BytesMut::new();
        protocol.write_message(&msg, &mut buf).unwrap();

        let frame = protocol.try_parse_frame(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        let decoded = protocol.parse_message(&frame).unwrap();
        assert_eq!(decoded, Decoded::Message(msg));
    }

    #[test]
    fn test_handshake_request_wire_layout() {
        let msg = HandshakeRequest(HandshakeRequestData { version: 1, connection_type: ConnectionType::Weak, target: None, migration_level: MigrationLevel::ShutdownOnly });
        let mut buf = BytesMut::new();
        protocol().write_message(&msg, &mut buf).unwrap();

        // [len=6][fixarray 5][1][1][2][nil][1]
        assert_eq!(buf.as_ref(), &[6, 0x95, 1, 1, 2, 0xc0, 1]);
    }

    /// encodes an array of the given type tag followed by caller supplied elements
    fn raw_frame(elements: impl FnOnce(&mut MsgPackWriter), num_elements: usize) -> BytesMut {
        let mut w = MsgPackWriter::new();
        w.array_len(num_elements).unwrap();
        elements(&mut w);
        let body = w.into_inner();

        let mut buf = BytesMut::new();
        buf.put_u32_varint(body.len() as u32);
        buf.put_slice(&body);
        buf
    }

    #[rstest]
    #[case::handshake_request_version_only(|w: &mut MsgPackWriter| { w.uint(1).unwrap(); w.int(1).unwrap(); }, 2,
        HandshakeRequest(HandshakeRequestData { version: 1, connection_type: ConnectionType::Default, target: None, migration_level: MigrationLevel::Off }))]
    #[case::handshake_response_without_id(|w: &mut MsgPackWriter| { w.uint(2).unwrap(); w.string("").unwrap(); }, 2,
        HandshakeResponse(HandshakeResponseData { error_message: String::new(), connection_id: None }))]
    #[case::open_connection_claims_only(|w: &mut MsgPackWriter| { w.uint(4).unwrap(); w.string("c1").unwrap(); w.claims(&[]).unwrap(); }, 3,
        OpenConnection(OpenConnectionData { connection_id: "c1".to_string(), claims: vec![], headers: vec![], query_string: String::new(), tracing_id: None }))]
    #[case::close_connection_id_only(|w: &mut MsgPackWriter| { w.uint(5).unwrap(); w.string("c1").unwrap(); }, 2,
        CloseConnection(CloseConnectionData { connection_id: "c1".to_string(), error_message: String::new(), headers: vec![] }))]
    #[case::connection_data_without_tracing(|w: &mut MsgPackWriter| { w.uint(6).unwrap(); w.string("c1").unwrap(); w.bin(b"x").unwrap(); }, 3,
        ConnectionData(ConnectionPayloadData { connection_id: "c1".to_string(), payload: Bytes::from_static(b"x"), tracing_id: None }))]
    #[case::user_join_group_without_ttl(|w: &mut MsgPackWriter| { w.uint(16).unwrap(); w.string("u1").unwrap(); w.string("g").unwrap(); }, 3,
        UserJoinGroup(UserJoinGroupData { user_id: "u1".to_string(), group: "g".to_string(), ttl: None }))]
    #[case::ack_without_message(|w: &mut MsgPackWriter| { w.uint(20).unwrap(); w.int(3).unwrap(); w.int(1).unwrap(); }, 3,
        Ack(AckData { ack_id: 3, status: AckStatus::Ok, message: String::new() }))]
    #[case::ping_without_messages(|w: &mut MsgPackWriter| { w.uint(3).unwrap(); }, 1,
        Ping(PingData { messages: vec![] }))]
    fn test_older_producer(#[case] elements: fn(&mut MsgPackWriter), #[case] num_elements: usize, #[case] expected: ServiceMessage) {
        let mut buf = raw_frame(elements, num_elements);
        let msg = protocol().try_parse_message(&mut buf).unwrap();
        assert_eq!(msg, Some(expected));
    }

    #[test]
    fn test_newer_producer_extra_fields() {
        let mut buf = raw_frame(|w| {
            w.uint(15).unwrap();
            w.string("boom").unwrap();
            w.string("some future field").unwrap();
            w.int(42).unwrap();
        }, 4);
        let msg = protocol().try_parse_message(&mut buf).unwrap();
        assert_eq!(msg, Some(ServiceError(ServiceErrorData { error_message: "boom".to_string() })));
    }

    #[test]
    fn test_ack_with_unknown_status() {
        let mut buf = raw_frame(|w| {
            w.uint(20).unwrap();
            w.int(7).unwrap();
            w.int(42).unwrap();
            w.string("new status").unwrap();
        }, 4);
        let msg = protocol().try_parse_message(&mut buf).unwrap();
        assert_eq!(msg, Some(Ack(AckData { ack_id: 7, status: AckStatus::Timeout, message: "new status".to_string() })));
    }

    #[test]
    fn test_missing_required_field() {
        let mut buf = raw_frame(|w| {
            w.uint(11).unwrap();
            w.string("c1").unwrap();
        }, 2);
        assert!(protocol().try_parse_message(&mut buf).is_err());
    }

    #[rstest]
    #[case::unregistered(99)]
    #[case::zero(0)]
    #[case::beyond_u8(1000)]
    fn test_unknown_message_type_is_skipped(#[case] tag: u64) {
        let mut buf = raw_frame(|w| {
            w.uint(tag).unwrap();
            w.string("whatever").unwrap();
        }, 2);
        let ping = ServiceMessage::Ping(PingData::default());
        protocol().write_message(&ping, &mut buf).unwrap();

        let frame = protocol().try_parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(protocol().parse_message(&frame).unwrap(), Decoded::Unknown(tag as i64));

        // the following frame is unaffected
        assert_eq!(protocol().try_parse_message(&mut buf).unwrap(), Some(ping));
    }

    #[test]
    fn test_incomplete_frames() {
        let protocol = protocol();
        let msg = ServiceMessage::ConnectionData(ConnectionPayloadData {
            connection_id: "c1".to_string(),
            payload: Bytes::from(vec![7u8; 300]),
            tracing_id: None,
        });
        let mut full = BytesMut::new();
        protocol.write_message(&msg, &mut full).unwrap();
        protocol.write_message(&msg, &mut full).unwrap();

        // feed byte by byte, two messages come out
        let mut buf = BytesMut::new();
        let mut received = Vec::new();
        for &b in full.iter() {
            buf.put_u8(b);
            while let Some(m) = protocol.try_parse_message(&mut buf).unwrap() {
                received.push(m);
            }
        }
        assert_eq!(received, vec![msg.clone(), msg]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_too_big() {
        let protocol = ServiceProtocol::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32_varint(17);
        buf.put_slice(&[0u8; 17]);
        assert!(protocol.try_parse_frame(&mut buf).is_err());

        let msg = ServiceMessage::ServiceError(ServiceErrorData { error_message: "x".repeat(20) });
        assert!(protocol.write_message(&msg, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_invalid_length_prefix() {
        let mut buf = BytesMut::from(&[0xffu8, 0xff, 0xff, 0xff, 0xff, 0xff][..]);
        assert!(protocol().try_parse_frame(&mut buf).is_err());
    }
}
