//! The sync event union.
//!
//! Every frame on the sync wire is a `ConfigEvent { event_type, data }`
//! where `data` is JSON. Server-side the event is a closed enum with typed
//! payloads; dispatch is a match, never a callback table. Two variants share
//! the idle tag on encode: a heartbeat reply may be empty or may carry the
//! snapshot of a node homed on another keeper.

use serde::Serialize;
use serde::de::DeserializeOwned;

use keeper_common::error::{KeeperError, Result};

use crate::conf::StructData;
use crate::grpc::ConfigEvent;
use crate::node::{NodeInfo, NodeSnapshot};
use crate::operate::Operate;

pub const EVENT_ERROR: i32 = -2;
pub const EVENT_NONE: i32 = -1;
pub const EVENT_SYNC: i32 = 1;
pub const EVENT_NODE_CONF_CHANGED: i32 = 2;
pub const EVENT_NODE_REGISTER: i32 = 3;
pub const EVENT_NODE_STATUS: i32 = 4;
pub const EVENT_NODE_PROC: i32 = 5;
pub const EVENT_NODE_EXIT: i32 = 6;
pub const EVENT_CMD_START: i32 = 7;
pub const EVENT_CMD_STOP: i32 = 8;
pub const EVENT_CMD_RESTART: i32 = 9;
pub const EVENT_OPERATE: i32 = 10;
pub const EVENT_OPERATE_BATCH: i32 = 11;
pub const EVENT_OPERATE_ROLLBACK: i32 = 12;

#[derive(Clone, Debug)]
pub enum SyncEvent {
    /// Steady-state heartbeat. Inbound it carries the node's identity;
    /// outbound replies may be empty.
    Heartbeat(Option<NodeInfo>),
    /// Heartbeat reply carrying the state of a node homed on another keeper.
    RemoteNode(Box<NodeSnapshot>),
    /// The node's projection changed; payload is the full new projection.
    ConfChanged(Vec<StructData>),
    /// Inbound: register this node. Outbound (empty): please re-register.
    Register(Option<NodeInfo>),
    /// Inbound: process stats report. Outbound (empty): please report stats.
    Proc(Option<Box<NodeSnapshot>>),
    CmdStart(NodeInfo),
    CmdStop(NodeInfo),
    CmdRestart(NodeInfo),
    Operate(Operate),
    OperateBatch(Vec<Operate>),
    OperateRollback(Operate),
}

impl SyncEvent {
    pub fn tag(&self) -> i32 {
        match self {
            SyncEvent::Heartbeat(_) | SyncEvent::RemoteNode(_) => EVENT_NONE,
            SyncEvent::ConfChanged(_) => EVENT_NODE_CONF_CHANGED,
            SyncEvent::Register(_) => EVENT_NODE_REGISTER,
            SyncEvent::Proc(_) => EVENT_NODE_PROC,
            SyncEvent::CmdStart(_) => EVENT_CMD_START,
            SyncEvent::CmdStop(_) => EVENT_CMD_STOP,
            SyncEvent::CmdRestart(_) => EVENT_CMD_RESTART,
            SyncEvent::Operate(_) => EVENT_OPERATE,
            SyncEvent::OperateBatch(_) => EVENT_OPERATE_BATCH,
            SyncEvent::OperateRollback(_) => EVENT_OPERATE_ROLLBACK,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Heartbeat(_) => "none",
            SyncEvent::RemoteNode(_) => "remote_node",
            SyncEvent::ConfChanged(_) => "conf_changed",
            SyncEvent::Register(_) => "register",
            SyncEvent::Proc(_) => "proc",
            SyncEvent::CmdStart(_) => "start",
            SyncEvent::CmdStop(_) => "stop",
            SyncEvent::CmdRestart(_) => "restart",
            SyncEvent::Operate(_) => "operate",
            SyncEvent::OperateBatch(_) => "operate_batch",
            SyncEvent::OperateRollback(_) => "operate_rollback",
        }
    }

    /// Encode into the wire frame.
    pub fn encode(&self) -> Result<ConfigEvent> {
        fn frame<T: Serialize>(tag: i32, payload: &T) -> Result<ConfigEvent> {
            Ok(ConfigEvent {
                event_type: tag,
                data: serde_json::to_string(payload)?,
            })
        }
        match self {
            SyncEvent::Heartbeat(info) => frame(EVENT_NONE, info),
            SyncEvent::RemoteNode(node) => frame(EVENT_NONE, node),
            SyncEvent::ConfChanged(data) => frame(EVENT_NODE_CONF_CHANGED, data),
            SyncEvent::Register(info) => frame(EVENT_NODE_REGISTER, info),
            SyncEvent::Proc(node) => frame(EVENT_NODE_PROC, node),
            SyncEvent::CmdStart(info) => frame(EVENT_CMD_START, info),
            SyncEvent::CmdStop(info) => frame(EVENT_CMD_STOP, info),
            SyncEvent::CmdRestart(info) => frame(EVENT_CMD_RESTART, info),
            SyncEvent::Operate(op) => frame(EVENT_OPERATE, op),
            SyncEvent::OperateBatch(ops) => frame(EVENT_OPERATE_BATCH, ops),
            SyncEvent::OperateRollback(op) => frame(EVENT_OPERATE_ROLLBACK, op),
        }
    }

    /// Decode an inbound wire frame. Only the client-originated event types
    /// are accepted; anything else is a protocol error.
    pub fn decode(event: &ConfigEvent) -> Result<SyncEvent> {
        fn payload<T: DeserializeOwned>(data: &str) -> Result<Option<T>> {
            if data.trim().is_empty() || data.trim() == "null" {
                return Ok(None);
            }
            Ok(Some(serde_json::from_str(data)?))
        }
        match event.event_type {
            EVENT_NONE => Ok(SyncEvent::Heartbeat(payload(&event.data)?)),
            EVENT_NODE_REGISTER => Ok(SyncEvent::Register(payload(&event.data)?)),
            EVENT_NODE_PROC => Ok(SyncEvent::Proc(payload(&event.data)?)),
            EVENT_NODE_CONF_CHANGED => Ok(SyncEvent::ConfChanged(
                payload(&event.data)?.unwrap_or_default(),
            )),
            other => Err(KeeperError::EventUnsupported(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_roundtrip() {
        let info = NodeInfo::new(
            "10.0.0.2:8080",
            "host-2",
            "",
            "live",
            "session",
            vec!["/session.conf".to_string()],
            Default::default(),
        );
        let frame = SyncEvent::Register(Some(info.clone())).encode().unwrap();
        assert_eq!(frame.event_type, EVENT_NODE_REGISTER);
        match SyncEvent::decode(&frame).unwrap() {
            SyncEvent::Register(Some(decoded)) => {
                assert_eq!(decoded.id, info.id);
                assert_eq!(decoded.raw_subscription, info.raw_subscription);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_empty_payload_decodes_to_none() {
        let frame = ConfigEvent {
            event_type: EVENT_NODE_REGISTER,
            data: String::new(),
        };
        assert!(matches!(
            SyncEvent::decode(&frame).unwrap(),
            SyncEvent::Register(None)
        ));
        let frame = ConfigEvent {
            event_type: EVENT_NONE,
            data: "null".to_string(),
        };
        assert!(matches!(
            SyncEvent::decode(&frame).unwrap(),
            SyncEvent::Heartbeat(None)
        ));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let frame = ConfigEvent {
            event_type: 99,
            data: String::new(),
        };
        assert!(matches!(
            SyncEvent::decode(&frame),
            Err(KeeperError::EventUnsupported(99))
        ));
        // server-originated commands never come back in
        let frame = ConfigEvent {
            event_type: EVENT_CMD_STOP,
            data: "{}".to_string(),
        };
        assert!(SyncEvent::decode(&frame).is_err());
    }

    #[test]
    fn test_heartbeat_reply_shares_idle_tag() {
        let empty = SyncEvent::Heartbeat(None).encode().unwrap();
        assert_eq!(empty.event_type, EVENT_NONE);
        assert_eq!(empty.data, "null");
        let remote = SyncEvent::RemoteNode(Box::default()).encode().unwrap();
        assert_eq!(remote.event_type, EVENT_NONE);
        assert!(remote.data.contains("struct_datas"));
    }
}
