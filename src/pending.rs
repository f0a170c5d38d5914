//! In-flight operation state.
//!
//! Each submitted operation becomes one pending entry in the multiplexer's
//! queue: where it went, under which nonce, and the continuation to retire
//! it with. Every pending retires exactly once, either through `complete`
//! (no server reply: disconnects, reconfigurations) or through `deliver`
//! (a matched reply frame).

use std::rc::Rc;

use bytes::Bytes;

use crate::channel::Channel;
use crate::frame::{
    MessageType, NET_NOTFOUND, NET_NOTUS, NET_SERVERERROR, NET_SUCCESS, NET_WRONGARITY,
};
use crate::types::{EntityId, Instance, Status};
use crate::wire::Unpacker;

pub type GetCallback = Box<dyn FnOnce(Status, Vec<Bytes>)>;
pub type MutateCallback = Box<dyn FnOnce(Status)>;

/// Where a pending was sent. The channel reference is an owning one: the
/// channel stays alive for as long as any pending still points at it.
pub struct OpRoute {
    pub chan: Rc<Channel>,
    pub entity: EntityId,
    pub instance: Instance,
    pub nonce: u32,
}

pub trait PendingOp {
    fn route(&self) -> &OpRoute;

    /// Retire without a server reply.
    fn complete(self: Box<Self>, status: Status);

    /// Decode a reply and retire. A returned pending would take this one's
    /// place for a chained multi-reply operation; the one-shot operations
    /// here always return `None`.
    fn deliver(
        self: Box<Self>,
        status: Status,
        reply_type: u8,
        body: Bytes,
    ) -> Option<Box<dyn PendingOp>>;
}

fn net_code_status(code: u16) -> Status {
    match code {
        NET_SUCCESS => Status::Success,
        NET_NOTFOUND => Status::NotFound,
        NET_WRONGARITY => Status::WrongArity,
        NET_NOTUS => Status::LogicError,
        NET_SERVERERROR => Status::ServerError,
        _ => Status::ServerError,
    }
}

fn decode_read_body(body: Bytes) -> (Status, Vec<Bytes>) {
    let mut up = Unpacker::new(body);
    let Ok(code) = up.u16() else {
        return (Status::ServerError, Vec::new());
    };
    match net_code_status(code) {
        Status::Success => match up.value_list() {
            Ok(values) => (Status::Success, values),
            Err(_) => (Status::ServerError, Vec::new()),
        },
        status => (status, Vec::new()),
    }
}

fn decode_mutate_body(body: Bytes) -> Status {
    let mut up = Unpacker::new(body);
    match up.u16() {
        Ok(code) => net_code_status(code),
        Err(_) => Status::ServerError,
    }
}

/// A read awaiting one `RESP_GET`.
pub struct PendingGet {
    route: OpRoute,
    callback: GetCallback,
}

impl PendingGet {
    pub fn new(route: OpRoute, callback: GetCallback) -> Self {
        Self { route, callback }
    }
}

impl PendingOp for PendingGet {
    fn route(&self) -> &OpRoute {
        &self.route
    }

    fn complete(self: Box<Self>, status: Status) {
        (self.callback)(status, Vec::new());
    }

    fn deliver(
        self: Box<Self>,
        status: Status,
        reply_type: u8,
        body: Bytes,
    ) -> Option<Box<dyn PendingOp>> {
        if status != Status::Success {
            (self.callback)(status, Vec::new());
            return None;
        }
        if MessageType::from_u8(reply_type) != Some(MessageType::RespGet) {
            (self.callback)(Status::ServerError, Vec::new());
            return None;
        }
        let (status, values) = decode_read_body(body);
        (self.callback)(status, values);
        None
    }
}

/// A put, delete, or partial update awaiting its single reply.
pub struct PendingMutate {
    route: OpRoute,
    expected: MessageType,
    callback: MutateCallback,
}

impl PendingMutate {
    pub fn new(route: OpRoute, expected: MessageType, callback: MutateCallback) -> Self {
        Self {
            route,
            expected,
            callback,
        }
    }
}

impl PendingOp for PendingMutate {
    fn route(&self) -> &OpRoute {
        &self.route
    }

    fn complete(self: Box<Self>, status: Status) {
        (self.callback)(status);
    }

    fn deliver(
        self: Box<Self>,
        status: Status,
        reply_type: u8,
        body: Bytes,
    ) -> Option<Box<dyn PendingOp>> {
        if status != Status::Success {
            (self.callback)(status);
            return None;
        }
        if MessageType::from_u8(reply_type) != Some(self.expected) {
            (self.callback)(Status::ServerError);
            return None;
        }
        (self.callback)(decode_mutate_body(body));
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{put_u16, put_value_list};

    #[test]
    fn read_body_success_carries_values() {
        let values = vec![Bytes::from_static(b"VAL"), Bytes::from_static(b"x")];
        let mut body = Vec::new();
        put_u16(&mut body, NET_SUCCESS);
        put_value_list(&mut body, &values);

        assert_eq!(
            decode_read_body(Bytes::from(body)),
            (Status::Success, values)
        );
    }

    #[test]
    fn read_body_maps_net_codes() {
        for (code, status) in [
            (NET_NOTFOUND, Status::NotFound),
            (NET_WRONGARITY, Status::WrongArity),
            (NET_NOTUS, Status::LogicError),
            (NET_SERVERERROR, Status::ServerError),
            (0xbeef, Status::ServerError),
        ] {
            let mut body = Vec::new();
            put_u16(&mut body, code);
            assert_eq!(decode_read_body(Bytes::from(body)), (status, Vec::new()));
        }
    }

    #[test]
    fn truncated_bodies_map_to_server_error() {
        assert_eq!(
            decode_read_body(Bytes::from_static(&[0x00])),
            (Status::ServerError, Vec::new())
        );
        assert_eq!(
            decode_mutate_body(Bytes::from_static(&[0x00])),
            Status::ServerError
        );

        // Success code but truncated value list.
        let mut body = Vec::new();
        put_u16(&mut body, NET_SUCCESS);
        body.extend_from_slice(&[0, 0, 0, 2, 0, 0, 0, 9]);
        assert_eq!(
            decode_read_body(Bytes::from(body)),
            (Status::ServerError, Vec::new())
        );
    }

    #[test]
    fn mutate_body_maps_net_codes() {
        for (code, status) in [
            (NET_SUCCESS, Status::Success),
            (NET_NOTFOUND, Status::NotFound),
            (NET_WRONGARITY, Status::WrongArity),
            (NET_NOTUS, Status::LogicError),
            (0xffff, Status::ServerError),
        ] {
            let mut body = Vec::new();
            put_u16(&mut body, code);
            assert_eq!(decode_mutate_body(Bytes::from(body)), status);
        }
    }
}
