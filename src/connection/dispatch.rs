//! Incoming frame dispatch.
//!
//! `handle_received` reads the header byte and hands the rest of the frame
//! to the matching receiver. Filter frames recurse with a transcoded frame
//! or a derived origin. No lock is held while a receiver runs user code.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use super::Connection;
use crate::bus::services;
use crate::error::{Result, RipleyError};
use crate::object::{ExposedCallable, FilterElement};
use crate::protocol::{headers, FrameKind, MessageId, Reference, TransverseId};
use crate::route::{FilteredRoute, Route};

impl Connection {
    /// Dispatch one frame that arrived on `origin`.
    ///
    /// Errors returned here are decoding faults in the frame itself. Faults
    /// of a request are reported to the caller or the bus instead.
    pub fn handle_received(&self, origin: &Arc<dyn Route>, mut frame: Bytes) -> Result<()> {
        let kind = FrameKind::decode(&mut frame)?;
        tracing::trace!("Connection {} received {:?} on {}", self.id, kind, origin.key());
        match kind {
            FrameKind::Hup => self.receive_hup(origin),
            FrameKind::Resolve => self.receive_resolve(origin, frame),
            FrameKind::Notify => self.receive_notify(origin, frame),
            FrameKind::Eval => self.receive_eval(origin, frame),
            FrameKind::Reply => self.receive_reply(origin, frame),
            FrameKind::MessageError => self.receive_message_error(origin, frame),
            FrameKind::GeneralError => self.receive_general_error(origin, frame),
            FrameKind::FilterIn => self.receive_filter_in(origin, frame),
            FrameKind::FilterOut => self.receive_filter_out(origin, frame),
            FrameKind::Deref => self.receive_deref(origin, frame),
        }
    }

    fn receive_hup(&self, origin: &Arc<dyn Route>) -> Result<()> {
        tracing::info!("Connection {} peer hung up on {}", self.id, origin.key());
        self.drop_route(origin.key());
        origin.unregister();
        Ok(())
    }

    fn receive_resolve(&self, origin: &Arc<dyn Route>, mut frame: Bytes) -> Result<()> {
        let message_id = MessageId::decode(&mut frame)?;
        let id = TransverseId::decode(&mut frame)?;

        let result = self.transverse_id_to_reference(&id).and_then(|reference| {
            let mut out = origin.output_buffer()?;
            out.put_u8(headers::REPLY);
            message_id.encode(&mut out);
            reference.encode(&mut out);
            out.commit()
        });
        if let Err(e) = result {
            self.handle_incoming_message_error(origin, message_id, e);
        }
        Ok(())
    }

    fn receive_notify(&self, origin: &Arc<dyn Route>, mut frame: Bytes) -> Result<()> {
        let result = self
            .deserialize_object::<Arc<dyn ExposedCallable>>(&mut frame)
            .and_then(|callee| callee.notify(self, &mut frame));
        if let Err(e) = result {
            self.bus.handle_local_exception(origin.as_ref(), e);
        }
        Ok(())
    }

    fn receive_eval(&self, origin: &Arc<dyn Route>, mut frame: Bytes) -> Result<()> {
        let message_id = MessageId::decode(&mut frame)?;

        let result = self
            .deserialize_object::<Arc<dyn ExposedCallable>>(&mut frame)
            .and_then(|callee| {
                let mut out = origin.output_buffer()?;
                out.put_u8(headers::REPLY);
                message_id.encode(&mut out);
                callee.evaluate(self, &mut frame, &mut out)?;
                out.commit()
            });
        if let Err(e) = result {
            self.handle_incoming_message_error(origin, message_id, e);
        }
        Ok(())
    }

    fn receive_reply(&self, origin: &Arc<dyn Route>, mut frame: Bytes) -> Result<()> {
        let message_id = MessageId::decode(&mut frame)?;
        match self.bus.resolve_message_id(message_id, origin.key()) {
            Ok(call) => call.succeed(frame),
            Err(e) => tracing::debug!("Dropped reply on {}: {}", origin.key(), e),
        }
        Ok(())
    }

    fn receive_message_error(&self, origin: &Arc<dyn Route>, mut frame: Bytes) -> Result<()> {
        let message_id = MessageId::decode(&mut frame)?;
        let call = match self.bus.resolve_message_id(message_id, origin.key()) {
            Ok(call) => call,
            Err(e) => {
                tracing::debug!("Dropped message error on {}: {}", origin.key(), e);
                return Ok(());
            }
        };
        let error = self.construct_error(&mut frame);
        call.fail(error);
        Ok(())
    }

    fn receive_general_error(&self, origin: &Arc<dyn Route>, mut frame: Bytes) -> Result<()> {
        let error = self.construct_error(&mut frame);
        self.bus.handle_general_error(origin.as_ref(), error);
        Ok(())
    }

    fn receive_filter_in(&self, origin: &Arc<dyn Route>, mut frame: Bytes) -> Result<()> {
        let filter = self.deserialize_object::<Arc<dyn FilterElement>>(&mut frame)?;
        let mut decoded = BytesMut::with_capacity(frame.len());
        filter.transcode(&frame, &mut decoded)?;
        self.handle_received(origin, decoded.freeze())
    }

    fn receive_filter_out(&self, origin: &Arc<dyn Route>, mut frame: Bytes) -> Result<()> {
        let encoder = self.deserialize_object::<Arc<dyn FilterElement>>(&mut frame)?;
        let decoder = Reference::decode(&mut frame)?;
        let filtered: Arc<dyn Route> =
            Arc::new(FilteredRoute::new(Arc::clone(origin), encoder, decoder));
        self.handle_received(&filtered, frame)
    }

    fn receive_deref(&self, origin: &Arc<dyn Route>, mut frame: Bytes) -> Result<()> {
        let reference = Reference::decode(&mut frame)?;
        tracing::debug!(
            "Connection {} peer on {} released {}",
            self.id,
            origin.key(),
            reference
        );
        Ok(())
    }

    /// Rebuild the error named by the constructor at the front of `args`.
    fn construct_error(&self, args: &mut Bytes) -> RipleyError {
        let id = match TransverseId::decode(args) {
            Ok(id) => id,
            Err(e) => return e,
        };
        let constructor = match self.transverse_id_to_object(&id) {
            Ok(object) => services::as_error_constructor(&object),
            Err(_) => None,
        };
        let Some(constructor) = constructor else {
            return RipleyError::Unsupported(id);
        };
        match constructor.construct(self, args) {
            Ok(error) => error,
            Err(e) => {
                tracing::debug!("Constructor for {} failed: {}", id, e);
                RipleyError::Unsupported(id)
            }
        }
    }

    /// Report a failed request: back to the caller if the fault is
    /// transverse, to the bus otherwise.
    ///
    /// Only a closed route or connection counts as a destination failure.
    /// An error that cannot be encoded, or a full writer queue, is a local
    /// fault.
    pub(crate) fn handle_incoming_message_error(
        &self,
        origin: &Arc<dyn Route>,
        message_id: MessageId,
        error: RipleyError,
    ) {
        if !error.is_transverse() {
            self.bus.handle_local_exception(origin.as_ref(), error);
            return;
        }
        match self.transmit_message_error(origin.as_ref(), message_id, &error) {
            Ok(()) => {}
            Err(e @ (RipleyError::RouteClosed | RipleyError::ConnectionClosed)) => {
                tracing::warn!(
                    "Could not report {} for message {} on {}: {}",
                    error,
                    message_id,
                    origin.key(),
                    e
                );
                self.bus.report_destination_failure(origin.as_ref());
            }
            Err(e) => self.bus.handle_local_exception(origin.as_ref(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::codec::ValueType;
    use crate::object::{callable, IdentityFilter, SharedObject, TransverseMap};
    use crate::error::TransverseError;
    use crate::protocol::{ConnectionId, ObjectId};
    use bytes::Buf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_suffix() -> SharedObject {
        SharedObject::Callable(callable(|_c, (text,): (String,)| Ok(format!("{text}:1"))))
    }

    fn eval_frame(message_id: u64, callee: Reference, arg: &str) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u8(headers::EVAL);
        MessageId::new(message_id).encode(&mut out);
        callee.encode(&mut out);
        arg.to_string().serialize(&mut out).unwrap();
        out.freeze()
    }

    #[test]
    fn test_eval_replies_with_result() {
        let conn = connection(2);
        let callee = conn.object_to_reference(&echo_suffix());
        let route = RecordingRoute::new(&conn);
        let origin: Arc<dyn Route> = route.clone();

        conn.handle_received(&origin, eval_frame(7, callee, "hi")).unwrap();

        let frames = route.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"\x16\x07hi:1\0");
    }

    #[test]
    fn test_resolve_unknown_transverse_id() {
        let conn = connection(2);
        let route = RecordingRoute::new(&conn);
        let origin: Arc<dyn Route> = route.clone();

        let mut frame = BytesMut::new();
        frame.put_u8(headers::RESOLVE);
        MessageId::new(3).encode(&mut frame);
        TransverseId::from_static("demo.missing")
            .encode(&mut frame)
            .unwrap();
        conn.handle_received(&origin, frame.freeze()).unwrap();

        let frames = route.frames();
        assert_eq!(frames.len(), 1);
        let mut reply = frames[0].clone();
        assert_eq!(reply.get_u8(), headers::MESSAGE_ERROR);
        assert_eq!(MessageId::decode(&mut reply).unwrap(), MessageId::new(3));
        assert_eq!(
            TransverseId::decode(&mut reply).unwrap(),
            services::UNKNOWN_TRANSVERSE_ID_ERROR
        );
        assert_eq!(
            TransverseId::decode(&mut reply).unwrap(),
            TransverseId::from_static("demo.missing")
        );
    }

    #[test]
    fn test_resolve_known_transverse_id() {
        let conn = connection(2);
        let mut map = TransverseMap::new();
        map.insert(TransverseId::from_static("demo.echo"), echo_suffix());
        conn.add_transverse_map(map);
        let route = RecordingRoute::new(&conn);
        let origin: Arc<dyn Route> = route.clone();

        let mut frame = BytesMut::new();
        frame.put_u8(headers::RESOLVE);
        MessageId::new(0).encode(&mut frame);
        TransverseId::from_static("demo.echo")
            .encode(&mut frame)
            .unwrap();
        conn.handle_received(&origin, frame.freeze()).unwrap();

        assert_eq!(&route.frames()[0][..], &[headers::REPLY, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn test_eval_unknown_object_reports_back() {
        let conn = connection(2);
        let route = RecordingRoute::new(&conn);
        let origin: Arc<dyn Route> = route.clone();
        let missing = Reference::new(ConnectionId::new(2), ObjectId::new(40));

        conn.handle_received(&origin, eval_frame(1, missing, "x")).unwrap();

        let mut reply = route.frames()[0].clone();
        assert_eq!(reply.get_u8(), headers::MESSAGE_ERROR);
        assert_eq!(MessageId::decode(&mut reply).unwrap(), MessageId::new(1));
        assert_eq!(
            TransverseId::decode(&mut reply).unwrap(),
            services::UNKNOWN_OBJECT_ID_ERROR
        );
        assert_eq!(ObjectId::decode(&mut reply).unwrap(), ObjectId::new(40));
    }

    #[test]
    fn test_local_fault_is_not_echoed() {
        let conn = connection(2);
        let failing = SharedObject::Callable(callable(|_c, (): ()| -> crate::Result<()> {
            Err(RipleyError::Timeout)
        }));
        let callee = conn.object_to_reference(&failing);
        let route = RecordingRoute::new(&conn);
        let origin: Arc<dyn Route> = route.clone();

        let mut frame = BytesMut::new();
        frame.put_u8(headers::EVAL);
        MessageId::new(0).encode(&mut frame);
        callee.encode(&mut frame);
        conn.handle_received(&origin, frame.freeze()).unwrap();

        assert!(route.frames().is_empty());
    }

    #[test]
    fn test_filter_in_identity_matches_plain_eval() {
        let conn = connection(2);
        let callee = conn.object_to_reference(&echo_suffix());
        let filter = conn.object_to_reference(&SharedObject::filter(IdentityFilter));

        let plain = RecordingRoute::new(&conn);
        let plain_origin: Arc<dyn Route> = plain.clone();
        conn.handle_received(&plain_origin, eval_frame(7, callee, "hi")).unwrap();

        let filtered = RecordingRoute::new(&conn);
        let filtered_origin: Arc<dyn Route> = filtered.clone();
        let mut frame = BytesMut::new();
        frame.put_u8(headers::FILTER_IN);
        filter.encode(&mut frame);
        frame.extend_from_slice(&eval_frame(7, callee, "hi"));
        conn.handle_received(&filtered_origin, frame.freeze()).unwrap();

        assert_eq!(plain.frames(), filtered.frames());
    }

    #[test]
    fn test_filter_out_wraps_reply() {
        let conn = connection(2);
        let callee = conn.object_to_reference(&echo_suffix());
        let encoder = conn.object_to_reference(&SharedObject::filter(IdentityFilter));
        let remote_decoder = Reference::new(ConnectionId::new(1), ObjectId::new(5));

        let route = RecordingRoute::new(&conn);
        let origin: Arc<dyn Route> = route.clone();
        let mut frame = BytesMut::new();
        frame.put_u8(headers::FILTER_OUT);
        encoder.encode(&mut frame);
        remote_decoder.encode(&mut frame);
        frame.extend_from_slice(&eval_frame(7, callee, "hi"));
        conn.handle_received(&origin, frame.freeze()).unwrap();

        let frames = route.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"\x1a\x01\x05\x16\x07hi:1\0");
    }

    #[test]
    fn test_filter_in_rejects_non_filter() {
        let conn = connection(2);
        let not_filter = conn.object_to_reference(&echo_suffix());
        let origin: Arc<dyn Route> = RecordingRoute::new(&conn);

        let mut frame = BytesMut::new();
        frame.put_u8(headers::FILTER_IN);
        not_filter.encode(&mut frame);
        assert!(matches!(
            conn.handle_received(&origin, frame.freeze()),
            Err(RipleyError::ReferenceTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_header_is_decoding_fault() {
        let conn = connection(2);
        let origin: Arc<dyn Route> = RecordingRoute::new(&conn);
        assert!(matches!(
            conn.handle_received(&origin, Bytes::from_static(&[0x14, 0x00])),
            Err(RipleyError::Decoding(_))
        ));
    }

    #[tokio::test]
    async fn test_reply_resolves_pending_call() {
        let conn = connection(1);
        let route = RecordingRoute::new(&conn);
        let origin: Arc<dyn Route> = route.clone();

        let (id, reply) = conn.bus().wait_for_reply(origin.key());
        let mut frame = BytesMut::new();
        frame.put_u8(headers::REPLY);
        id.encode(&mut frame);
        "hi:1".to_string().serialize(&mut frame).unwrap();
        conn.handle_received(&origin, frame.freeze()).unwrap();

        let mut payload = reply.await.unwrap();
        assert_eq!(String::deserialize(&mut payload).unwrap(), "hi:1");
    }

    #[tokio::test]
    async fn test_spoofed_reply_is_dropped() {
        let conn = connection(1);
        let honest: Arc<dyn Route> = RecordingRoute::new(&conn);
        let spoofer: Arc<dyn Route> = RecordingRoute::new(&conn);

        let (id, reply) = conn.bus().wait_for_reply(honest.key());
        let mut frame = BytesMut::new();
        frame.put_u8(headers::REPLY);
        id.encode(&mut frame);
        frame.extend_from_slice(b"forged");
        conn.handle_received(&spoofer, frame.clone().freeze()).unwrap();
        assert_eq!(conn.bus().pending_count(), 1);

        conn.handle_received(&honest, frame.freeze()).unwrap();
        assert_eq!(&reply.await.unwrap()[..], b"forged");
    }

    #[tokio::test]
    async fn test_message_error_fails_pending_call() {
        let conn = connection(1);
        let origin: Arc<dyn Route> = RecordingRoute::new(&conn);
        let (id, reply) = conn.bus().wait_for_reply(origin.key());

        let mut frame = BytesMut::new();
        frame.put_u8(headers::MESSAGE_ERROR);
        id.encode(&mut frame);
        TransverseId::from_static("demo.NoSuchError")
            .encode(&mut frame)
            .unwrap();
        conn.handle_received(&origin, frame.freeze()).unwrap();

        assert!(matches!(
            reply.await,
            Err(RipleyError::Unsupported(id)) if id == TransverseId::from_static("demo.NoSuchError")
        ));
    }

    #[tokio::test]
    async fn test_message_error_uses_registered_constructor() {
        let conn = connection(1);
        conn.add_transverse_map(services::basic_error_map());
        let origin: Arc<dyn Route> = RecordingRoute::new(&conn);
        let (id, reply) = conn.bus().wait_for_reply(origin.key());

        let mut frame = BytesMut::new();
        frame.put_u8(headers::MESSAGE_ERROR);
        id.encode(&mut frame);
        services::UNKNOWN_TRANSVERSE_ID_ERROR
            .encode(&mut frame)
            .unwrap();
        TransverseId::from_static("demo.missing")
            .encode(&mut frame)
            .unwrap();
        conn.handle_received(&origin, frame.freeze()).unwrap();

        let missing = TransverseId::from_static("demo.missing");
        assert!(matches!(
            reply.await,
            Err(RipleyError::UnknownTransverseId(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_undecodable_error_is_unsupported() {
        let conn = connection(1);
        conn.add_transverse_map(services::basic_error_map());
        let origin: Arc<dyn Route> = RecordingRoute::new(&conn);
        let (id, reply) = conn.bus().wait_for_reply(origin.key());

        let mut frame = BytesMut::new();
        frame.put_u8(headers::MESSAGE_ERROR);
        id.encode(&mut frame);
        services::REFERENCE_TYPE_MISMATCH_ERROR
            .encode(&mut frame)
            .unwrap();
        frame.extend_from_slice(&[0xFF, 0xFE, 0x00]);
        conn.handle_received(&origin, frame.freeze()).unwrap();

        assert!(matches!(
            reply.await,
            Err(RipleyError::Unsupported(id)) if id == services::REFERENCE_TYPE_MISMATCH_ERROR
        ));
    }

    fn failing_with_nul() -> SharedObject {
        SharedObject::Callable(callable(|_c, (): ()| -> crate::Result<()> {
            Err(TransverseError::new(TransverseId::from_static("demo.Bad"), "bad\0msg").into())
        }))
    }

    fn count_local_faults(conn: &Arc<Connection>) -> Arc<AtomicUsize> {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        conn.bus().on_local_exception(Arc::new(move |_route: &dyn Route, _error: &RipleyError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        seen
    }

    #[test]
    fn test_unencodable_error_keeps_route() {
        let conn = connection(2);
        let faults = count_local_faults(&conn);
        let callee = conn.object_to_reference(&failing_with_nul());
        let route = RecordingRoute::new(&conn);
        let origin: Arc<dyn Route> = route.clone();
        conn.register_route(ConnectionId::new(1), Arc::clone(&origin));

        let mut frame = BytesMut::new();
        frame.put_u8(headers::EVAL);
        MessageId::new(0).encode(&mut frame);
        callee.encode(&mut frame);
        conn.handle_received(&origin, frame.freeze()).unwrap();

        assert!(route.frames().is_empty());
        assert!(conn.route_to(ConnectionId::new(1)).is_some());
        assert_eq!(faults.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_message_error_send_failures() {
        let conn = connection(2);
        let faults = count_local_faults(&conn);
        let missing = Reference::new(ConnectionId::new(2), ObjectId::new(40));

        let busy: Arc<dyn Route> = RecordingRoute::refusing(&conn, || RipleyError::Backpressure);
        conn.register_route(ConnectionId::new(1), Arc::clone(&busy));
        conn.handle_received(&busy, eval_frame(1, missing, "x")).unwrap();
        assert!(conn.route_to(ConnectionId::new(1)).is_some());
        assert_eq!(faults.load(Ordering::SeqCst), 1);

        let closed: Arc<dyn Route> = RecordingRoute::refusing(&conn, || RipleyError::RouteClosed);
        conn.register_route(ConnectionId::new(3), Arc::clone(&closed));
        conn.handle_received(&closed, eval_frame(2, missing, "x")).unwrap();
        assert!(conn.route_to(ConnectionId::new(3)).is_none());
        assert_eq!(faults.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hup_forgets_route() {
        let conn = connection(1);
        let route: Arc<dyn Route> = RecordingRoute::new(&conn);
        conn.register_route(ConnectionId::new(2), Arc::clone(&route));

        conn.handle_received(&route, Bytes::from_static(&[headers::HUP])).unwrap();
        assert!(conn.route_to(ConnectionId::new(2)).is_none());
    }
}
