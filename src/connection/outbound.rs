//! Outgoing frames.
//!
//! The `transmit_*` operations send one-way frames; the `transceive_*`
//! operations also register a pending call and return its reply future.
//! Typed helpers (`notify`, `evaluate`, `evaluate_transverse`) marshal the
//! arguments and unmarshal the result on top of them.

use std::future::Future;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use super::Connection;
use crate::bus::{services, PendingReply};
use crate::codec::Marshal;
use crate::error::{Result, RipleyError};
use crate::object::{FilterElement, SharedObject};
use crate::protocol::{headers, MessageId, Reference, TransverseId};
use crate::route::{FilteredRoute, OutputBuffer, ReplyFilteredRoute, Route};

enum Resolution {
    Cached(Reference),
    Pending(PendingReply),
}

impl Connection {
    /// Send a RESOLVE for `id` and return the reply future.
    pub fn transceive_resolve(
        &self,
        route: &Arc<dyn Route>,
        id: &TransverseId,
    ) -> Result<PendingReply> {
        let mut encoded = BytesMut::new();
        id.encode(&mut encoded)?;
        self.send_request(route, headers::RESOLVE, &encoded)
    }

    /// Commit `header`, a fresh message id and `body` on `route`.
    ///
    /// The pending call is registered last and withdrawn if the commit
    /// fails.
    fn send_request(
        &self,
        route: &Arc<dyn Route>,
        header: u8,
        body: &[u8],
    ) -> Result<PendingReply> {
        let mut out = route.output_buffer()?;
        let (message_id, reply) = self.bus.wait_for_reply(route.key());
        out.put_u8(header);
        message_id.encode(&mut out);
        out.extend_from_slice(body);
        if let Err(e) = out.commit() {
            self.bus.cancel(message_id, route.key());
            return Err(e);
        }
        Ok(reply)
    }

    /// Resolve a transverse id on the peer behind `route`.
    ///
    /// Successful resolutions are cached per route.
    pub fn resolve(
        self: &Arc<Self>,
        route: &Arc<dyn Route>,
        id: &TransverseId,
    ) -> impl Future<Output = Result<Reference>> {
        let key = (route.key(), id.clone());
        let cached = self.resolved.lock().get(&key).copied();
        let step = match cached {
            Some(reference) => Ok(Resolution::Cached(reference)),
            None => self
                .transceive_resolve(route, id)
                .map(Resolution::Pending),
        };
        let connection = Arc::clone(self);

        async move {
            let reply = match step? {
                Resolution::Cached(reference) => return Ok(reference),
                Resolution::Pending(reply) => reply,
            };
            let mut payload = reply.await?;
            let reference = Reference::decode(&mut payload)?;
            connection.resolved.lock().insert(key, reference);
            Ok(reference)
        }
    }

    /// Start a NOTIFY to `callee`. Arguments go into the returned buffer.
    pub fn transmit_notify(
        &self,
        route: &Arc<dyn Route>,
        callee: Reference,
    ) -> Result<OutputBuffer> {
        let mut out = route.output_buffer()?;
        out.put_u8(headers::NOTIFY);
        callee.encode(&mut out);
        Ok(out)
    }

    /// Start an EVAL to `callee`. Arguments go into the returned buffer; the
    /// reply future resolves once it is committed and answered.
    ///
    /// The call is pending from here on. If the buffer is dropped instead of
    /// committed, the call times out.
    pub fn transceive_eval(
        &self,
        route: &Arc<dyn Route>,
        callee: Reference,
    ) -> Result<(OutputBuffer, PendingReply)> {
        let mut out = route.output_buffer()?;
        let (message_id, reply) = self.bus.wait_for_reply(route.key());
        out.put_u8(headers::EVAL);
        message_id.encode(&mut out);
        callee.encode(&mut out);
        Ok((out, reply))
    }

    /// Report a failed request back to its caller.
    pub fn transmit_message_error(
        &self,
        route: &dyn Route,
        message_id: MessageId,
        error: &RipleyError,
    ) -> Result<()> {
        let mut encoded = BytesMut::new();
        services::serialize_error(error, &mut encoded)?;
        let mut out = route.output_buffer()?;
        out.put_u8(headers::MESSAGE_ERROR);
        message_id.encode(&mut out);
        out.extend_from_slice(&encoded);
        out.commit()
    }

    /// Report an error not tied to a request.
    pub fn transmit_general_error(&self, route: &dyn Route, error: &RipleyError) -> Result<()> {
        let mut encoded = BytesMut::new();
        services::serialize_error(error, &mut encoded)?;
        let mut out = route.output_buffer()?;
        out.put_u8(headers::GENERAL_ERROR);
        out.extend_from_slice(&encoded);
        out.commit()
    }

    /// Tell the peer this side is going away, then forget the route.
    pub fn transmit_hup(&self, route: &Arc<dyn Route>) -> Result<()> {
        let mut out = route.output_buffer()?;
        out.put_u8(headers::HUP);
        let sent = out.commit();
        self.drop_route(route.key());
        sent
    }

    pub fn transmit_deref(&self, route: &Arc<dyn Route>, reference: Reference) -> Result<()> {
        let mut out = route.output_buffer()?;
        out.put_u8(headers::DEREF);
        reference.encode(&mut out);
        out.commit()
    }

    /// Route whose frames are encoded by `encoder` here and decoded by the
    /// peer filter `remote_decoder`.
    pub fn with_request_filter(
        &self,
        route: &Arc<dyn Route>,
        encoder: Arc<dyn FilterElement>,
        remote_decoder: Reference,
    ) -> Arc<dyn Route> {
        Arc::new(FilteredRoute::new(Arc::clone(route), encoder, remote_decoder))
    }

    /// Route asking the peer to encode replies with `remote_encoder`; they
    /// come back decoded by `local_decoder`.
    pub fn with_reply_filter(
        &self,
        route: &Arc<dyn Route>,
        remote_encoder: Reference,
        local_decoder: Arc<dyn FilterElement>,
    ) -> Arc<dyn Route> {
        let decoder = self.object_to_reference(&SharedObject::Filter(local_decoder));
        Arc::new(ReplyFilteredRoute::new(
            Arc::clone(route),
            remote_encoder,
            decoder,
        ))
    }

    /// Marshal `args` and NOTIFY `callee`.
    pub fn notify<A: Marshal>(
        &self,
        route: &Arc<dyn Route>,
        callee: Reference,
        args: &A,
    ) -> Result<()> {
        let mut out = self.transmit_notify(route, callee)?;
        args.marshal(self, &mut out)?;
        out.commit()
    }

    /// Marshal `args`, EVAL `callee` and unmarshal its result.
    pub fn evaluate<A: Marshal, R: Marshal>(
        self: &Arc<Self>,
        route: &Arc<dyn Route>,
        callee: Reference,
        args: &A,
    ) -> impl Future<Output = Result<R>> {
        let mut encoded = BytesMut::new();
        callee.encode(&mut encoded);
        let sent = args
            .marshal(self, &mut encoded)
            .and_then(|()| self.send_request(route, headers::EVAL, &encoded));
        let connection = Arc::clone(self);

        async move {
            let mut payload = sent?.await?;
            R::unmarshal(&connection, &mut payload)
        }
    }

    /// Resolve `id` on the peer, then evaluate it.
    pub fn evaluate_transverse<A: Marshal, R: Marshal>(
        self: &Arc<Self>,
        route: &Arc<dyn Route>,
        id: &TransverseId,
        args: &A,
    ) -> impl Future<Output = Result<R>> {
        let resolving = self.resolve(route, id);
        let mut encoded = BytesMut::new();
        let marshalled = args.marshal(self, &mut encoded).map(|()| encoded);
        let connection = Arc::clone(self);
        let route = Arc::clone(route);

        async move {
            let encoded = marshalled?;
            let callee = resolving.await?;
            let mut body = BytesMut::with_capacity(encoded.len() + 16);
            callee.encode(&mut body);
            body.extend_from_slice(&encoded);
            let mut payload = connection
                .send_request(&route, headers::EVAL, &body)?
                .await?;
            R::unmarshal(&connection, &mut payload)
        }
    }
}
