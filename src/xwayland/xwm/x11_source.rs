use std::{
    collections::HashMap,
    os::fd::{AsFd, OwnedFd},
    sync::Arc,
};

use calloop::{generic::Generic, Interest, LoopHandle, Mode};
use rustix::fs::OFlags;
use tracing::{debug, trace, warn};
use x11rb::protocol::xproto::{
    Atom, AtomEnum, Property, PropertyNotifyEvent, SelectionNotifyEvent, Window as X11Window,
};

use crate::{
    utils::Timestamp,
    wayland::selection::{SelectionSink, SelectionTarget},
};

use super::{
    connection::XConnection,
    mime::{MimeTable, OfferSet},
    selection::{Deferred, IncomingTransfer},
    Atoms, OwnedX11Window, XwmError, XwmHandler, XwmId,
};

/// A conversion request waiting for the owner's `SelectionNotify`
#[derive(Debug)]
pub struct PendingTransfer {
    pub window: OwnedX11Window,
    pub fd: OwnedFd,
    /// Target the owner was asked to convert to
    pub atom: Atom,
}

#[derive(Debug)]
pub struct IncrTargets {
    pub type_: Atom,
    pub format: u8,
    pub data: Vec<u8>,
}

/// Shadow of an X11 client owning a selection
#[derive(Debug)]
pub struct X11Source {
    pub owner: X11Window,
    pub timestamp: Timestamp,
    pub offers: OfferSet,

    pub sink: Option<Box<dyn SelectionSink>>,
    pub sink_requested: bool,
    pub targets_incr: Option<IncrTargets>,

    pub pending: HashMap<X11Window, PendingTransfer>,
    pub incoming: HashMap<X11Window, IncomingTransfer>,
}

fn decode_targets(type_: Atom, format: u8, value: &[u8]) -> Option<Vec<Atom>> {
    if type_ != AtomEnum::ATOM.into() || format != 32 || value.len() % 4 != 0 {
        return None;
    }
    Some(
        value
            .chunks_exact(4)
            .map(|atom| u32::from_ne_bytes([atom[0], atom[1], atom[2], atom[3]]))
            .collect(),
    )
}

impl X11Source {
    pub fn new(owner: X11Window, timestamp: Timestamp) -> X11Source {
        X11Source {
            owner,
            timestamp,
            offers: OfferSet::new(),
            sink: None,
            sink_requested: false,
            targets_incr: None,
            pending: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    /// Ask the owner for the list of types it offers
    pub fn get_targets(
        &self,
        conn: &dyn XConnection,
        atoms: &Atoms,
        selection: Atom,
        window: X11Window,
    ) -> Result<(), XwmError> {
        conn.convert_selection(
            window,
            selection,
            atoms.TARGETS,
            atoms._WL_SELECTION,
            self.timestamp.into(),
        )?;
        conn.flush()?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn handle_targets(
        &mut self,
        conn: &dyn XConnection,
        atoms: &Atoms,
        mimes: &mut MimeTable,
        window: X11Window,
        property: Atom,
        target: SelectionTarget,
        deferred: &mut Vec<Deferred>,
    ) -> Result<(), XwmError> {
        if property == x11rb::NONE {
            debug!(owner = self.owner, "TARGETS conversion refused");
            self.update_offers(OfferSet::new(), target, deferred);
            return Ok(());
        }

        let reply = conn.get_property(true, window, atoms._WL_SELECTION)?;
        conn.flush()?;
        if reply.type_ == atoms.INCR {
            trace!(owner = self.owner, "Receiving TARGETS incrementally");
            self.targets_incr = Some(IncrTargets {
                type_: x11rb::NONE,
                format: 0,
                data: Vec::new(),
            });
            return Ok(());
        }

        self.finish_targets(conn, mimes, reply.type_, reply.format, &reply.value, target, deferred);
        Ok(())
    }

    pub fn targets_chunk(
        &mut self,
        conn: &dyn XConnection,
        atoms: &Atoms,
        mimes: &mut MimeTable,
        event: &PropertyNotifyEvent,
        target: SelectionTarget,
        deferred: &mut Vec<Deferred>,
    ) -> Result<(), XwmError> {
        if event.atom != atoms._WL_SELECTION || event.state != Property::NEW_VALUE || self.targets_incr.is_none() {
            return Ok(());
        }

        let reply = conn.get_property(true, event.window, atoms._WL_SELECTION)?;
        conn.flush()?;
        let Some(incr) = self.targets_incr.as_mut() else {
            return Ok(());
        };
        if !reply.value.is_empty() {
            incr.type_ = reply.type_;
            incr.format = reply.format;
            incr.data.extend(&reply.value);
            return Ok(());
        }

        if let Some(incr) = self.targets_incr.take() {
            self.finish_targets(conn, mimes, incr.type_, incr.format, &incr.data, target, deferred);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_targets(
        &mut self,
        conn: &dyn XConnection,
        mimes: &mut MimeTable,
        type_: Atom,
        format: u8,
        value: &[u8],
        target: SelectionTarget,
        deferred: &mut Vec<Deferred>,
    ) {
        let offers = match decode_targets(type_, format, value) {
            Some(targets) => mimes.offer_set(conn, targets),
            None => {
                warn!(owner = self.owner, type_, format, "Malformed TARGETS reply");
                OfferSet::new()
            }
        };
        debug!(owner = self.owner, offers = ?offers.mime_ids(), "Got selection targets");
        self.update_offers(offers, target, deferred);
    }

    fn update_offers(&mut self, offers: OfferSet, target: SelectionTarget, deferred: &mut Vec<Deferred>) {
        let (added, removed) = offers.diff(&self.offers);
        self.offers = offers;
        if added.is_empty() && removed.is_empty() {
            return;
        }

        deferred.push(Deferred::SelectionChanged {
            target,
            added,
            removed,
        });
        match self.sink.as_mut() {
            Some(sink) => sink.offer(&self.offers.mime_ids()),
            None if !self.sink_requested => {
                self.sink_requested = true;
                deferred.push(Deferred::RequestSink {
                    target,
                    timestamp: self.timestamp,
                });
            }
            None => {}
        }
    }

    /// Attach the wayland-facing sink and advertise the current offer through it
    pub fn set_source(&mut self, mut sink: Box<dyn SelectionSink>) {
        sink.offer(&self.offers.mime_ids());
        self.sink = Some(sink);
    }

    /// Stream the selection converted to `mime_type` into `fd`
    pub fn start_transfer(
        &mut self,
        conn: &Arc<dyn XConnection>,
        atoms: &Atoms,
        selection: Atom,
        mime_type: &str,
        fd: OwnedFd,
    ) -> Result<(), XwmError> {
        let Some(atom) = self.offers.find_mime(mime_type) else {
            debug!(owner = self.owner, mime_type, "Mime type not offered, closing transfer");
            return Ok(());
        };
        rustix::fs::fcntl_setfl(&fd, OFlags::NONBLOCK)?;

        let window = OwnedX11Window::new(conn.create_selection_window()?, conn);
        conn.convert_selection(
            *window,
            selection,
            atom,
            atoms._WL_SELECTION,
            self.timestamp.into(),
        )?;
        conn.flush()?;

        debug!(
            owner = self.owner,
            transfer_window = *window,
            mime_type,
            "Requested selection conversion"
        );
        self.pending.insert(*window, PendingTransfer { window, fd, atom });
        Ok(())
    }

    /// The owner answered the conversion of a transfer
    pub fn handle_reply<D>(
        &mut self,
        conn: &Arc<dyn XConnection>,
        atoms: &Atoms,
        selection: Atom,
        id: XwmId,
        event: &SelectionNotifyEvent,
        handle: &LoopHandle<'_, D>,
    ) -> Result<bool, XwmError>
    where
        D: XwmHandler + 'static,
    {
        let Some(PendingTransfer { window, fd, atom }) = self.pending.remove(&event.requestor) else {
            return Ok(false);
        };

        if event.property == x11rb::NONE {
            debug!(owner = self.owner, requestor = event.requestor, "Conversion refused, closing transfer");
            return Ok(true);
        }
        if event.target != atom {
            warn!(
                owner = self.owner,
                requested = atom,
                target = event.target,
                "Conversion answered for another target, closing transfer"
            );
            return Ok(true);
        }

        let reply = match conn.get_property(true, *window, atoms._WL_SELECTION) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(?err, requestor = event.requestor, "Failed to read selection property");
                return Ok(true);
            }
        };
        conn.flush()?;

        let mut transfer = IncomingTransfer {
            token: None,
            window,
            incr: reply.type_ == atoms.INCR,
            source_data: Vec::new(),
            incr_done: false,
            failed: false,
        };
        if !transfer.incr {
            transfer.read_selection_prop(reply);
        }

        let transfer_window = *transfer.window;
        let token = handle
            .insert_source(
                Generic::new(fd, Interest::WRITE, Mode::Level),
                move |_, fd, data: &mut D| {
                    Ok(data
                        .xwm_state(id)
                        .incoming_writable(selection, transfer_window, fd.as_fd()))
                },
            )
            .map_err(|err| err.error)?;
        if transfer.incr {
            // nothing to write before the first chunk arrives
            handle.disable(&token)?;
        }
        transfer.token = Some(token);

        trace!(?transfer, "Started incoming transfer");
        self.incoming.insert(transfer_window, transfer);
        Ok(true)
    }

    /// A new chunk of an incremental transfer is available
    pub fn incoming_property<D>(
        &mut self,
        conn: &dyn XConnection,
        atoms: &Atoms,
        event: &PropertyNotifyEvent,
        handle: &LoopHandle<'_, D>,
    ) -> Result<bool, XwmError> {
        if self.pending.contains_key(&event.window) {
            return Ok(true);
        }
        let Some(transfer) = self.incoming.get_mut(&event.window) else {
            return Ok(false);
        };
        if !transfer.incr || event.atom != atoms._WL_SELECTION || event.state != Property::NEW_VALUE {
            return Ok(true);
        }

        match conn.get_property(false, event.window, atoms._WL_SELECTION) {
            Ok(reply) => {
                trace!(
                    requestor = event.window,
                    "Received data chunk: {} bytes",
                    reply.value.len()
                );
                transfer.read_selection_prop(reply);
                if let Some(token) = transfer.token.as_ref() {
                    handle.enable(token)?;
                }
            }
            Err(err) => {
                warn!(?err, requestor = event.window, "Failed to read selection chunk");
                if let Some(transfer) = self.incoming.remove(&event.window) {
                    transfer.destroy(handle);
                }
            }
        }
        Ok(true)
    }

    pub fn window_destroyed<D>(&mut self, window: &X11Window, handle: &LoopHandle<'_, D>) -> bool {
        if let Some(transfer) = self.incoming.remove(window) {
            transfer.destroy(handle);
            true
        } else {
            self.pending.remove(window).is_some()
        }
    }

    /// Abort every transfer of this shadow
    pub fn destroy<D>(mut self, handle: &LoopHandle<'_, D>, cancel_sink: bool) {
        for (_, transfer) in self.incoming.drain() {
            transfer.destroy(handle);
        }
        self.pending.clear();
        if cancel_sink {
            if let Some(sink) = self.sink.as_mut() {
                sink.cancelled();
            }
        }
    }
}
