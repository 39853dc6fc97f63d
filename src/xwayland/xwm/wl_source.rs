use std::{
    collections::HashMap,
    os::fd::{AsFd, OwnedFd},
    sync::Arc,
};

use calloop::{generic::Generic, Interest, LoopHandle, Mode, RegistrationToken};
use rustix::{fs::OFlags, pipe::PipeFlags};
use tracing::{debug, trace, warn};
use x11rb::protocol::xproto::{
    Atom, AtomEnum, Property, PropertyNotifyEvent, SelectionRequestEvent, Window as X11Window,
};

use crate::utils::Timestamp;

use super::{
    connection::XConnection,
    mime::MimeTable,
    selection::{property_deleted_callback, send_selection_notify_resp, DeleteAction, OutgoingTransfer},
    Atoms, XwmError, XwmHandler, XwmId,
};

/// X11 owner proxy of a selection held by a wayland client
#[derive(Debug)]
pub struct WlSourceProxy {
    pub mime_types: Vec<String>,
    /// Server time of our ownership, known once the X server echoed our claim
    pub timestamp: Option<Timestamp>,
    pub outgoing: HashMap<(X11Window, Atom), OutgoingTransfer>,
}

/// Pipe for the wayland client to write into, its read end registered on the loop
fn start_outgoing<D>(
    conn: &dyn XConnection,
    id: XwmId,
    selection: Atom,
    key: (X11Window, Atom),
    handle: &LoopHandle<'_, D>,
) -> Result<(RegistrationToken, OwnedFd), XwmError>
where
    D: XwmHandler + 'static,
{
    let (read_fd, write_fd) = rustix::pipe::pipe_with(PipeFlags::CLOEXEC)?;
    rustix::fs::fcntl_setfl(&read_fd, OFlags::NONBLOCK)?;
    conn.watch_properties(key.0)?;
    conn.flush()?;

    let token = handle
        .insert_source(
            Generic::new(read_fd, Interest::READ, Mode::Level),
            move |_, fd, data: &mut D| Ok(data.xwm_state(id).outgoing_readable(selection, key, fd.as_fd())),
        )
        .map_err(|err| err.error)?;
    Ok((token, write_fd))
}

impl WlSourceProxy {
    pub fn new(mime_types: Vec<String>) -> WlSourceProxy {
        WlSourceProxy {
            mime_types,
            timestamp: None,
            outgoing: HashMap::new(),
        }
    }

    /// The offered mime type a conversion to `target` stands for
    fn resolve_target(
        &self,
        conn: &dyn XConnection,
        mimes: &mut MimeTable,
        target: Atom,
    ) -> Result<Option<String>, XwmError> {
        for mime_type in &self.mime_types {
            if mimes.atoms_for(conn, mime_type)?.contains(&target) {
                return Ok(Some(mime_type.clone()));
            }
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn handle_request<D>(
        &mut self,
        conn: &Arc<dyn XConnection>,
        atoms: &Atoms,
        mimes: &mut MimeTable,
        id: XwmId,
        selection: Atom,
        event: &SelectionRequestEvent,
        handle: &LoopHandle<'_, D>,
    ) -> Result<Option<(String, OwnedFd)>, XwmError>
    where
        D: XwmHandler + 'static,
    {
        let mut request = *event;
        if request.property == x11rb::NONE {
            // obsolete clients
            request.property = request.target;
        }

        if let Some(timestamp) = self.timestamp {
            if Timestamp::from(request.time).is_older_than(&timestamp) {
                debug!(
                    requestor = request.requestor,
                    time = request.time,
                    "Refusing request predating our ownership"
                );
                send_selection_notify_resp(&**conn, &request, false)?;
                return Ok(None);
            }
        }

        if request.target == atoms.TARGETS {
            let mut targets = vec![atoms.TARGETS, atoms.TIMESTAMP];
            for mime_type in &self.mime_types {
                let atom = mimes.canonical_atom(&**conn, mime_type)?;
                if !targets.contains(&atom) {
                    targets.push(atom);
                }
            }
            trace!(requestor = request.requestor, ?targets, "Sending TARGETS");
            conn.change_property32(request.requestor, request.property, AtomEnum::ATOM.into(), &targets)?;
            send_selection_notify_resp(&**conn, &request, true)?;
            return Ok(None);
        }

        if request.target == atoms.TIMESTAMP {
            let timestamp = self.timestamp.unwrap_or(Timestamp::CURRENT);
            conn.change_property32(
                request.requestor,
                request.property,
                AtomEnum::INTEGER.into(),
                &[timestamp.into()],
            )?;
            send_selection_notify_resp(&**conn, &request, true)?;
            return Ok(None);
        }

        let Some(mime_type) = self.resolve_target(&**conn, mimes, request.target)? else {
            debug!(
                requestor = request.requestor,
                target = request.target,
                "Refusing request for a type not offered"
            );
            send_selection_notify_resp(&**conn, &request, false)?;
            return Ok(None);
        };

        let key = (request.requestor, request.property);
        if self.outgoing.contains_key(&key) {
            warn!(
                requestor = request.requestor,
                property = request.property,
                "Refusing concurrent request for the same property"
            );
            send_selection_notify_resp(&**conn, &request, false)?;
            return Ok(None);
        }

        let (token, write_fd) = match start_outgoing(&**conn, id, selection, key, handle) {
            Ok(res) => res,
            Err(err) => {
                warn!(?err, requestor = request.requestor, "Failed to set up outgoing transfer");
                send_selection_notify_resp(&**conn, &request, false)?;
                return Ok(None);
            }
        };

        debug!(
            requestor = request.requestor,
            mime_type,
            "Started outgoing transfer"
        );
        self.outgoing.insert(
            key,
            OutgoingTransfer {
                conn: conn.clone(),
                token: Some(token),
                incr: false,
                source_data: Vec::new(),
                request,
                property_set: false,
                reading_done: false,
                paused: false,
                sent_finished: false,
            },
        );

        Ok(Some((mime_type, write_fd)))
    }

    pub fn property_notify<D>(
        &mut self,
        event: &PropertyNotifyEvent,
        handle: &LoopHandle<'_, D>,
    ) -> Result<bool, XwmError> {
        let key = (event.window, event.atom);
        let Some(transfer) = self.outgoing.get_mut(&key) else {
            return Ok(false);
        };
        if event.state != Property::DELETE {
            return Ok(true);
        }

        match property_deleted_callback(transfer) {
            Ok(DeleteAction::Wait) => {}
            Ok(DeleteAction::Resume) => {
                if let Some(token) = transfer.token.as_ref() {
                    handle.enable(token)?;
                }
            }
            Ok(DeleteAction::Finished) => {
                if let Some(transfer) = self.outgoing.remove(&key) {
                    transfer.destroy(handle);
                }
            }
            Err(err) => {
                warn!(?err, requestor = event.window, "Outgoing transfer failed");
                if let Some(transfer) = self.outgoing.remove(&key) {
                    transfer.destroy(handle);
                }
            }
        }
        Ok(true)
    }

    pub fn window_destroyed<D>(&mut self, window: &X11Window, handle: &LoopHandle<'_, D>) -> bool {
        let keys = self
            .outgoing
            .keys()
            .filter(|(requestor, _)| requestor == window)
            .copied()
            .collect::<Vec<_>>();
        for key in &keys {
            if let Some(transfer) = self.outgoing.remove(key) {
                debug!(requestor = key.0, "Requestor destroyed, aborting transfer");
                transfer.destroy(handle);
            }
        }
        !keys.is_empty()
    }

    /// Abort every in-flight transfer
    pub fn destroy<D>(mut self, handle: &LoopHandle<'_, D>) {
        for (_, transfer) in self.outgoing.drain() {
            transfer.destroy(handle);
        }
    }
}
