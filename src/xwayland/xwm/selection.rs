use std::{
    fmt,
    os::fd::{BorrowedFd, OwnedFd},
    sync::Arc,
};

use calloop::{LoopHandle, PostAction, RegistrationToken};
use rustix::io::Errno;
use tracing::{debug, trace, warn};
use x11rb::{
    errors::ReplyOrIdError,
    protocol::{
        xfixes::{SelectionEvent as XfixesSelectionEvent, SelectionNotifyEvent as XfixesSelectionNotifyEvent},
        xproto::{
            Atom, AtomEnum, GetPropertyReply, PropertyNotifyEvent, SelectionNotifyEvent, SelectionRequestEvent,
            Window as X11Window, SELECTION_NOTIFY_EVENT,
        },
    },
    CURRENT_TIME,
};

use crate::{utils::Timestamp, wayland::selection::SelectionTarget};

use super::{
    connection::XConnection, mime::MimeTable, wl_source::WlSourceProxy, x11_source::X11Source, Atoms,
    OwnedX11Window, XwmError, XwmHandler, XwmId,
};

/// Size of a single chunk of an incremental (`INCR`) transfer
// copied from wlroots - docs say "maximum size can vary widely depending on the implementation"
// and there is no way to query the maximum size, you just get a non-descriptive `Length` error...
pub const INCR_CHUNK_SIZE: usize = 64 * 1024;

/// Handler calls collected while the bridge is borrowed, run once event handling is done
#[derive(Debug)]
pub enum Deferred {
    RequestSink {
        target: SelectionTarget,
        timestamp: Timestamp,
    },
    SelectionChanged {
        target: SelectionTarget,
        added: Vec<String>,
        removed: Vec<String>,
    },
    SendSelection {
        target: SelectionTarget,
        mime_type: String,
        fd: OwnedFd,
    },
}

/// The object standing in for the current owner of a selection on the other side
#[derive(Debug)]
pub enum Shadow {
    X11(X11Source),
    Wayland(WlSourceProxy),
}

impl Shadow {
    /// Timestamp of the ownership event this shadow was created for, `None` while our claim is unconfirmed
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Shadow::X11(source) => Some(source.timestamp),
            Shadow::Wayland(proxy) => proxy.timestamp,
        }
    }
}

#[derive(Debug)]
pub struct XWmSelection {
    pub atom: Atom,

    pub conn: Arc<dyn XConnection>,
    pub atoms: Atoms,
    pub window: OwnedX11Window,
    pub shadow: Option<Shadow>,
}

pub struct IncomingTransfer {
    pub token: Option<RegistrationToken>,
    pub window: OwnedX11Window,

    pub incr: bool,
    pub source_data: Vec<u8>,
    pub incr_done: bool,
    /// Writing to the fd failed, remaining chunks are discarded
    pub failed: bool,
}

impl fmt::Debug for IncomingTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingTransfer")
            .field("token", &self.token)
            .field("window", &self.window)
            .field("incr", &self.incr)
            .field("source_data", &self.source_data.len())
            .field("incr_done", &self.incr_done)
            .field("failed", &self.failed)
            .finish()
    }
}

impl IncomingTransfer {
    pub fn read_selection_prop(&mut self, reply: GetPropertyReply) {
        if reply.value.is_empty() {
            self.incr_done = true;
        } else if !self.failed {
            self.source_data.extend(&reply.value)
        }
    }

    pub fn write_selection(&mut self, fd: BorrowedFd<'_>) -> Result<bool, Errno> {
        if self.source_data.is_empty() {
            return Ok(true);
        }

        let len = rustix::io::write(fd, &self.source_data)?;
        self.source_data = self.source_data.split_off(len);

        Ok(self.source_data.is_empty())
    }

    pub fn destroy<D>(mut self, handle: &LoopHandle<'_, D>) {
        if let Some(token) = self.token.take() {
            handle.remove(token);
        }
    }
}

impl Drop for IncomingTransfer {
    fn drop(&mut self) {
        if self.token.is_some() {
            tracing::warn!(
                ?self,
                "IncomingTransfer freed before being removed from EventLoop"
            );
        }
    }
}

pub struct OutgoingTransfer {
    pub conn: Arc<dyn XConnection>,
    pub token: Option<RegistrationToken>,

    pub incr: bool,
    pub source_data: Vec<u8>,
    /// The request being answered, `property` already substituted for obsolete clients
    pub request: SelectionRequestEvent,

    pub property_set: bool,
    /// The wayland client closed its end of the pipe
    pub reading_done: bool,
    /// Reading is suspended until the requestor fetched the current chunk
    pub paused: bool,
    /// The final 0-byte data chunk has been sent, denoting the completion of this transfer
    pub sent_finished: bool,
}

impl fmt::Debug for OutgoingTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingTransfer")
            .field("conn", &"...")
            .field("token", &self.token)
            .field("incr", &self.incr)
            .field("source_data", &self.source_data.len())
            .field("request", &self.request)
            .field("property_set", &self.property_set)
            .field("reading_done", &self.reading_done)
            .field("paused", &self.paused)
            .field("sent_finished", &self.sent_finished)
            .finish()
    }
}

impl OutgoingTransfer {
    pub fn flush_data(&mut self) -> Result<usize, ReplyOrIdError> {
        let len = std::cmp::min(self.source_data.len(), INCR_CHUNK_SIZE);

        if len == 0 {
            // This flush will complete the transfer
            self.sent_finished = true;
        }

        let mut data = self.source_data.split_off(len);
        std::mem::swap(&mut data, &mut self.source_data);

        self.conn.change_property8(
            self.request.requestor,
            self.request.property,
            self.request.target,
            &data,
        )?;
        self.conn.flush()?;

        let remaining = self.source_data.len();
        self.property_set = true;
        Ok(remaining)
    }

    pub fn destroy<D>(mut self, handle: &LoopHandle<'_, D>) {
        if let Some(token) = self.token.take() {
            handle.remove(token);
        }
    }
}

impl Drop for OutgoingTransfer {
    fn drop(&mut self) {
        if self.token.is_some() {
            tracing::warn!(
                ?self,
                "OutgoingTransfer freed before being removed from EventLoop"
            );
        }
    }
}

impl XWmSelection {
    pub fn new(conn: &Arc<dyn XConnection>, atoms: &Atoms, atom: Atom) -> Result<Self, ReplyOrIdError> {
        let window = OwnedX11Window::new(conn.create_selection_window()?, conn);
        conn.watch_selection(*window, atom)?;
        conn.flush()?;

        debug!(
            selection_window = ?*window,
            ?atom,
            "Selection init",
        );

        Ok(XWmSelection {
            atom,
            conn: conn.clone(),
            atoms: *atoms,
            window,
            shadow: None,
        })
    }

    pub fn type_(&self) -> Option<SelectionTarget> {
        match self.atom {
            x if x == self.atoms.CLIPBOARD => Some(SelectionTarget::Clipboard),
            x if x == self.atoms.PRIMARY => Some(SelectionTarget::Primary),
            _ => None,
        }
    }

    /// Tear down the current shadow including all of its transfers
    ///
    /// `x11_side` denotes the X11 owner going away, which cancels the sink of an X11 shadow.
    pub fn retire<D>(&mut self, handle: &LoopHandle<'_, D>, x11_side: bool) {
        match self.shadow.take() {
            Some(Shadow::X11(source)) => source.destroy(handle, x11_side),
            Some(Shadow::Wayland(proxy)) => proxy.destroy(handle),
            None => {}
        }
    }

    pub fn owner_changed<D>(
        &mut self,
        event: &XfixesSelectionNotifyEvent,
        handle: &LoopHandle<'_, D>,
    ) -> Result<(), XwmError> {
        let owner = if event.subtype == XfixesSelectionEvent::SET_SELECTION_OWNER {
            event.owner
        } else {
            x11rb::NONE
        };
        let timestamp = Timestamp::from(event.timestamp);

        if owner == *self.window {
            if let Some(Shadow::Wayland(proxy)) = self.shadow.as_mut() {
                if proxy.timestamp.is_none() {
                    trace!(selection = ?self.atom, ?timestamp, "Selection claim confirmed");
                    proxy.timestamp = Some(timestamp);
                }
            }
            return Ok(());
        }

        match self.shadow.as_ref().map(Shadow::timestamp) {
            Some(None) => {
                debug!(
                    selection = ?self.atom,
                    owner,
                    "Ignoring ownership change preceding our claim"
                );
                return Ok(());
            }
            Some(Some(current)) if timestamp.is_older_than(&current) => {
                debug!(
                    selection = ?self.atom,
                    owner,
                    ?timestamp,
                    ?current,
                    "Ignoring stale ownership change"
                );
                return Ok(());
            }
            _ => {}
        }

        debug!(selection = ?self.atom, owner, ?timestamp, "Selection owner changed");
        self.retire(handle, true);

        // drags started by X11 clients are not bridged
        if owner == x11rb::NONE || self.type_().is_none() {
            return Ok(());
        }

        let source = X11Source::new(owner, timestamp);
        source.get_targets(&*self.conn, &self.atoms, self.atom, *self.window)?;
        self.shadow = Some(Shadow::X11(source));
        Ok(())
    }

    /// Take ownership on behalf of a wayland client offering `mime_types`
    pub fn claim<D>(&mut self, mime_types: Vec<String>, handle: &LoopHandle<'_, D>) -> Result<(), XwmError> {
        self.retire(handle, false);
        self.conn.set_selection_owner(*self.window, self.atom, CURRENT_TIME)?;
        self.conn.flush()?;

        debug!(selection = ?self.atom, ?mime_types, "Claimed selection for wayland");
        self.shadow = Some(Shadow::Wayland(WlSourceProxy::new(mime_types)));
        Ok(())
    }

    /// Give up ownership, if it is held on behalf of a wayland client
    pub fn release<D>(&mut self, handle: &LoopHandle<'_, D>) -> Result<(), XwmError> {
        if !matches!(self.shadow, Some(Shadow::Wayland(_))) {
            return Ok(());
        }

        self.retire(handle, false);
        self.conn.set_selection_owner(x11rb::NONE, self.atom, CURRENT_TIME)?;
        self.conn.flush()?;
        debug!(selection = ?self.atom, "Released selection");
        Ok(())
    }

    pub fn selection_notify<D>(
        &mut self,
        event: &SelectionNotifyEvent,
        mimes: &mut MimeTable,
        id: XwmId,
        handle: &LoopHandle<'_, D>,
        deferred: &mut Vec<Deferred>,
    ) -> Result<bool, XwmError>
    where
        D: XwmHandler + 'static,
    {
        if event.selection != self.atom {
            return Ok(false);
        }

        let target = self.type_();
        let is_targets = event.requestor == *self.window;
        let Some(Shadow::X11(source)) = self.shadow.as_mut() else {
            return Ok(is_targets);
        };

        if !is_targets {
            return source.handle_reply(&self.conn, &self.atoms, self.atom, id, event, handle);
        }

        let time = Timestamp::from(event.time);
        if event.target != self.atoms.TARGETS || (!time.is_current() && time != source.timestamp) {
            debug!(
                selection = ?self.atom,
                ?time,
                current = ?source.timestamp,
                "Discarding stale selection notify"
            );
            return Ok(true);
        }

        if let Some(target) = target {
            source.handle_targets(
                &*self.conn,
                &self.atoms,
                mimes,
                *self.window,
                event.property,
                target,
                deferred,
            )?;
        }
        Ok(true)
    }

    /// Answer a conversion request of an X11 client
    ///
    /// Returns the mime type and the write end of a pipe to be handed to the wayland source.
    pub fn selection_request<D>(
        &mut self,
        event: &SelectionRequestEvent,
        mimes: &mut MimeTable,
        id: XwmId,
        handle: &LoopHandle<'_, D>,
    ) -> Result<Option<(String, OwnedFd)>, XwmError>
    where
        D: XwmHandler + 'static,
    {
        match self.shadow.as_mut() {
            Some(Shadow::Wayland(proxy)) => {
                proxy.handle_request(&self.conn, &self.atoms, mimes, id, self.atom, event, handle)
            }
            _ => {
                debug!(
                    requestor = event.requestor,
                    selection = ?self.atom,
                    "Refusing request for a selection not owned by wayland"
                );
                send_selection_notify_resp(&*self.conn, event, false)?;
                Ok(None)
            }
        }
    }

    pub fn property_notify<D>(
        &mut self,
        event: &PropertyNotifyEvent,
        mimes: &mut MimeTable,
        handle: &LoopHandle<'_, D>,
        deferred: &mut Vec<Deferred>,
    ) -> Result<bool, XwmError> {
        let target = self.type_();
        match self.shadow.as_mut() {
            Some(Shadow::X11(source)) if event.window == *self.window => {
                if let Some(target) = target {
                    source.targets_chunk(&*self.conn, &self.atoms, mimes, event, target, deferred)?;
                }
                Ok(true)
            }
            Some(Shadow::X11(source)) => source.incoming_property(&*self.conn, &self.atoms, event, handle),
            Some(Shadow::Wayland(proxy)) => proxy.property_notify(event, handle),
            None => Ok(event.window == *self.window),
        }
    }

    pub fn window_destroyed<D>(&mut self, window: &X11Window, handle: &LoopHandle<'_, D>) -> bool {
        match self.shadow.as_mut() {
            Some(Shadow::X11(source)) => source.window_destroyed(window, handle),
            Some(Shadow::Wayland(proxy)) => proxy.window_destroyed(window, handle),
            None => false,
        }
    }

    pub fn incoming_writable(&mut self, window: X11Window, fd: BorrowedFd<'_>) -> PostAction {
        let Some(Shadow::X11(source)) = self.shadow.as_mut() else {
            return PostAction::Remove;
        };
        let Some(transfer) = source.incoming.get_mut(&window) else {
            return PostAction::Remove;
        };

        match write_selection_callback(fd, &*self.conn, &self.atoms, transfer) {
            Ok(IncomingAction::WaitForWritable) => return PostAction::Continue,
            Ok(IncomingAction::WaitForProperty) => return PostAction::Disable,
            Ok(IncomingAction::Done) => {
                debug!(?transfer, "Incoming transfer complete");
            }
            Err(err) => {
                warn!(?err, ?transfer, "Incoming transfer failed");
            }
        }

        if let Some(mut transfer) = source.incoming.remove(&window) {
            // the source is removed by returning `PostAction::Remove`
            transfer.token.take();
        }
        PostAction::Remove
    }

    pub fn outgoing_readable(&mut self, key: (X11Window, Atom), fd: BorrowedFd<'_>) -> PostAction {
        let Some(Shadow::Wayland(proxy)) = self.shadow.as_mut() else {
            return PostAction::Remove;
        };
        let Some(transfer) = proxy.outgoing.get_mut(&key) else {
            return PostAction::Remove;
        };

        match read_selection_callback(&*self.conn, &self.atoms, fd, transfer) {
            Ok(OutgoingAction::WaitForReadable) => return PostAction::Continue,
            Ok(OutgoingAction::PauseReading) => return PostAction::Disable,
            Ok(OutgoingAction::DoneReading) => {
                transfer.token.take();
                return PostAction::Remove;
            }
            Ok(OutgoingAction::Done) => {
                trace!(requestor = key.0, "Outgoing transfer complete");
            }
            Err(err) => {
                warn!(?err, requestor = key.0, "Outgoing transfer failed");
            }
        }

        if let Some(mut transfer) = proxy.outgoing.remove(&key) {
            transfer.token.take();
        }
        PostAction::Remove
    }
}

pub enum OutgoingAction {
    Done,
    DoneReading,
    PauseReading,
    WaitForReadable,
}

pub fn read_selection_callback(
    conn: &dyn XConnection,
    atoms: &Atoms,
    fd: BorrowedFd<'_>,
    transfer: &mut OutgoingTransfer,
) -> Result<OutgoingAction, ReplyOrIdError> {
    let mut buf = [0; INCR_CHUNK_SIZE];
    let len = match rustix::io::read(fd, &mut buf) {
        Ok(len) => len,
        Err(err) if err == Errno::AGAIN => return Ok(OutgoingAction::WaitForReadable),
        Err(err) => {
            debug!(
                requestor = transfer.request.requestor,
                ?err,
                "File descriptor closed, aborting transfer."
            );
            if !transfer.incr {
                send_selection_notify_resp(conn, &transfer.request, false)?;
            }
            return Ok(OutgoingAction::Done);
        }
    };
    trace!(
        requestor = transfer.request.requestor,
        "Transfer became readable, read {} bytes",
        len
    );

    transfer.source_data.extend_from_slice(&buf[..len]);
    if transfer.source_data.len() >= INCR_CHUNK_SIZE {
        if !transfer.incr {
            // start incr transfer
            trace!(
                requestor = transfer.request.requestor,
                "Transfer became incremental",
            );
            conn.change_property32(
                transfer.request.requestor,
                transfer.request.property,
                atoms.INCR,
                &[INCR_CHUNK_SIZE as u32],
            )?;
            conn.flush()?;
            transfer.incr = true;
            transfer.property_set = true;
            send_selection_notify_resp(conn, &transfer.request, true)?;
        } else if !transfer.property_set {
            // got more bytes, property deleted
            let len = transfer.flush_data()?;
            trace!(
                requestor = transfer.request.requestor,
                "Send data chunk: {} bytes",
                len
            );
        }
    }

    if len == 0 {
        if transfer.incr {
            debug!("Incr transfer completed reading");
            if !transfer.property_set {
                let len = transfer.flush_data()?;
                trace!(
                    requestor = transfer.request.requestor,
                    "Send data chunk: {} bytes",
                    len
                );
            }
            transfer.reading_done = true;
            Ok(OutgoingAction::DoneReading)
        } else {
            let len = transfer.source_data.len();
            transfer.flush_data()?;
            debug!("Non-Incr transfer completed with {} bytes", len);
            send_selection_notify_resp(conn, &transfer.request, true)?;
            Ok(OutgoingAction::Done)
        }
    } else if transfer.incr && transfer.source_data.len() >= INCR_CHUNK_SIZE {
        // waiting for property delete
        transfer.paused = true;
        Ok(OutgoingAction::PauseReading)
    } else {
        // nothing to be done, buffered the bytes
        Ok(OutgoingAction::WaitForReadable)
    }
}

pub enum DeleteAction {
    Finished,
    Resume,
    Wait,
}

/// The requestor fetched the current chunk of an incremental transfer
pub fn property_deleted_callback(transfer: &mut OutgoingTransfer) -> Result<DeleteAction, ReplyOrIdError> {
    if !transfer.incr || !transfer.property_set {
        return Ok(DeleteAction::Wait);
    }
    transfer.property_set = false;

    if transfer.sent_finished {
        debug!(requestor = transfer.request.requestor, "Incr transfer completed");
        return Ok(DeleteAction::Finished);
    }

    if transfer.source_data.len() >= INCR_CHUNK_SIZE || transfer.reading_done {
        let len = transfer.flush_data()?;
        trace!(
            requestor = transfer.request.requestor,
            "Send data chunk: {} bytes",
            len
        );
    }

    if transfer.paused && !transfer.reading_done && transfer.source_data.len() < INCR_CHUNK_SIZE {
        transfer.paused = false;
        return Ok(DeleteAction::Resume);
    }
    Ok(DeleteAction::Wait)
}

pub enum IncomingAction {
    Done,
    WaitForProperty,
    WaitForWritable,
}

pub fn write_selection_callback(
    fd: BorrowedFd<'_>,
    conn: &dyn XConnection,
    atoms: &Atoms,
    transfer: &mut IncomingTransfer,
) -> Result<IncomingAction, ReplyOrIdError> {
    if !transfer.failed {
        match transfer.write_selection(fd) {
            Ok(true) => {}
            Ok(false) => return Ok(IncomingAction::WaitForWritable),
            Err(err) if err == Errno::AGAIN => return Ok(IncomingAction::WaitForWritable),
            Err(err) => {
                warn!(?err, "Transfer errored");
                if !transfer.incr {
                    return Ok(IncomingAction::Done);
                }
                // even if it failed, we still need to drain the incr transfer
                transfer.failed = true;
                transfer.source_data.clear();
            }
        }
    }

    if transfer.incr {
        conn.delete_property(*transfer.window, atoms._WL_SELECTION)?;
        conn.flush()?;
        if transfer.incr_done {
            debug!(?transfer, "Incr Transfer complete!");
            Ok(IncomingAction::Done)
        } else {
            Ok(IncomingAction::WaitForProperty)
        }
    } else {
        debug!(?transfer, "Non-Incr Transfer complete!");
        Ok(IncomingAction::Done)
    }
}

pub fn send_selection_notify_resp(
    conn: &dyn XConnection,
    req: &SelectionRequestEvent,
    success: bool,
) -> Result<(), ReplyOrIdError> {
    conn.send_selection_notify(SelectionNotifyEvent {
        response_type: SELECTION_NOTIFY_EVENT,
        sequence: 0,
        time: req.time,
        requestor: req.requestor,
        selection: req.selection,
        target: req.target,
        property: if success {
            req.property
        } else {
            AtomEnum::NONE.into()
        },
    })?;
    conn.flush()?;
    Ok(())
}
