//! X11 side of the clipboard and drag'n'drop bridge
//!
//! The [`X11Bridge`] shadows the owners of the `CLIPBOARD`, `PRIMARY` and `XdndSelection` selections:
//!
//! - When an X11 client takes a selection, the bridge fetches its `TARGETS`, asks the compositor for a
//!   [`SelectionSink`] through [`XwmHandler::new_selection_sink`] and streams the payload into the file
//!   descriptors handed to [`X11Bridge::send_selection`].
//! - When a wayland client sets a selection, the compositor calls [`X11Bridge::new_selection`] and the bridge
//!   takes ownership of the X11 selection on its behalf. Conversion requests of X11 clients are forwarded
//!   to [`XwmHandler::send_selection`] with the write end of a pipe.
//! - When a wayland drag enters the area of an X11 window, [`X11Bridge::drag_move_filter`] speaks the Xdnd
//!   protocol with it.
//!
//! ```no_run
//! use std::{os::fd::OwnedFd, sync::Arc};
//! use xwayland_bridge::{
//!     reexports::{calloop::EventLoop, x11rb::rust_connection::RustConnection},
//!     wayland::selection::{SelectionSink, SelectionTarget},
//!     xwayland::xwm::{X11Bridge, XwmHandler, XwmId},
//! };
//!
//! struct State { bridge: X11Bridge }
//! impl XwmHandler for State {
//!     fn xwm_state(&mut self, _xwm: XwmId) -> &mut X11Bridge {
//!         &mut self.bridge
//!     }
//!     fn new_selection_sink(
//!         &mut self,
//!         _xwm: XwmId,
//!         _target: SelectionTarget,
//!     ) -> Option<Box<dyn SelectionSink>> {
//!         None // a sink setting the seat selection
//!     }
//!     fn send_selection(&mut self, _xwm: XwmId, _target: SelectionTarget, _mime_type: String, _fd: OwnedFd) {
//!         // forward to the wayland data source currently holding the selection
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (conn, _screen) = RustConnection::connect(None)?;
//! let event_loop = EventLoop::<State>::try_new()?;
//! let mut state = State { bridge: X11Bridge::connect(Arc::new(conn))? };
//! let id = state.bridge.id();
//!
//! // for every event read from the X11 connection
//! # let event: xwayland_bridge::reexports::x11rb::protocol::Event = todo!();
//! let consumed = X11Bridge::handle_event(&mut state, id, &event, &event_loop.handle())?;
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    ops::Deref,
    os::fd::{BorrowedFd, OwnedFd},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use calloop::{
    timer::{TimeoutAction, Timer},
    LoopHandle, PostAction,
};
use tracing::{debug, trace, warn};
use x11rb::{
    errors::ReplyOrIdError,
    protocol::{
        xfixes::{ConnectionExt as _, SelectionNotifyEvent as XfixesSelectionNotifyEvent},
        xproto::{
            Atom, ClientMessageEvent, PropertyNotifyEvent, SelectionNotifyEvent, SelectionRequestEvent,
            Window as X11Window,
        },
        Event,
    },
    rust_connection::RustConnection,
};

use crate::{
    input::dnd::{DragEventReply, Source},
    utils::{Logical, Point, Timestamp},
    wayland::selection::{SelectionSink, SelectionTarget},
};

pub mod connection;
mod dnd;
mod mime;
mod selection;
mod wl_source;
mod x11_source;

#[cfg(test)]
mod testing;

pub use self::connection::XConnection;
pub use self::dnd::{DND_FINISHED_TIMEOUT, DND_VERSION, MIN_DND_VERSION};
pub use self::mime::{MimeAtom, MimeTable, OfferSet, TEXT_PLAIN, TEXT_PLAIN_UTF8};
pub use self::selection::INCR_CHUNK_SIZE;

use self::{
    dnd::{StatusReply, WlToXDrag, XWmDnd, Xvisit, XvisitState},
    selection::{Deferred, Shadow, XWmSelection},
};

#[allow(missing_docs)]
mod atoms {
    x11rb::atom_manager! {
        /// Atoms used by the selection bridge
        pub Atoms:
        AtomsCookie {
            // selections
            CLIPBOARD,
            PRIMARY,
            XdndSelection,

            // conversion targets
            TARGETS,
            TIMESTAMP,
            MULTIPLE,
            SAVE_TARGETS,
            DELETE,
            INCR,

            // data formats
            UTF8_STRING,
            TEXT,
            STRING,

            // private
            _WL_SELECTION,

            // xdnd
            XdndAware,
            XdndProxy,
            XdndTypeList,
            XdndEnter,
            XdndPosition,
            XdndStatus,
            XdndLeave,
            XdndDrop,
            XdndFinished,
            XdndActionCopy,
            XdndActionMove,
            XdndActionAsk,
        }
    }
}
pub use self::atoms::Atoms;

static NEXT_XWM_ID: AtomicUsize = AtomicUsize::new(0);

/// Id of a selection bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XwmId(usize);

/// An X11 window created by the bridge, destroyed when dropped
pub struct OwnedX11Window {
    window: X11Window,
    conn: Weak<dyn XConnection>,
}

impl fmt::Debug for OwnedX11Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedX11Window").field(&self.window).finish()
    }
}

impl OwnedX11Window {
    /// Take ownership of `window`
    pub fn new(window: X11Window, conn: &Arc<dyn XConnection>) -> OwnedX11Window {
        OwnedX11Window {
            window,
            conn: Arc::downgrade(conn),
        }
    }
}

impl Deref for OwnedX11Window {
    type Target = X11Window;

    fn deref(&self) -> &Self::Target {
        &self.window
    }
}

impl PartialEq<X11Window> for OwnedX11Window {
    fn eq(&self, other: &X11Window) -> bool {
        self.window == *other
    }
}

impl Drop for OwnedX11Window {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            let _ = conn.destroy_window(self.window);
            let _ = conn.flush();
        }
    }
}

/// Errors of the selection bridge
#[derive(Debug, thiserror::Error)]
pub enum XwmError {
    /// An X11 request failed
    #[error("X11 request failed: {0}")]
    Connection(#[from] ReplyOrIdError),
    /// Creating or configuring a transfer file descriptor failed
    #[error("Failed to set up a transfer pipe: {0}")]
    Pipe(#[from] rustix::io::Errno),
    /// Registering a transfer with the event loop failed
    #[error("Failed to register with the event loop: {0}")]
    EventLoop(#[from] calloop::Error),
}

/// The X11 events relevant to the bridge
#[derive(Debug, Clone, Copy)]
pub enum SelectionEvent {
    /// The owner of a selection changed (XFixes)
    OwnerChanged(XfixesSelectionNotifyEvent),
    /// A selection owner answered a conversion request
    SelectionNotify(SelectionNotifyEvent),
    /// An X11 client asks for the contents of a selection
    SelectionRequest(SelectionRequestEvent),
    /// A property changed on a transfer window
    PropertyNotify(PropertyNotifyEvent),
    /// A client message, possibly part of the Xdnd protocol
    ClientMessage(ClientMessageEvent),
    /// A window involved in a transfer or drag was destroyed
    WindowDestroyed(X11Window),
}

impl SelectionEvent {
    /// Extract the events the bridge handles, `None` for any other event
    pub fn from_event(event: &Event) -> Option<SelectionEvent> {
        match event {
            Event::XfixesSelectionNotify(e) => Some(SelectionEvent::OwnerChanged(*e)),
            Event::SelectionNotify(e) => Some(SelectionEvent::SelectionNotify(*e)),
            Event::SelectionRequest(e) => Some(SelectionEvent::SelectionRequest(*e)),
            Event::PropertyNotify(e) => Some(SelectionEvent::PropertyNotify(*e)),
            Event::ClientMessage(e) => Some(SelectionEvent::ClientMessage(*e)),
            Event::DestroyNotify(e) => Some(SelectionEvent::WindowDestroyed(e.window)),
            _ => None,
        }
    }
}

/// The current owner of a selection, as seen by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionOwner {
    /// Nobody owns the selection, or the owner is not bridged
    None,
    /// An X11 client owns the selection
    X11(X11Window),
    /// The bridge owns the selection on behalf of a wayland client
    Wayland,
}

/// Handler trait for the interactions of the bridge with the compositor
pub trait XwmHandler {
    /// Retrieve the bridge for a given id
    fn xwm_state(&mut self, xwm: XwmId) -> &mut X11Bridge;

    /// An X11 client took `target` and offers data in some mime types
    ///
    /// The returned sink is presented to wayland clients as the new selection. Returning `None`
    /// leaves the X11 selection unbridged.
    fn new_selection_sink(&mut self, xwm: XwmId, target: SelectionTarget) -> Option<Box<dyn SelectionSink>>;

    /// An X11 client requests the selection held by a wayland client
    ///
    /// The data of type `mime_type` should be written to `fd` by the current wayland data source.
    fn send_selection(&mut self, xwm: XwmId, target: SelectionTarget, mime_type: String, fd: OwnedFd);

    /// The mime types offered by the X11 owner of `target` changed
    fn selection_changed(&mut self, _xwm: XwmId, _target: SelectionTarget, _added: &[String], _removed: &[String]) {
    }
}

/// The selection and drag'n'drop bridge of an Xwayland server
#[derive(Debug)]
pub struct X11Bridge {
    id: XwmId,
    conn: Arc<dyn XConnection>,
    atoms: Atoms,
    mimes: MimeTable,

    clipboard: XWmSelection,
    primary: XWmSelection,
    dnd: XWmDnd,
}

impl X11Bridge {
    /// Start bridging the selections of the X server behind `conn`
    ///
    /// The XFixes extension needs to be initialized on the connection.
    pub fn new(conn: Arc<dyn XConnection>, atoms: Atoms) -> Result<X11Bridge, XwmError> {
        let clipboard = XWmSelection::new(&conn, &atoms, atoms.CLIPBOARD)?;
        let primary = XWmSelection::new(&conn, &atoms, atoms.PRIMARY)?;
        let dnd = XWmDnd::new(&conn, &atoms)?;

        let id = XwmId(NEXT_XWM_ID.fetch_add(1, Ordering::SeqCst));
        debug!(?id, "Selection bridge started");

        Ok(X11Bridge {
            id,
            mimes: MimeTable::new(&atoms),
            conn,
            atoms,
            clipboard,
            primary,
            dnd,
        })
    }

    /// Initialize XFixes and the atoms on `conn` and start bridging
    pub fn connect(conn: Arc<RustConnection>) -> Result<X11Bridge, XwmError> {
        fn init(conn: &RustConnection) -> Result<Atoms, ReplyOrIdError> {
            conn.xfixes_query_version(5, 0)?.reply()?;
            Ok(Atoms::new(conn)?.reply()?)
        }

        let atoms = init(&conn)?;
        X11Bridge::new(conn, atoms)
    }

    /// Id of this bridge
    pub fn id(&self) -> XwmId {
        self.id
    }

    /// Atoms interned by this bridge
    pub fn atoms(&self) -> &Atoms {
        &self.atoms
    }

    /// Change how long a drop target may take to confirm a drop, defaults to [`DND_FINISHED_TIMEOUT`]
    pub fn set_dnd_finished_timeout(&mut self, timeout: Duration) {
        self.dnd.finished_timeout = timeout;
    }

    fn selection(&self, target: SelectionTarget) -> &XWmSelection {
        match target {
            SelectionTarget::Clipboard => &self.clipboard,
            SelectionTarget::Primary => &self.primary,
        }
    }

    fn selection_mut(&mut self, target: SelectionTarget) -> &mut XWmSelection {
        match target {
            SelectionTarget::Clipboard => &mut self.clipboard,
            SelectionTarget::Primary => &mut self.primary,
        }
    }

    fn selection_by_atom_mut(&mut self, atom: Atom) -> Option<&mut XWmSelection> {
        match atom {
            x if x == self.atoms.CLIPBOARD => Some(&mut self.clipboard),
            x if x == self.atoms.PRIMARY => Some(&mut self.primary),
            x if x == self.atoms.XdndSelection => Some(&mut self.dnd.selection),
            _ => None,
        }
    }

    /// Handle an X11 event
    ///
    /// Returns `true` if the event was meant for the bridge. `DestroyNotify` events may be relevant
    /// to other parts of the compositor even if consumed.
    pub fn handle_event<D>(
        state: &mut D,
        id: XwmId,
        event: &Event,
        handle: &LoopHandle<'_, D>,
    ) -> Result<bool, XwmError>
    where
        D: XwmHandler + 'static,
    {
        let Some(event) = SelectionEvent::from_event(event) else {
            return Ok(false);
        };

        let mut deferred = Vec::new();
        let consumed = state.xwm_state(id).dispatch(event, handle, &mut deferred);
        X11Bridge::run_deferred(state, id, deferred);
        consumed
    }

    fn dispatch<D>(
        &mut self,
        event: SelectionEvent,
        handle: &LoopHandle<'_, D>,
        deferred: &mut Vec<Deferred>,
    ) -> Result<bool, XwmError>
    where
        D: XwmHandler + 'static,
    {
        let id = self.id;
        match event {
            SelectionEvent::OwnerChanged(n) => {
                let Some(selection) = self.selection_by_atom_mut(n.selection) else {
                    return Ok(false);
                };
                selection.owner_changed(&n, handle)?;

                if n.selection == self.atoms.XdndSelection
                    && self.dnd.drag.is_some()
                    && !matches!(self.dnd.selection.shadow, Some(Shadow::Wayland(_)))
                {
                    debug!("XdndSelection taken by an X11 client, cancelling drag");
                    if let Some(drag) = self.dnd.drag.as_mut() {
                        if let Some(visit) = drag.visit.as_mut() {
                            visit.leave(&*self.conn, &self.atoms)?;
                        }
                        drag.source.cancel();
                    }
                    self.end_drag(handle)?;
                }
                Ok(true)
            }
            SelectionEvent::SelectionNotify(n) => {
                for selection in [&mut self.clipboard, &mut self.primary, &mut self.dnd.selection] {
                    if selection.selection_notify(&n, &mut self.mimes, id, handle, deferred)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            SelectionEvent::SelectionRequest(n) => {
                let selection = match n.selection {
                    x if x == self.atoms.CLIPBOARD => &mut self.clipboard,
                    x if x == self.atoms.PRIMARY => &mut self.primary,
                    x if x == self.atoms.XdndSelection => &mut self.dnd.selection,
                    _ => return Ok(false),
                };
                if selection.window != n.owner {
                    return Ok(false);
                }

                trace!(
                    requestor = n.requestor,
                    selection = n.selection,
                    target = n.target,
                    "Selection request"
                );
                let target = selection.type_();
                let Some((mime_type, fd)) = selection.selection_request(&n, &mut self.mimes, id, handle)? else {
                    return Ok(true);
                };
                match target {
                    Some(target) => deferred.push(Deferred::SendSelection { target, mime_type, fd }),
                    None => match self.dnd.drag.as_ref() {
                        Some(drag) => drag.source.send(&mime_type, fd),
                        None => debug!(mime_type, "No drag source to transfer from"),
                    },
                }
                Ok(true)
            }
            SelectionEvent::PropertyNotify(n) => {
                for selection in [&mut self.clipboard, &mut self.primary, &mut self.dnd.selection] {
                    if selection.property_notify(&n, &mut self.mimes, handle, deferred)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            SelectionEvent::ClientMessage(msg) => self.dnd_client_message(&msg, handle),
            SelectionEvent::WindowDestroyed(window) => Ok(self.window_destroyed(window, handle)),
        }
    }

    fn run_deferred<D: XwmHandler>(state: &mut D, id: XwmId, deferred: Vec<Deferred>) {
        for call in deferred {
            match call {
                Deferred::RequestSink { target, timestamp } => {
                    if let Some(sink) = state.new_selection_sink(id, target) {
                        state.xwm_state(id).attach_sink(target, timestamp, sink);
                    }
                }
                Deferred::SelectionChanged {
                    target,
                    added,
                    removed,
                } => state.selection_changed(id, target, &added, &removed),
                Deferred::SendSelection { target, mime_type, fd } => {
                    state.send_selection(id, target, mime_type, fd)
                }
            }
        }
    }

    fn attach_sink(&mut self, target: SelectionTarget, timestamp: Timestamp, mut sink: Box<dyn SelectionSink>) {
        match self.selection_mut(target).shadow.as_mut() {
            Some(Shadow::X11(source)) if source.timestamp == timestamp && source.sink.is_none() => {
                source.set_source(sink)
            }
            _ => {
                debug!(?target, "Selection owner changed before the sink was created");
                sink.cancelled();
            }
        }
    }

    /// A wayland client requests the X11-owned selection `target` as `mime_type`, to be written into `fd`
    ///
    /// `fd` is closed right away if the selection is not owned by an X11 client offering `mime_type`.
    pub fn send_selection(
        &mut self,
        target: SelectionTarget,
        mime_type: String,
        fd: OwnedFd,
    ) -> Result<(), XwmError> {
        let selection = self.selection_mut(target);
        match selection.shadow.as_mut() {
            Some(Shadow::X11(source)) => {
                source.start_transfer(&selection.conn, &selection.atoms, selection.atom, &mime_type, fd)
            }
            _ => {
                debug!(?target, mime_type, "Selection not owned by X11, closing transfer");
                Ok(())
            }
        }
    }

    /// A wayland client set the selection `target`
    ///
    /// `Some(mime_types)` takes the X11 selection on behalf of the wayland source. `None` gives it up
    /// if it was held for wayland.
    pub fn new_selection<D>(
        &mut self,
        target: SelectionTarget,
        mime_types: Option<Vec<String>>,
        handle: &LoopHandle<'_, D>,
    ) -> Result<(), XwmError> {
        let selection = self.selection_mut(target);
        match mime_types {
            Some(mime_types) => selection.claim(mime_types, handle),
            None => selection.release(handle),
        }
    }

    /// Current owner of `target`
    pub fn selection_owner(&self, target: SelectionTarget) -> SelectionOwner {
        match self.selection(target).shadow.as_ref() {
            Some(Shadow::X11(source)) => SelectionOwner::X11(source.owner),
            Some(Shadow::Wayland(_)) => SelectionOwner::Wayland,
            None => SelectionOwner::None,
        }
    }

    /// Mime types currently offered through `target`
    pub fn offered_mime_types(&self, target: SelectionTarget) -> Vec<String> {
        match self.selection(target).shadow.as_ref() {
            Some(Shadow::X11(source)) => source.offers.mime_ids(),
            Some(Shadow::Wayland(proxy)) => proxy.mime_types.clone(),
            None => Vec::new(),
        }
    }

    /// Whether a wayland drag is bridged to X11 at the moment
    pub fn has_active_drag(&self) -> bool {
        self.dnd.drag.is_some()
    }

    /// A wayland client started a drag
    ///
    /// The bridge takes `XdndSelection` on behalf of `source`. An already active drag is cancelled.
    pub fn start_drag<D>(&mut self, source: Arc<dyn Source>, handle: &LoopHandle<'_, D>) -> Result<(), XwmError> {
        if self.dnd.drag.is_some() {
            debug!("New drag replaces the active one");
            self.drag_cancel(handle)?;
        }

        let metadata = source.metadata();
        let type_atoms = dnd::type_atoms(&*self.conn, &mut self.mimes, &metadata)?;
        self.dnd.selection.claim(metadata.mime_types.clone(), handle)?;
        debug!(mime_types = ?metadata.mime_types, actions = ?metadata.dnd_actions, "Drag started");

        self.dnd.drag = Some(WlToXDrag {
            source,
            metadata,
            type_atoms,
            visit: None,
            timer: None,
        });
        Ok(())
    }

    /// The pointer of the active drag moved to `position` in root coordinates
    ///
    /// `target` is the X11 window under the pointer, if any. Returns whether the motion was taken by
    /// the bridge or should be handled as a native wayland drag motion.
    pub fn drag_move_filter(
        &mut self,
        target: Option<X11Window>,
        position: Point<i32, Logical>,
    ) -> Result<DragEventReply, XwmError> {
        let Some(drag) = self.dnd.drag.as_mut() else {
            return Ok(DragEventReply::Wayland);
        };
        let conn = &*self.conn;
        let atoms = &self.atoms;

        if let Some(visit) = drag.visit.as_mut().filter(|visit| Some(visit.target) == target) {
            return Ok(match visit.state {
                XvisitState::Entered | XvisitState::Dropped => {
                    visit.send_position(conn, atoms, position)?;
                    DragEventReply::Take
                }
                _ => DragEventReply::Wayland,
            });
        }

        if let Some(mut visit) = drag.visit.take() {
            visit.leave(conn, atoms)?;
        }
        let Some(target) = target else {
            return Ok(DragEventReply::Wayland);
        };

        let mut visit = Xvisit::new(conn, atoms, *self.dnd.selection.window, target, &drag.metadata)?;
        if !visit.is_aware() {
            drag.visit = Some(visit);
            return Ok(DragEventReply::Wayland);
        }

        trace!(target, "Drag entered X11 window");
        visit.enter(conn, atoms, &drag.type_atoms)?;
        visit.send_position(conn, atoms, position)?;
        drag.visit = Some(visit);
        Ok(DragEventReply::Take)
    }

    /// The active drag was dropped
    ///
    /// Returns `true` if it was dropped onto an X11 window, in which case the bridge concludes the drag
    /// source. A target rejecting the drop cancels the source. Otherwise the drop belongs to wayland and
    /// the bridge only releases `XdndSelection`.
    pub fn drag_drop<D>(&mut self, handle: &LoopHandle<'_, D>) -> Result<bool, XwmError>
    where
        D: XwmHandler + 'static,
    {
        let entered = self
            .dnd
            .drag
            .as_ref()
            .and_then(|drag| drag.visit.as_ref())
            .is_some_and(|visit| visit.state == XvisitState::Entered);
        if !entered {
            self.end_drag(handle)?;
            return Ok(false);
        }

        let Some(drag) = self.dnd.drag.as_mut() else {
            return Ok(false);
        };
        let Some(visit) = drag.visit.as_mut() else {
            return Ok(false);
        };
        if !visit.drop(&*self.conn, &self.atoms, &*drag.source)? {
            drag.source.cancel();
            self.end_drag(handle)?;
            return Ok(true);
        }

        let id = self.id;
        let loop_handle = handle.clone();
        let timer = handle
            .insert_source(
                Timer::from_duration(self.dnd.finished_timeout),
                move |_, _, data: &mut D| {
                    data.xwm_state(id).dnd_timeout(&loop_handle);
                    TimeoutAction::Drop
                },
            )
            .map_err(|err| err.error)?;
        drag.timer = Some(timer);
        Ok(true)
    }

    /// The active drag was cancelled
    ///
    /// Leaves the current X11 target and releases `XdndSelection`. The drag source is not notified.
    pub fn drag_cancel<D>(&mut self, handle: &LoopHandle<'_, D>) -> Result<(), XwmError> {
        if let Some(drag) = self.dnd.drag.as_mut() {
            if let Some(visit) = drag.visit.as_mut() {
                visit.leave(&*self.conn, &self.atoms)?;
            }
        }
        self.end_drag(handle)
    }

    fn end_drag<D>(&mut self, handle: &LoopHandle<'_, D>) -> Result<(), XwmError> {
        if let Some(mut drag) = self.dnd.drag.take() {
            if let Some(timer) = drag.timer.take() {
                handle.remove(timer);
            }
            trace!(visit = ?drag.visit, "Drag ended");
        }
        self.dnd.selection.release(handle)
    }

    fn dnd_timeout<D>(&mut self, handle: &LoopHandle<'_, D>) {
        let Some(drag) = self.dnd.drag.as_mut() else {
            return;
        };
        // the timer is dropped by returning `TimeoutAction::Drop`
        drag.timer.take();

        warn!("Drop target did not finish the drop in time");
        let mut undecided = false;
        if let Some(visit) = drag.visit.as_mut() {
            if visit.has_pending_drop() {
                undecided = true;
                if let Err(err) = visit.leave(&*self.conn, &self.atoms) {
                    warn!(?err, "Failed to leave the drop target");
                }
            }
            visit.state = XvisitState::Finished;
        }
        if undecided {
            drag.source.cancel();
        } else {
            drag.source.finished();
        }
        if let Err(err) = self.end_drag(handle) {
            warn!(?err, "Failed to release XdndSelection");
        }
    }

    fn dnd_client_message<D>(&mut self, msg: &ClientMessageEvent, handle: &LoopHandle<'_, D>) -> Result<bool, XwmError> {
        if msg.format != 32 || (msg.type_ != self.atoms.XdndStatus && msg.type_ != self.atoms.XdndFinished) {
            return Ok(false);
        }

        let data = msg.data.as_data32();
        let Some(drag) = self.dnd.drag.as_mut() else {
            trace!("Xdnd message without an active drag");
            return Ok(true);
        };
        let Some(visit) = drag.visit.as_mut() else {
            return Ok(true);
        };

        if msg.type_ == self.atoms.XdndStatus {
            return Ok(match visit.handle_status(&*self.conn, &self.atoms, &*drag.source, data)? {
                StatusReply::Foreign => false,
                StatusReply::Handled => true,
                StatusReply::DropRefused => {
                    drag.source.cancel();
                    self.end_drag(handle)?;
                    true
                }
            });
        }

        let consumed = visit.handle_finished(&*drag.source, data);
        if consumed && visit.state == XvisitState::Finished {
            self.end_drag(handle)?;
        }
        Ok(consumed)
    }

    /// Abort everything involving `window`
    ///
    /// Returns `true` if the window was involved in a transfer or was the target of the drag.
    pub fn window_destroyed<D>(&mut self, window: X11Window, handle: &LoopHandle<'_, D>) -> bool {
        let mut res = self.clipboard.window_destroyed(&window, handle);
        res |= self.primary.window_destroyed(&window, handle);
        res |= self.dnd.selection.window_destroyed(&window, handle);

        if let Some(drag) = self.dnd.drag.as_mut() {
            if drag.visit.as_ref().is_some_and(|visit| visit.target == window) {
                debug!(target = window, "Drag target destroyed");
                drag.visit = None;
                res = true;
            }
        }
        res
    }

    fn incoming_writable(&mut self, selection: Atom, window: X11Window, fd: BorrowedFd<'_>) -> PostAction {
        match self.selection_by_atom_mut(selection) {
            Some(selection) => selection.incoming_writable(window, fd),
            None => PostAction::Remove,
        }
    }

    fn outgoing_readable(&mut self, selection: Atom, key: (X11Window, Atom), fd: BorrowedFd<'_>) -> PostAction {
        match self.selection_by_atom_mut(selection) {
            Some(selection) => selection.outgoing_readable(key, fd),
            None => PostAction::Remove,
        }
    }
}
