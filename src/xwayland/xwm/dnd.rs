use std::{sync::Arc, time::Duration};

use calloop::RegistrationToken;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};
use x11rb::{
    errors::ReplyOrIdError,
    protocol::xproto::{Atom, AtomEnum, ClientMessageEvent, Window as X11Window},
    CURRENT_TIME,
};

use crate::{
    input::dnd::{DndAction, DndActions, Source, SourceMetadata},
    utils::{Logical, Point},
};

use super::{connection::XConnection, mime::MimeTable, selection::XWmSelection, Atoms};

/// Highest version of the Xdnd protocol spoken by the bridge
pub const DND_VERSION: u32 = 5;
/// Lowest version of the Xdnd protocol a target has to speak
pub const MIN_DND_VERSION: u32 = 2;
/// Time a target gets to confirm a drop with `XdndFinished`
pub const DND_FINISHED_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct XWmDnd {
    pub selection: XWmSelection,
    pub drag: Option<WlToXDrag>,
    pub finished_timeout: Duration,
}

impl XWmDnd {
    pub fn new(conn: &Arc<dyn XConnection>, atoms: &Atoms) -> Result<Self, ReplyOrIdError> {
        let selection = XWmSelection::new(conn, atoms, atoms.XdndSelection)?;

        conn.change_property32(
            *selection.window,
            atoms.XdndAware,
            AtomEnum::ATOM.into(),
            &[DND_VERSION],
        )?;
        conn.flush()?;

        Ok(XWmDnd {
            selection,
            drag: None,
            finished_timeout: DND_FINISHED_TIMEOUT,
        })
    }
}

/// A drag started by a wayland client
#[derive(Debug)]
pub struct WlToXDrag {
    pub source: Arc<dyn Source>,
    pub metadata: SourceMetadata,
    /// Advertised types, canonical atom per mime type
    pub type_atoms: Vec<Atom>,
    pub visit: Option<Xvisit>,
    pub timer: Option<RegistrationToken>,
}

impl DndAction {
    fn from_x(atom: Atom, atoms: &Atoms) -> DndAction {
        match atom {
            x if x == atoms.XdndActionCopy => DndAction::Copy,
            x if x == atoms.XdndActionMove => DndAction::Move,
            x if x == atoms.XdndActionAsk => DndAction::Ask,
            _ => DndAction::None,
        }
    }

    fn to_x(self, atoms: &Atoms) -> Atom {
        match self {
            DndAction::Copy => atoms.XdndActionCopy,
            DndAction::Move => atoms.XdndActionMove,
            DndAction::Ask => atoms.XdndActionAsk,
            DndAction::None => AtomEnum::NONE.into(),
        }
    }
}

/// The action proposed to the target, given what the source supports and the target prefers
pub fn propose_action(supported: DndActions, preferred: DndAction) -> DndAction {
    if preferred.is_in(supported) {
        preferred
    } else if DndAction::Copy.is_in(supported) {
        DndAction::Copy
    } else {
        DndAction::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XvisitState {
    NotEntered,
    Entered,
    Dropped,
    Finished,
    Left,
}

/// What an `XdndStatus` meant for a visit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusReply {
    /// Not sent by the visited target
    Foreign,
    Handled,
    /// The target declined a deferred drop and the visit was left
    DropRefused,
}

/// A visit of a wayland drag to an X11 drop target
#[derive(Debug)]
pub struct Xvisit {
    pub target: X11Window,
    pub proxy: Option<X11Window>,
    /// Our `XdndSelection` window, the source window of all messages
    pub window: X11Window,
    pub version: u32,

    pub supported: DndActions,
    pub preferred: DndAction,
    pub proposed: DndAction,

    pub pos_pending: bool,
    pub pos_cached: Option<Point<i32, Logical>>,
    pub last_pos: Point<i32, Logical>,

    pub accepts: bool,
    pub drop_pending: bool,
    pub state: XvisitState,
}

fn get_proxy_window(
    conn: &dyn XConnection,
    atoms: &Atoms,
    window: X11Window,
) -> Result<Option<X11Window>, ReplyOrIdError> {
    let prop = conn.get_property(false, window, atoms.XdndProxy)?;
    if prop.type_ != AtomEnum::WINDOW.into() {
        return Ok(None);
    }
    if let Some(proxy) = prop.value32().and_then(|mut val| val.next()) {
        let prop = conn.get_property(false, proxy, atoms.XdndProxy)?;
        if prop.type_ == AtomEnum::WINDOW.into() {
            if let Some(verify) = prop.value32().and_then(|mut val| val.next()) {
                if proxy == verify {
                    return Ok(Some(proxy));
                }
            }
        }
    }

    Ok(None)
}

impl Xvisit {
    /// Start visiting `target`
    ///
    /// Targets not taking part in the Xdnd protocol produce an already finished visit.
    pub fn new(
        conn: &dyn XConnection,
        atoms: &Atoms,
        window: X11Window,
        target: X11Window,
        metadata: &SourceMetadata,
    ) -> Result<Xvisit, ReplyOrIdError> {
        let mut visit = Xvisit {
            target,
            proxy: None,
            window,
            version: 0,
            supported: metadata.dnd_actions,
            preferred: DndAction::None,
            proposed: propose_action(metadata.dnd_actions, DndAction::None),
            pos_pending: false,
            pos_cached: None,
            last_pos: Point::default(),
            accepts: false,
            drop_pending: false,
            state: XvisitState::Finished,
        };

        visit.proxy = get_proxy_window(conn, atoms, target)?;
        let prop = conn.get_property(false, visit.proxy.unwrap_or(target), atoms.XdndAware)?;
        if prop.type_ != AtomEnum::ATOM.into() {
            trace!(target, "Drag target is not XdndAware");
            return Ok(visit);
        }
        let Some(client_ver) = prop.value32().and_then(|mut val| val.next()) else {
            return Ok(visit);
        };
        if client_ver < MIN_DND_VERSION {
            debug!(target, client_ver, "Drag target speaks an unsupported Xdnd version");
            return Ok(visit);
        }

        // we need to learn about the target going away
        conn.watch_properties(target)?;
        visit.version = client_ver.min(DND_VERSION);
        visit.state = XvisitState::NotEntered;
        Ok(visit)
    }

    pub fn is_aware(&self) -> bool {
        self.version != 0
    }

    fn send_message(
        &self,
        conn: &dyn XConnection,
        type_: Atom,
        data: [u32; 5],
    ) -> Result<(), ReplyOrIdError> {
        conn.send_client_message(
            self.proxy.unwrap_or(self.target),
            ClientMessageEvent::new(32, self.target, type_, data),
        )?;
        conn.flush()
    }

    pub fn enter(&mut self, conn: &dyn XConnection, atoms: &Atoms, type_atoms: &[Atom]) -> Result<(), ReplyOrIdError> {
        if self.state != XvisitState::NotEntered {
            return Ok(());
        }

        let mut enter_data = [
            self.window,
            self.version << 24,
            AtomEnum::NONE.into(),
            AtomEnum::NONE.into(),
            AtomEnum::NONE.into(),
        ];
        for (i, mime_type) in type_atoms.iter().take(3).enumerate() {
            enter_data[i + 2] = *mime_type;
        }

        if type_atoms.len() > 3 {
            enter_data[1] |= 1;
            conn.change_property32(self.window, atoms.XdndTypeList, AtomEnum::ATOM.into(), type_atoms)?;
        } else {
            conn.delete_property(self.window, atoms.XdndTypeList)?;
        }

        trace!("Sending XdndEnter: {:?}", enter_data);
        self.send_message(conn, atoms.XdndEnter, enter_data)?;
        self.state = XvisitState::Entered;
        Ok(())
    }

    pub fn send_position(
        &mut self,
        conn: &dyn XConnection,
        atoms: &Atoms,
        pos: Point<i32, Logical>,
    ) -> Result<(), ReplyOrIdError> {
        if self.state != XvisitState::Entered {
            return Ok(());
        }
        if self.pos_pending {
            self.pos_cached = Some(pos);
            return Ok(());
        }

        let data = [
            self.window,
            0,
            pos.to_xdnd_coords(),
            CURRENT_TIME,
            self.proposed.to_x(atoms),
        ];
        trace!("Sending XdndPosition: {:?}", data);
        self.send_message(conn, atoms.XdndPosition, data)?;
        self.last_pos = pos;
        self.pos_pending = true;
        Ok(())
    }

    fn send_drop(&mut self, conn: &dyn XConnection, atoms: &Atoms) -> Result<(), ReplyOrIdError> {
        let data = [self.window, 0, CURRENT_TIME, 0, 0];
        trace!("Sending XdndDrop: {:?}", data);
        self.drop_pending = false;
        self.send_message(conn, atoms.XdndDrop, data)
    }

    pub fn handle_status(
        &mut self,
        conn: &dyn XConnection,
        atoms: &Atoms,
        source: &dyn Source,
        data: [u32; 5],
    ) -> Result<StatusReply, ReplyOrIdError> {
        if data[0] != self.target {
            return Ok(StatusReply::Foreign);
        }
        if !matches!(self.state, XvisitState::Entered | XvisitState::Dropped) {
            return Ok(StatusReply::Handled);
        }

        let deciding_drop = self.has_pending_drop();
        let mut pos_update = false;
        self.accepts = (data[1] & 1) != 0;
        if self.state == XvisitState::Entered || deciding_drop {
            let old_action = self.proposed;
            self.preferred = DndAction::from_x(data[4], atoms);
            self.proposed = propose_action(self.supported, self.preferred);
            if old_action != self.proposed {
                source.choose_action(self.proposed);
                pos_update = true;
            }
        }
        // TODO: rectangle in data[2] and data[3] for optimizations

        self.pos_pending = false;
        if deciding_drop {
            if !self.accepts || self.proposed == DndAction::None {
                debug!(target = self.target, "Drag target does not accept the drop");
                self.leave(conn, atoms)?;
                return Ok(StatusReply::DropRefused);
            }
            source.drop_performed();
            self.send_drop(conn, atoms)?;
        } else if let Some(pos) = self.pos_cached.take().or(pos_update.then_some(self.last_pos)) {
            self.send_position(conn, atoms, pos)?;
        }
        Ok(StatusReply::Handled)
    }

    /// Drop onto the target
    ///
    /// Returns `false` if the target does not accept the drag, in which case the visit is left. While a
    /// position still awaits its `XdndStatus` the drop is deferred and decided by that status.
    pub fn drop(&mut self, conn: &dyn XConnection, atoms: &Atoms, source: &dyn Source) -> Result<bool, ReplyOrIdError> {
        if self.state != XvisitState::Entered {
            return Ok(false);
        }
        self.pos_cached = None;
        if self.pos_pending {
            trace!(target = self.target, "Deferring XdndDrop until XdndStatus");
            self.state = XvisitState::Dropped;
            self.drop_pending = true;
            return Ok(true);
        }
        if !self.accepts || self.proposed == DndAction::None {
            debug!(target = self.target, "Drag target does not accept the drop");
            self.leave(conn, atoms)?;
            return Ok(false);
        }

        self.state = XvisitState::Dropped;
        source.drop_performed();
        self.send_drop(conn, atoms)?;
        Ok(true)
    }

    /// Dropped, but the target has not told yet whether it takes the drop
    pub fn has_pending_drop(&self) -> bool {
        self.state == XvisitState::Dropped && self.drop_pending
    }

    /// Returns `false` if the message was not sent by the visited target
    pub fn handle_finished(&mut self, source: &dyn Source, data: [u32; 5]) -> bool {
        trace!("Got XdndFinished msg: {:?}", data);
        if data[0] != self.target {
            return false;
        }
        // no XdndDrop was sent yet
        if self.state != XvisitState::Dropped || self.drop_pending {
            return true;
        }

        self.state = XvisitState::Finished;
        if self.version >= 5 && (data[1] & 1) == 0 {
            debug!(target = self.target, "Drop was not accepted");
            source.cancel();
        } else {
            source.finished();
        }
        true
    }

    pub fn leave(&mut self, conn: &dyn XConnection, atoms: &Atoms) -> Result<(), ReplyOrIdError> {
        let pending_drop = self.has_pending_drop();
        if self.state == XvisitState::Entered || pending_drop {
            let data = [self.window, 0, 0, 0, 0];
            trace!("Sending XdndLeave: {:?}", data);
            if let Err(err) = self.send_message(conn, atoms.XdndLeave, data) {
                warn!("Failed to send XdndLeave event: {:?}", err);
            }
        }
        if matches!(self.state, XvisitState::NotEntered | XvisitState::Entered) || pending_drop {
            self.state = XvisitState::Left;
            self.drop_pending = false;
        }
        Ok(())
    }
}

/// Canonical atoms of a drag source's mime types, deduplicated
pub fn type_atoms(
    conn: &dyn XConnection,
    mimes: &mut MimeTable,
    metadata: &SourceMetadata,
) -> Result<Vec<Atom>, ReplyOrIdError> {
    let mut atoms = SmallVec::<[Atom; 8]>::new();
    for mime_type in &metadata.mime_types {
        let atom = mimes.canonical_atom(conn, mime_type)?;
        if !atoms.contains(&atom) {
            atoms.push(atom);
        }
    }
    Ok(atoms.into_vec())
}
