//! The X11 requests issued by the bridge
//!
//! The bridge talks to the X server through the [`XConnection`] trait, which is implemented for
//! [`RustConnection`]. Replies are only ever waited upon for requests answered by the X server itself
//! (atoms, properties), never for anything depending on another X11 client.

use std::fmt;

use x11rb::{
    connection::Connection,
    errors::ReplyOrIdError,
    protocol::{
        xfixes::{ConnectionExt as XfixesExt, SelectionEventMask},
        xproto::{
            Atom, AtomEnum, ChangeWindowAttributesAux, ClientMessageEvent, ConnectionExt as XprotoExt,
            CreateWindowAux, EventMask, GetPropertyReply, PropMode, SelectionNotifyEvent, Window as X11Window,
            WindowClass,
        },
    },
    rust_connection::RustConnection,
    wrapper::ConnectionExt as WrapperExt,
};

/// Maximum length (in 32-bit units) of property reads
pub const MAX_PROPERTY_LENGTH: u32 = 0x1fffffff;

/// Connection to the X server as used by the bridge
pub trait XConnection: fmt::Debug {
    /// Create an unmapped helper window, reporting property changes
    fn create_selection_window(&self) -> Result<X11Window, ReplyOrIdError>;
    /// Destroy a window created by [`XConnection::create_selection_window`]
    fn destroy_window(&self, window: X11Window) -> Result<(), ReplyOrIdError>;
    /// Intern the atom with the given name
    fn intern_atom(&self, name: &str) -> Result<Atom, ReplyOrIdError>;
    /// Look up the name of an atom
    fn atom_name(&self, atom: Atom) -> Result<String, ReplyOrIdError>;
    /// Set the owner of a selection
    fn set_selection_owner(&self, owner: X11Window, selection: Atom, time: u32) -> Result<(), ReplyOrIdError>;
    /// Subscribe to XFixes ownership change events of `selection` on `window`
    fn watch_selection(&self, window: X11Window, selection: Atom) -> Result<(), ReplyOrIdError>;
    /// Subscribe to property change and destruction events of a foreign window
    fn watch_properties(&self, window: X11Window) -> Result<(), ReplyOrIdError>;
    /// Ask the owner of `selection` to convert it to `target` and store it in `property` of `requestor`
    fn convert_selection(
        &self,
        requestor: X11Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: u32,
    ) -> Result<(), ReplyOrIdError>;
    /// Read a whole property of any type, optionally deleting it
    fn get_property(
        &self,
        delete: bool,
        window: X11Window,
        property: Atom,
    ) -> Result<GetPropertyReply, ReplyOrIdError>;
    /// Replace a property with 8-bit data
    fn change_property8(
        &self,
        window: X11Window,
        property: Atom,
        type_: Atom,
        data: &[u8],
    ) -> Result<(), ReplyOrIdError>;
    /// Replace a property with 32-bit data
    fn change_property32(
        &self,
        window: X11Window,
        property: Atom,
        type_: Atom,
        data: &[u32],
    ) -> Result<(), ReplyOrIdError>;
    /// Delete a property
    fn delete_property(&self, window: X11Window, property: Atom) -> Result<(), ReplyOrIdError>;
    /// Send a `SelectionNotify` event to its requestor
    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), ReplyOrIdError>;
    /// Send a client message to `destination`
    fn send_client_message(
        &self,
        destination: X11Window,
        event: ClientMessageEvent,
    ) -> Result<(), ReplyOrIdError>;
    /// Flush all pending requests
    fn flush(&self) -> Result<(), ReplyOrIdError>;
}

impl XConnection for RustConnection {
    fn create_selection_window(&self) -> Result<X11Window, ReplyOrIdError> {
        // XWayland only uses screen 0.
        let screen = &self.setup().roots[0];
        let window = self.generate_id()?;
        XprotoExt::create_window(
            self,
            screen.root_depth,
            window,
            screen.root,
            0,
            0,
            10,
            10,
            0,
            WindowClass::INPUT_OUTPUT,
            screen.root_visual,
            &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )?;
        Ok(window)
    }

    fn destroy_window(&self, window: X11Window) -> Result<(), ReplyOrIdError> {
        XprotoExt::destroy_window(self, window)?;
        Ok(())
    }

    fn intern_atom(&self, name: &str) -> Result<Atom, ReplyOrIdError> {
        Ok(XprotoExt::intern_atom(self, false, name.as_bytes())?.reply()?.atom)
    }

    fn atom_name(&self, atom: Atom) -> Result<String, ReplyOrIdError> {
        let reply = XprotoExt::get_atom_name(self, atom)?.reply()?;
        Ok(String::from_utf8_lossy(&reply.name).into_owned())
    }

    fn set_selection_owner(&self, owner: X11Window, selection: Atom, time: u32) -> Result<(), ReplyOrIdError> {
        XprotoExt::set_selection_owner(self, owner, selection, time)?;
        Ok(())
    }

    fn watch_selection(&self, window: X11Window, selection: Atom) -> Result<(), ReplyOrIdError> {
        XfixesExt::xfixes_select_selection_input(
            self,
            window,
            selection,
            SelectionEventMask::SET_SELECTION_OWNER
                | SelectionEventMask::SELECTION_WINDOW_DESTROY
                | SelectionEventMask::SELECTION_CLIENT_CLOSE,
        )?;
        Ok(())
    }

    fn watch_properties(&self, window: X11Window) -> Result<(), ReplyOrIdError> {
        XprotoExt::change_window_attributes(
            self,
            window,
            &ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE | EventMask::STRUCTURE_NOTIFY),
        )?;
        Ok(())
    }

    fn convert_selection(
        &self,
        requestor: X11Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: u32,
    ) -> Result<(), ReplyOrIdError> {
        XprotoExt::convert_selection(self, requestor, selection, target, property, time)?;
        Ok(())
    }

    fn get_property(
        &self,
        delete: bool,
        window: X11Window,
        property: Atom,
    ) -> Result<GetPropertyReply, ReplyOrIdError> {
        Ok(
            XprotoExt::get_property(self, delete, window, property, AtomEnum::ANY, 0, MAX_PROPERTY_LENGTH)?
                .reply()?,
        )
    }

    fn change_property8(
        &self,
        window: X11Window,
        property: Atom,
        type_: Atom,
        data: &[u8],
    ) -> Result<(), ReplyOrIdError> {
        WrapperExt::change_property8(self, PropMode::REPLACE, window, property, type_, data)?;
        Ok(())
    }

    fn change_property32(
        &self,
        window: X11Window,
        property: Atom,
        type_: Atom,
        data: &[u32],
    ) -> Result<(), ReplyOrIdError> {
        WrapperExt::change_property32(self, PropMode::REPLACE, window, property, type_, data)?;
        Ok(())
    }

    fn delete_property(&self, window: X11Window, property: Atom) -> Result<(), ReplyOrIdError> {
        XprotoExt::delete_property(self, window, property)?;
        Ok(())
    }

    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), ReplyOrIdError> {
        XprotoExt::send_event(self, false, event.requestor, EventMask::NO_EVENT, event)?;
        Ok(())
    }

    fn send_client_message(
        &self,
        destination: X11Window,
        event: ClientMessageEvent,
    ) -> Result<(), ReplyOrIdError> {
        XprotoExt::send_event(self, false, destination, EventMask::NO_EVENT, event)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), ReplyOrIdError> {
        Connection::flush(self)?;
        Ok(())
    }
}
