//! In-memory X server used by the unit tests

use std::{collections::HashMap, sync::Mutex};

use x11rb::{
    errors::{ConnectionError, ReplyOrIdError},
    protocol::xproto::{
        Atom, AtomEnum, ClientMessageEvent, GetPropertyReply, SelectionNotifyEvent, Window as X11Window,
    },
};

use super::{connection::XConnection, Atoms};

/// A request issued by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CreateWindow(X11Window),
    DestroyWindow(X11Window),
    SetSelectionOwner {
        owner: X11Window,
        selection: Atom,
    },
    WatchSelection {
        window: X11Window,
        selection: Atom,
    },
    WatchProperties(X11Window),
    ConvertSelection {
        requestor: X11Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: u32,
    },
    ChangeProperty {
        window: X11Window,
        property: Atom,
        type_: Atom,
        format: u8,
        data: Vec<u8>,
    },
    DeleteProperty {
        window: X11Window,
        property: Atom,
    },
    SelectionNotify {
        requestor: X11Window,
        selection: Atom,
        target: Atom,
        property: Atom,
        time: u32,
    },
    ClientMessage {
        destination: X11Window,
        window: X11Window,
        type_: Atom,
        data: [u32; 5],
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredProperty {
    pub type_: Atom,
    pub format: u8,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    atoms: HashMap<String, Atom>,
    names: HashMap<Atom, String>,
    next_atom: Atom,
    next_window: X11Window,
    properties: HashMap<(X11Window, Atom), StoredProperty>,
    requests: Vec<Request>,
    unwatchable: Vec<X11Window>,
}

impl MockState {
    fn intern(&mut self, name: &str) -> Atom {
        if let Some(atom) = self.atoms.get(name) {
            return *atom;
        }
        let atom = self.next_atom;
        self.next_atom += 1;
        self.atoms.insert(name.to_owned(), atom);
        self.names.insert(atom, name.to_owned());
        atom
    }

    fn change_property(&mut self, window: X11Window, property: Atom, type_: Atom, format: u8, data: Vec<u8>) {
        self.properties.insert(
            (window, property),
            StoredProperty {
                type_,
                format,
                data: data.clone(),
            },
        );
        self.requests.push(Request::ChangeProperty {
            window,
            property,
            type_,
            format,
            data,
        });
    }
}

/// Records every request and stores window properties, nothing else
#[derive(Debug)]
pub struct MockConnection {
    state: Mutex<MockState>,
}

pub fn to_bytes32(data: &[u32]) -> Vec<u8> {
    data.iter().flat_map(|value| value.to_ne_bytes()).collect()
}

impl MockConnection {
    pub fn new() -> MockConnection {
        let mut state = MockState {
            atoms: HashMap::new(),
            names: HashMap::new(),
            next_atom: 100,
            next_window: 0x200000,
            properties: HashMap::new(),
            requests: Vec::new(),
            unwatchable: Vec::new(),
        };
        for (name, atom) in [
            ("PRIMARY", AtomEnum::PRIMARY),
            ("ATOM", AtomEnum::ATOM),
            ("INTEGER", AtomEnum::INTEGER),
            ("STRING", AtomEnum::STRING),
            ("WINDOW", AtomEnum::WINDOW),
        ] {
            let atom: Atom = atom.into();
            state.atoms.insert(name.to_owned(), atom);
            state.names.insert(atom, name.to_owned());
        }

        MockConnection {
            state: Mutex::new(state),
        }
    }

    pub fn intern(&self, name: &str) -> Atom {
        self.state.lock().unwrap().intern(name)
    }

    pub fn atoms(&self) -> Atoms {
        Atoms {
            CLIPBOARD: self.intern("CLIPBOARD"),
            PRIMARY: self.intern("PRIMARY"),
            XdndSelection: self.intern("XdndSelection"),
            TARGETS: self.intern("TARGETS"),
            TIMESTAMP: self.intern("TIMESTAMP"),
            MULTIPLE: self.intern("MULTIPLE"),
            SAVE_TARGETS: self.intern("SAVE_TARGETS"),
            DELETE: self.intern("DELETE"),
            INCR: self.intern("INCR"),
            UTF8_STRING: self.intern("UTF8_STRING"),
            TEXT: self.intern("TEXT"),
            STRING: self.intern("STRING"),
            _WL_SELECTION: self.intern("_WL_SELECTION"),
            XdndAware: self.intern("XdndAware"),
            XdndProxy: self.intern("XdndProxy"),
            XdndTypeList: self.intern("XdndTypeList"),
            XdndEnter: self.intern("XdndEnter"),
            XdndPosition: self.intern("XdndPosition"),
            XdndStatus: self.intern("XdndStatus"),
            XdndLeave: self.intern("XdndLeave"),
            XdndDrop: self.intern("XdndDrop"),
            XdndFinished: self.intern("XdndFinished"),
            XdndActionCopy: self.intern("XdndActionCopy"),
            XdndActionMove: self.intern("XdndActionMove"),
            XdndActionAsk: self.intern("XdndActionAsk"),
        }
    }

    /// Set a property as an X11 client would, without recording a request
    pub fn set_property8(&self, window: X11Window, property: Atom, type_: Atom, data: &[u8]) {
        self.state.lock().unwrap().properties.insert(
            (window, property),
            StoredProperty {
                type_,
                format: 8,
                data: data.to_vec(),
            },
        );
    }

    pub fn set_property32(&self, window: X11Window, property: Atom, type_: Atom, data: &[u32]) {
        self.state.lock().unwrap().properties.insert(
            (window, property),
            StoredProperty {
                type_,
                format: 32,
                data: to_bytes32(data),
            },
        );
    }

    pub fn property(&self, window: X11Window, property: Atom) -> Option<StoredProperty> {
        self.state.lock().unwrap().properties.get(&(window, property)).cloned()
    }

    /// Read and delete a property, as a requestor fetching a chunk does
    pub fn take_property(&self, window: X11Window, property: Atom) -> Option<StoredProperty> {
        self.state.lock().unwrap().properties.remove(&(window, property))
    }

    /// Make watching the properties of `window` fail, as for a window that is already gone
    pub fn refuse_watching(&self, window: X11Window) {
        self.state.lock().unwrap().unwatchable.push(window);
    }

    pub fn take_requests(&self) -> Vec<Request> {
        std::mem::take(&mut self.state.lock().unwrap().requests)
    }
}

impl XConnection for MockConnection {
    fn create_selection_window(&self) -> Result<X11Window, ReplyOrIdError> {
        let mut state = self.state.lock().unwrap();
        let window = state.next_window;
        state.next_window += 1;
        state.requests.push(Request::CreateWindow(window));
        Ok(window)
    }

    fn destroy_window(&self, window: X11Window) -> Result<(), ReplyOrIdError> {
        let mut state = self.state.lock().unwrap();
        state.properties.retain(|(owner, _), _| *owner != window);
        state.requests.push(Request::DestroyWindow(window));
        Ok(())
    }

    fn intern_atom(&self, name: &str) -> Result<Atom, ReplyOrIdError> {
        Ok(self.intern(name))
    }

    fn atom_name(&self, atom: Atom) -> Result<String, ReplyOrIdError> {
        self.state
            .lock()
            .unwrap()
            .names
            .get(&atom)
            .cloned()
            .ok_or(ReplyOrIdError::ConnectionError(ConnectionError::UnknownError))
    }

    fn set_selection_owner(&self, owner: X11Window, selection: Atom, _time: u32) -> Result<(), ReplyOrIdError> {
        self.state
            .lock()
            .unwrap()
            .requests
            .push(Request::SetSelectionOwner { owner, selection });
        Ok(())
    }

    fn watch_selection(&self, window: X11Window, selection: Atom) -> Result<(), ReplyOrIdError> {
        self.state
            .lock()
            .unwrap()
            .requests
            .push(Request::WatchSelection { window, selection });
        Ok(())
    }

    fn watch_properties(&self, window: X11Window) -> Result<(), ReplyOrIdError> {
        let mut state = self.state.lock().unwrap();
        if state.unwatchable.contains(&window) {
            return Err(ReplyOrIdError::ConnectionError(ConnectionError::UnknownError));
        }
        state.requests.push(Request::WatchProperties(window));
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
        self.state.lock().unwrap().requests.push(Request::ConvertSelection {
            requestor,
            selection,
            target,
            property,
            time,
        });
        Ok(())
    }

    fn get_property(
        &self,
        delete: bool,
        window: X11Window,
        property: Atom,
    ) -> Result<GetPropertyReply, ReplyOrIdError> {
        let mut state = self.state.lock().unwrap();
        let stored = if delete {
            state.properties.remove(&(window, property))
        } else {
            state.properties.get(&(window, property)).cloned()
        };

        let reply = match stored {
            Some(stored) => GetPropertyReply {
                format: stored.format,
                sequence: 0,
                length: 0,
                type_: stored.type_,
                bytes_after: 0,
                value_len: (stored.data.len() / (usize::from(stored.format) / 8).max(1)) as u32,
                value: stored.data,
            },
            None => GetPropertyReply {
                format: 0,
                sequence: 0,
                length: 0,
                type_: AtomEnum::NONE.into(),
                bytes_after: 0,
                value_len: 0,
                value: Vec::new(),
            },
        };
        Ok(reply)
    }

    fn change_property8(
        &self,
        window: X11Window,
        property: Atom,
        type_: Atom,
        data: &[u8],
    ) -> Result<(), ReplyOrIdError> {
        self.state
            .lock()
            .unwrap()
            .change_property(window, property, type_, 8, data.to_vec());
        Ok(())
    }

    fn change_property32(
        &self,
        window: X11Window,
        property: Atom,
        type_: Atom,
        data: &[u32],
    ) -> Result<(), ReplyOrIdError> {
        self.state
            .lock()
            .unwrap()
            .change_property(window, property, type_, 32, to_bytes32(data));
        Ok(())
    }

    fn delete_property(&self, window: X11Window, property: Atom) -> Result<(), ReplyOrIdError> {
        let mut state = self.state.lock().unwrap();
        state.properties.remove(&(window, property));
        state.requests.push(Request::DeleteProperty { window, property });
        Ok(())
    }

    fn send_selection_notify(&self, event: SelectionNotifyEvent) -> Result<(), ReplyOrIdError> {
        self.state.lock().unwrap().requests.push(Request::SelectionNotify {
            requestor: event.requestor,
            selection: event.selection,
            target: event.target,
            property: event.property,
            time: event.time,
        });
        Ok(())
    }

    fn send_client_message(
        &self,
        destination: X11Window,
        event: ClientMessageEvent,
    ) -> Result<(), ReplyOrIdError> {
        self.state.lock().unwrap().requests.push(Request::ClientMessage {
            destination,
            window: event.window,
            type_: event.type_,
            data: event.data.as_data32(),
        });
        Ok(())
    }

    fn flush(&self) -> Result<(), ReplyOrIdError> {
        Ok(())
    }
}
