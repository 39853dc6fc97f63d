//! Drag'n'Drop related types
//!
//! A wayland client starting a drag provides a [`Source`]. When the drag moves over an X11 window
//! the bridge negotiates one of the [`DndActions`] advertised by the source with the X11 target and
//! reports its choice back through [`Source::choose_action`].

use std::{fmt, os::fd::OwnedFd};

use bitflags::bitflags;

/// Enumeration of valid actions of a Drag'n'Drop operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DndAction {
    /// No action
    #[default]
    None,
    /// Data will be copied
    Copy,
    /// Data will be moved
    Move,
    /// User will be asked how to handle the data
    Ask,
}

bitflags! {
    /// Set of actions supported by a Drag'n'Drop source
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DndActions: u32 {
        /// Data can be copied
        const COPY = 1;
        /// Data can be moved
        const MOVE = 2;
        /// The user can be asked
        const ASK = 4;
    }
}

impl DndAction {
    /// The set containing only this action, empty for [`DndAction::None`]
    pub fn as_flags(self) -> DndActions {
        match self {
            DndAction::None => DndActions::empty(),
            DndAction::Copy => DndActions::COPY,
            DndAction::Move => DndActions::MOVE,
            DndAction::Ask => DndActions::ASK,
        }
    }

    /// Checks if this action is part of the given set
    ///
    /// [`DndAction::None`] is never part of any set.
    pub fn is_in(self, actions: DndActions) -> bool {
        self != DndAction::None && actions.contains(self.as_flags())
    }
}

/// The metadata describing a data source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceMetadata {
    /// The MIME types supported by this source
    pub mime_types: Vec<String>,
    /// The Drag'n'Drop actions supported by this source
    pub dnd_actions: DndActions,
}

/// A Drag'n'Drop data source of a wayland client
///
/// All methods are called from the event loop thread.
pub trait Source: fmt::Debug {
    /// Access the metadata associated with this source.
    fn metadata(&self) -> SourceMetadata;
    /// An action was selected by the target
    fn choose_action(&self, action: DndAction);
    /// The target requests data to be transferred to the given file descriptor for the given mime-type
    fn send(&self, mime_type: &str, fd: OwnedFd);
    /// A drop was performed
    fn drop_performed(&self);
    /// The source is cancelled
    fn cancel(&self);
    /// The source is done
    fn finished(&self);
}

/// What the input-redirection layer should do with a pointer event during a drag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragEventReply {
    /// The event was consumed by the bridge, the target is an X11 window
    Take,
    /// The event should be delivered to the native wayland drag'n'drop handling
    Wayland,
}
