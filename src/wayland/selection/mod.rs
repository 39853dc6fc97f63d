//! Selection types shared between the wayland data-device protocols and the bridge
//!
//! Whenever an X11 client owns the clipboard or the primary selection, the bridge asks the compositor
//! for a [`SelectionSink`] through [`XwmHandler::new_selection_sink`](crate::xwayland::xwm::XwmHandler::new_selection_sink).
//! The sink is the compositor-side data source that stands in for the X11 owner towards wayland clients.
//! A compositor usually has one implementation per protocol, e.g. one setting the `wl_data_device`
//! selection and one setting the `zwp_primary_selection_device_v1` selection.
//!
//! When a wayland client asks the sink for data, the compositor forwards the request with the
//! provided file descriptor to [`X11Bridge::send_selection`](crate::xwayland::xwm::X11Bridge::send_selection).
//!
//! ```no_run
//! use xwayland_bridge::wayland::selection::SelectionSink;
//!
//! #[derive(Debug)]
//! struct ClipboardSink { /* display handle, seat, ... */ }
//!
//! impl SelectionSink for ClipboardSink {
//!     fn offer(&mut self, mime_types: &[String]) {
//!         // set a compositor-owned `wl_data_source` offering `mime_types` as the seat selection
//!     }
//!     fn cancelled(&mut self) {
//!         // clear the seat selection, if it still is ours
//!     }
//! }
//! ```

use std::fmt;

/// The target a selection is meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionTarget {
    /// The primary selection, set by selecting text and pasted with a middle click
    Primary,
    /// The clipboard, set and pasted by explicit actions
    Clipboard,
}

/// Wayland-facing sink of an X11-owned selection
pub trait SelectionSink: fmt::Debug {
    /// The set of offered mime types changed
    ///
    /// `mime_types` is the full, deduplicated list and replaces any previous offer.
    fn offer(&mut self, mime_types: &[String]);

    /// The X11 owner of the selection went away or was replaced by another X11 client
    ///
    /// The sink is dropped right after. It is not called when a wayland client took over the selection.
    fn cancelled(&mut self);
}
