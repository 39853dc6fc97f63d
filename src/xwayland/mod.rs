//! XWayland utilities
//!
//! This module contains the selection and drag'n'drop bridge between an Xwayland server and the
//! wayland compositor hosting it.
//!
//! The bridge acts as a regular X11 client on the Xwayland connection of the window manager.
//! See [`xwm`] for the entry points.
pub mod xwm;

pub use self::xwm::{X11Bridge, XwmHandler};
