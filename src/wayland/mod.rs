//! Wayland-facing interfaces of the bridge
//!
//! The wayland protocol objects themselves (data devices, data sources, primary selection devices)
//! are implemented by the compositor. This module contains the small interfaces through which the
//! bridge presents X11-owned data to them.

pub mod selection;
