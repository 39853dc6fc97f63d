//!
//! Input abstractions
//!
//! This module provides the types an input-redirection layer needs to hand drag'n'drop operations
//! started by wayland clients over to the bridge. Pointer and keyboard handling itself, as well as
//! focus tracking, stay with the compositor.

pub mod dnd;
