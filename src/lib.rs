#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like INCR
#![allow(clippy::upper_case_acronyms)]

//! # xwayland-bridge: clipboard and drag'n'drop for Xwayland
//!
//! This crate bridges the two incompatible data transfer models of X11 and wayland, so that
//! copy/paste and drag'n'drop work transparently between native wayland clients and X11 clients
//! running on a rootless Xwayland server.
//!
//! X11 selections are pull-based: the owner of a selection is asked to convert its contents into a
//! window property, possibly in several chunks (`INCR`). The wayland data-device protocol is push-based:
//! a data source is asked to write its contents into a file descriptor. The bridge shadows the
//! current owner of each selection on the other side and streams the payloads between the two
//! transports.
//!
//! ## Structure of the crate
//!
//! - [`xwayland::xwm`] contains the [`X11Bridge`](xwayland::xwm::X11Bridge), which owns the per-selection
//!   state and dispatches X11 events, as well as the drag'n'drop state machine for X11 drop targets.
//! - [`wayland::selection`] contains the types the compositor uses to expose X11-owned selections
//!   to its wayland clients.
//! - [`input::dnd`] contains the drag'n'drop actions and the abstraction over a wayland drag source.
//! - [`utils`] contains small helper types.
//!
//! ## The event loop and state handling
//!
//! The bridge is built around [`calloop`], the same callback-oriented event loop most wayland compositors
//! use. Nothing in this crate ever blocks on a client: every multi-step exchange with an X11 client or
//! a wayland client is split into a request and a continuation that runs once the corresponding event
//! (an X11 event or fd readiness) arrives. The state needed to continue is stored in the bridge, which
//! callbacks access through [`XwmHandler::xwm_state`](xwayland::xwm::XwmHandler::xwm_state).
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod input;
pub mod utils;
pub mod wayland;
pub mod xwayland;

pub mod reexports;
