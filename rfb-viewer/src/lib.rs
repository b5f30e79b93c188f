//! # rfb-viewer: headless RFB client
//!
//! Connects to a VNC server through `rfb-core`, logs session events and
//! writes the framebuffer to a PPM image when it stops.

pub mod config;
pub mod snapshot;
