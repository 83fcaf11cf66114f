//! Linux host for the mesh chat core: LAN discovery, TCP links, identity file, console.

pub mod chat;
pub mod config;
pub mod console;
pub mod discovery;
pub mod store;
pub mod transport;
