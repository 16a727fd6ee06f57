//! Nodelet library - dispatch client, loop suppression and packet io.

pub mod agent;
pub mod client;
pub mod loopguard;
pub mod packetio;

pub(crate) mod latch;
