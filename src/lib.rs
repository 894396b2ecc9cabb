//! qcon - emulator orchestration and relay service.
//!
//! Provisions hardware-emulator instances (emulator process plus companion
//! JavaScript runtime), tracks their lifecycle, reaps idle or dead ones, and
//! relays the device-protocol and display-protocol WebSocket streams between
//! external clients and each instance's internal ports.

pub mod allocator;
pub mod api;
pub mod config;
pub mod emulator;
pub mod platform;
pub mod privileges;
pub mod registry;
pub mod relay;
pub mod tls;
pub mod watchdog;
