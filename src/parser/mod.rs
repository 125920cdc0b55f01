//! Wire framing for the usbmuxd socket, lockdown style services and AFC

pub mod afc;
pub mod service;
pub mod usbmux;
