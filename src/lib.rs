//! This crate provides a rust client for the [KATCP](https://katcp-python.readthedocs.io/en/latest/_downloads/361189acb383a294be20d6c10c257cb4/NRF-KAT7-6.0-IFCE-002-Rev5-1.pdf)
//! monitor and control protocol, as described by the Karoo Array Telescope (KAT) project from the Square Kilometer Array (SKA) South Africa group.
//!
//! ## Description
//!
//! From the official specification:
//! > Broadly speaking, KATCP consists of newline-separated text messages sent asynchronously over a TCP/IP
//! > stream. There are three categories of messages: requests, replies and informs. Request messages expect some
//! > sort of acknowledgement. Reply messages acknowledge requests. Inform messages require no acknowledgement
//! > Inform messages are of two types: those sent synchronously as part of a reply and those sent asynchronously.
//!
//! This crate provides the core [Message](protocol::Message) type with its wire codec and the client
//! machinery for talking to a katcp device: a connection that maintains itself across network
//! failures ([DeviceClient](client::DeviceClient)), a synchronous request API
//! ([BlockingClient](client::BlockingClient)) and a concurrent callback-driven request API
//! ([CallbackClient](client::CallbackClient)). Servers, the sensor catalogue and sampling
//! strategies are out of scope here.
//!
//! ## Picking a client
//!
//! |                              | one request at a time | many concurrent requests |
//! |------------------------------|-----------------------|--------------------------|
//! | call blocks until the reply  | [BlockingClient](client::BlockingClient) | [CallbackClient::blocking_request](client::CallbackClient::blocking_request) |
//! | callbacks on the I/O thread  |                       | [CallbackClient::request](client::CallbackClient::request) |
//!
//! Both clients correlate replies to requests with katcp message ids when the server advertises
//! support for them in its `#version-connect katcp-protocol` handshake (protocol version 5 and
//! up), and fall back to strict in-order name matching against older servers.
//!
//! ## Logging
//!
//! The crate logs through the [log](https://docs.rs/log) facade: every sent and received message
//! at debug level, dropped lines and handler panics at error level, and reconnect progress at
//! warn level once failures persist.

pub mod arguments;
pub mod client;
pub mod prelude;
pub mod protocol;
pub mod version;
mod utils;
