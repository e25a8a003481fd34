//! Standard set of imports for katcp-client
//!
//! This is useful to `use katcp_client::prelude::*;` to satisfy the imports
//! for everyday use of the clients and the message types

pub use crate::{
    arguments::{FromKatcpArgument, KatcpArgument, RetCode, ToKatcpArgument},
    client::{
        BlockingClient, CallbackClient, ClientConfig, ClientError, ClientHandler, DeviceClient,
        Handlers,
    },
    protocol::{KatcpError, Message, MessageKind, MessageResult},
    version::{ProtocolFlag, ProtocolInfo},
};
