//! LoRaWAN 1.1 Join Server.
//!
//! The join engine ([`joinserver::JoinServer`]) authenticates end-device
//! join attempts, derives session keys and issues encrypted Join-Accept
//! frames; Network and Application Servers retrieve the issued keys later
//! through [`joinserver::JoinServer::get_nwk_s_keys`] and
//! [`joinserver::JoinServer::get_app_s_key`].
//!
//! Supporting modules: the PHY [`lorawan`] codec, the [`crypto`]
//! primitives, the device [`registry`], and a development UDP [`server`]
//! front end.

pub mod config;
pub mod crypto;
pub mod joinserver;
pub mod lorawan;
pub mod registry;
pub mod server;
pub mod types;
