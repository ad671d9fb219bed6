// LNP/BP Core Library implementing LNPBP specifications & standards
// Written in 2019-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate strict_encoding;

#[cfg(feature = "serde")]
extern crate serde_crate as serde;

pub mod client;
pub mod error;
pub mod keys;
pub mod lifecycle;
pub mod message;
pub mod policy;
pub mod registry;
pub mod server;
pub mod state;
pub mod tx;
pub mod wallet;

pub use client::ClientChannel;
pub use error::{ChannelError, ErrorCode};
pub use keys::{ChannelKeys, ServerId};
pub use lifecycle::{ClientLifecycle, ServerLifecycle};
pub use message::Message;
pub use policy::{ChannelProperties, ServerPolicy, VersionSelector};
pub use registry::{PreExpiryScheduler, StoredChannelRegistry};
pub use server::ServerChannel;
pub use state::{ChannelState, IncrementedPayment, V1ChannelState, V2ChannelState};
pub use wallet::{Connection, Wallet};
