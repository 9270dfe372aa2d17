//! # Reverb Core
//!
//! Shared identifiers, the node-to-node wire codec, and node configuration
//! for the Reverb messaging broker.

/// Node configuration schema and validation.
pub mod config;

/// Core error types.
pub mod error;

/// Wire frame and varint codecs.
pub mod frame;

/// Fundamental identifier types.
pub mod types;

pub use crate::{
    config::{NodeConfig, PeerConfig},
    error::Error,
    frame::Frame,
    types::{
        channel_from_key, channel_key, fnv1a, person_channel_uids, slot_key, ChannelType, LogIndex,
        MessageId, NodeId, SlotId, Term,
    },
};
