//! # Reverb Broker
//!
//! The channel side of the messaging cluster: per-channel pipelines
//! (decrypt → permission → store → deliver / forward), receiver-tag
//! fan-out, and the node assembly that wires pipelines, replication
//! reactors, slots, and transport together.

/// Node assembly and host surfaces.
pub mod broker;

/// The channel object and stage ladder.
pub mod channel;

/// Broker error types.
pub mod error;

/// In-flight publishes and message ids.
pub mod message;

/// The channel pipeline scheduler.
pub mod pipeline;

/// The per-channel message queue.
pub mod queue;

/// Receiver tags.
pub mod tag;

pub use crate::{
    broker::{Broker, DeliverSink, PayloadDecryptor, PlainDecryptor},
    channel::{Channel, ChannelAction, ChannelBudgets, ChannelRole, ChannelStatus},
    error::{BrokerError, Result},
    message::{ChannelMessage, DeliverBatch, ForwardBatch, MessageIdGenerator, StoredMessage},
    pipeline::{ChannelReactor, ChannelSnapshot, PipelineHost, PipelineOptions},
    queue::MessageQueue,
    tag::{NodeUsers, Tag, TagManager},
};
