//! # pmnet
//!
//! Client library for discovering sensor-publishing hosts on a local
//! network, subscribing to their per-sensor notification and data
//! streams, decoding versioned binary payloads into typed values, and
//! exposing a control plane (read controls, set control values, reset
//! to defaults).
//!
//! This crate is the core only: it does not implement the publisher
//! side, does not encode outbound data messages, does not transcode
//! video, and persists nothing across process lifetimes. Two
//! collaborators are consumed rather than bundled:
//!
//! - the discovery/gossip fabric, modeled as [`discovery::DiscoveryPeer`]
//! - the JPEG/H.264 frame codec, modeled as [`frame::FrameFactory`]
//!
//! ## Shape
//!
//! - [`format`] — the closed `WireFormatVersion` enum and group-name
//!   derivation.
//! - [`formatter`] — per-sensor-kind, per-version binary decoders.
//! - [`sensor`] — [`sensor::Sensor`], one live binding per remote sensor:
//!   sockets, control cache, notification callback chain.
//! - [`network`] — [`network::NetworkNode`] (one per wire-format
//!   version) and [`network::Network`], the multi-version façade.
//! - [`wire`] — JSON/binary wire message shapes.
//! - [`discovery`] / [`frame`] — the two consumed external interfaces.
//! - [`error`] — the crate's error type.

pub mod discovery;
pub mod error;
pub mod format;
pub mod formatter;
pub mod frame;
pub mod network;
pub mod sensor;
pub mod wire;

pub use discovery::{DiscoveryEvent, DiscoveryEventKind, DiscoveryPeer};
pub use error::{Error, Result};
pub use format::{group_name_from_format, WireFormatVersion};
pub use formatter::{AnnotateValue, EventValue, GazeValue, ImuValue, VideoValue};
pub use frame::{FrameFactory, H264Frame, JpegFrame, VideoHeader};
pub use network::{Network, NetworkEvent, NetworkEventKind, NetworkNode};
pub use sensor::{Control, ControlDType, FetchedValues, Sensor, SensorDescriptor, SensorType};
pub use wire::{Command, DataMessage, GossipPayload, Notification};
