//! Store-and-forward bundle synchronisation engine for low-bandwidth,
//! lossy, broadcast-style transports such as packet radio, Bluetooth name
//! advertisements or Wi-Fi Direct service records.
//!
//! Nodes carry a local set of content-addressed bundles and periodically
//! emit fixed-MTU advertisement frames interleaving announcements ("I have
//! this bundle") with raw pieces of manifest or body. Peers within earshot
//! reconstruct bundles from received pieces, and announcements let a sender
//! skip bytes its neighbours already hold.
//!
//! The [`engine::Engine`] is the entry point: it owns all protocol state
//! and is driven by a host loop that ticks it for outbound frames and
//! feeds it everything heard on the radio. The local daemon, the radio
//! driver and manifest parsing plug in through the [`store::Store`],
//! [`engine::RadioSink`] and [`manifest::ManifestInspector`] traits.

pub mod util;

pub mod bundle;
pub mod frame;
pub mod segment;
pub mod partial;
pub mod peer;
pub mod registry;
pub mod cache;
pub mod manifest;
pub mod store;
pub mod engine;
