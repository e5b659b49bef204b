//! Backend channel cache.
//!
//! One [`GrpcChannel`] per backend address, created on first use and shared
//! by every flow that resolves to that address. Channels live for the
//! process lifetime; route reloads only change which addresses are looked up.

use dashmap::DashMap;
use serde::Serialize;

use crate::grpc::upstream::{ChannelSettings, GrpcChannel};

/// Snapshot of one cached channel for the admin API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChannelSummary {
    pub address: String,
    pub connected: bool,
}

pub struct StubMap {
    channels: DashMap<String, GrpcChannel>,
    settings: ChannelSettings,
}

impl StubMap {
    pub fn new(settings: ChannelSettings) -> Self {
        Self {
            channels: DashMap::new(),
            settings,
        }
    }

    /// Channel for `address`, creating it if this is the first call there.
    pub fn get_stub(&self, address: &str) -> GrpcChannel {
        if let Some(channel) = self.channels.get(address) {
            return channel.value().clone();
        }
        self.channels
            .entry(address.to_string())
            .or_insert_with(|| {
                tracing::debug!(backend = %address, "creating backend channel");
                GrpcChannel::new(address, self.settings.clone())
            })
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Cached channels sorted by address.
    pub fn snapshot(&self) -> Vec<ChannelSummary> {
        let mut channels: Vec<ChannelSummary> = self
            .channels
            .iter()
            .map(|entry| ChannelSummary {
                address: entry.key().clone(),
                connected: entry.value().is_connected(),
            })
            .collect();
        channels.sort_by(|a, b| a.address.cmp(&b.address));
        channels
    }
}
