use serde::{Deserialize, Serialize};

use crate::{error::NotFoundError, proto::lnrpc};

/// Channel id to counterparty mapping captured from `ListChannels`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub chan_id: u64,
    pub remote_pubkey: String,
}

/// Point-in-time copy of the node's channel list, in the order lnd returned it.
///
/// Never updated in place. A refresh replaces the whole snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelSnapshot {
    entries: Vec<ChannelEntry>,
}

impl ChannelSnapshot {
    #[must_use]
    pub fn from_channels(channels: &[lnrpc::Channel]) -> Self {
        Self {
            entries: channels
                .iter()
                .map(|c| ChannelEntry {
                    chan_id: c.chan_id,
                    remote_pubkey: c.remote_pubkey.clone(),
                })
                .collect(),
        }
    }

    /// Remote node identity of the channel with `chan_id`.
    ///
    /// # Errors
    /// [`NotFoundError`] when the channel was not part of this snapshot.
    pub fn counterparty(&self, chan_id: u64) -> Result<&str, NotFoundError> {
        self.entries
            .iter()
            .find(|e| e.chan_id == chan_id)
            .map(|e| e.remote_pubkey.as_str())
            .ok_or(NotFoundError { chan_id })
    }

    #[must_use]
    pub fn entries(&self) -> &[ChannelEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
