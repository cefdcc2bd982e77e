//! Bookkeeping for comm channels open between the session and the kernel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommChannel {
    pub comm_id: String,
    pub target_name: String,
    pub open: bool,
}

#[derive(Debug, Default)]
pub struct CommRegistry {
    channels: HashMap<String, CommChannel>,
    /// comm_id → msg_id of a `comm_open` still waiting for its idle.
    opening: HashMap<String, String>,
}

impl CommRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frontend-initiated open that hasn't been acknowledged yet.
    pub fn begin_open(&mut self, comm_id: &str, target_name: &str, open_msg_id: &str) {
        self.channels.insert(
            comm_id.to_string(),
            CommChannel {
                comm_id: comm_id.to_string(),
                target_name: target_name.to_string(),
                open: false,
            },
        );
        self.opening
            .insert(comm_id.to_string(), open_msg_id.to_string());
    }

    pub fn confirm_open(&mut self, comm_id: &str) {
        self.opening.remove(comm_id);
        if let Some(channel) = self.channels.get_mut(comm_id) {
            channel.open = true;
        }
    }

    /// A comm opened by the kernel.
    pub fn insert_open(&mut self, comm_id: &str, target_name: &str) {
        self.channels.insert(
            comm_id.to_string(),
            CommChannel {
                comm_id: comm_id.to_string(),
                target_name: target_name.to_string(),
                open: true,
            },
        );
    }

    /// Forget `comm_id`. Returns the channel and, if it was still opening,
    /// the `comm_open` msg_id that is waiting.
    pub fn close(&mut self, comm_id: &str) -> Option<(CommChannel, Option<String>)> {
        let opening = self.opening.remove(comm_id);
        self.channels.remove(comm_id).map(|mut channel| {
            channel.open = false;
            (channel, opening)
        })
    }

    pub fn get(&self, comm_id: &str) -> Option<&CommChannel> {
        self.channels.get(comm_id)
    }

    pub fn is_open(&self, comm_id: &str) -> bool {
        self.channels.get(comm_id).is_some_and(|c| c.open)
    }

    /// Open channels, optionally restricted to one target, sorted by id.
    pub fn list(&self, target_name: Option<&str>) -> Vec<CommChannel> {
        let mut channels: Vec<CommChannel> = self
            .channels
            .values()
            .filter(|c| c.open)
            .filter(|c| target_name.map_or(true, |t| c.target_name == t))
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.comm_id.cmp(&b.comm_id));
        channels
    }

    /// Drop everything, returning the ids that were still opening.
    pub fn clear(&mut self) -> Vec<String> {
        self.channels.clear();
        self.opening.drain().map(|(_, msg_id)| msg_id).collect()
    }
}
