//! Optional chat-history write-through.
//!
//! The room hub records each text message through [`ChatHistory`] when one
//! is configured. Recording failures are logged by the caller and never
//! stop delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::error::SyncError;
use crate::protocol::ChatMessage;

/// Persistence side effect for chat messages.
pub trait ChatHistory: Send + Sync {
    fn record(&self, message: &ChatMessage) -> Result<(), SyncError>;

    /// Most recent messages for a room, oldest first.
    fn recent(&self, room_id: &str, limit: usize) -> Vec<ChatMessage>;
}

/// Bounded per-room history kept in memory.
///
/// Once a room holds `per_room` messages the oldest is evicted.
pub struct InMemoryHistory {
    rooms: Mutex<HashMap<String, VecDeque<ChatMessage>>>,
    per_room: usize,
}

impl InMemoryHistory {
    pub fn new(per_room: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            per_room: per_room.max(1),
        }
    }

    /// Number of messages stored for a room.
    pub fn len(&self, room_id: &str) -> usize {
        let rooms = self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rooms.get(room_id).map_or(0, VecDeque::len)
    }
}

impl Default for InMemoryHistory {
    fn default() -> Self {
        Self::new(200)
    }
}

impl ChatHistory for InMemoryHistory {
    fn record(&self, message: &ChatMessage) -> Result<(), SyncError> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let room = rooms
            .entry(message.room_id.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.per_room.min(1024)));
        if room.len() >= self.per_room {
            room.pop_front();
        }
        room.push_back(message.clone());
        Ok(())
    }

    fn recent(&self, room_id: &str, limit: usize) -> Vec<ChatMessage> {
        let rooms = self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match rooms.get(room_id) {
            Some(room) => {
                let skip = room.len().saturating_sub(limit);
                room.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }
}
