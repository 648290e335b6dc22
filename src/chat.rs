//! Append-only chat log with integer cursors.
//!
//! Ids come from a process-wide counter and are never reused, even after the
//! oldest entries are trimmed. Pollers pass the last id they saw as `since`
//! and get every later message exactly once, in append order.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{Config, MAX_PAGE, MAX_USERNAME_CHARS};
use crate::error::{RelayError, RelayResult};
use crate::logging::{log, obj, ts_now, v_str, Domain, Level};

pub const DEFAULT_CHANNEL: &str = "global";
pub const DEFAULT_USERNAME: &str = "Guest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: u64,
    pub external_id: String,
    pub world_id: String,
    pub channel: String,
    pub username: String,
    pub text: String,
    pub timestamp: String,
}

/// Message as served by the snapshot endpoint, without the cursor id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry<'a> {
    pub external_id: &'a str,
    pub world_id: &'a str,
    pub channel: &'a str,
    pub username: &'a str,
    pub text: &'a str,
    pub timestamp: &'a str,
}

impl<'a> From<&'a Message> for SnapshotEntry<'a> {
    fn from(m: &'a Message) -> Self {
        Self {
            external_id: &m.external_id,
            world_id: &m.world_id,
            channel: &m.channel,
            username: &m.username,
            text: &m.text,
            timestamp: &m.timestamp,
        }
    }
}

/// A message that passed validation and has no id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub world_id: String,
    pub channel: String,
    pub username: String,
    pub text: String,
}

#[derive(Debug, Default)]
struct LogState {
    messages: VecDeque<Message>,
    last_id: u64,
}

#[derive(Debug)]
pub struct MessageLog {
    allowed_worlds: Vec<String>,
    max_message_len: usize,
    max_messages: usize,
    state: RwLock<LogState>,
}

/// Clamp a requested page size into `1..=MAX_PAGE`.
pub fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_PAGE)
}

impl MessageLog {
    pub fn new(cfg: &Config) -> Self {
        Self {
            allowed_worlds: cfg.allowed_worlds.clone(),
            max_message_len: cfg.max_message_len,
            max_messages: cfg.max_messages.max(1),
            state: RwLock::new(LogState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LogState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, LogState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn world_allowed(&self, world_id: &str) -> bool {
        self.allowed_worlds.is_empty() || self.allowed_worlds.iter().any(|w| w == world_id)
    }

    fn matches(&self, m: &Message, world: Option<&str>, channel: Option<&str>) -> bool {
        world.map_or(true, |w| m.world_id == w)
            && channel.map_or(true, |c| m.channel == c)
            && self.world_allowed(&m.world_id)
    }

    /// Validate a message without touching the log.
    pub fn prepare(
        &self,
        world_id: &str,
        channel: &str,
        username: &str,
        text: &str,
    ) -> RelayResult<Draft> {
        let world_id = world_id.trim();
        if world_id.is_empty() {
            return Err(RelayError::WorldIdRequired);
        }
        if !self.world_allowed(world_id) {
            return Err(RelayError::WorldIdForbidden);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(RelayError::Empty);
        }
        if text.chars().count() > self.max_message_len {
            return Err(RelayError::TooLong { max: self.max_message_len });
        }
        let channel = match channel.trim() {
            "" => DEFAULT_CHANNEL,
            c => c,
        };
        let username: String = match username.trim() {
            "" => DEFAULT_USERNAME.to_string(),
            u => u.chars().take(MAX_USERNAME_CHARS).collect(),
        };
        Ok(Draft {
            world_id: world_id.to_string(),
            channel: channel.to_string(),
            username,
            text: text.to_string(),
        })
    }

    /// Assign the next id to a validated draft and append it, trimming the
    /// oldest entries past capacity.
    pub fn commit(&self, draft: Draft) -> Message {
        let mut state = self.write();
        state.last_id += 1;
        let message = Message {
            id: state.last_id,
            external_id: hex::encode(rand::random::<[u8; 8]>()),
            world_id: draft.world_id,
            channel: draft.channel,
            username: draft.username,
            text: draft.text,
            // stamped under the write lock so timestamp order follows id order
            timestamp: ts_now(),
        };
        state.messages.push_back(message.clone());

        let mut trimmed = 0usize;
        while state.messages.len() > self.max_messages {
            state.messages.pop_front();
            trimmed += 1;
        }
        drop(state);

        if trimmed > 0 {
            log(
                Level::Debug,
                Domain::Chat,
                "trimmed",
                obj(&[("count", serde_json::json!(trimmed))]),
            );
        }
        log(
            Level::Debug,
            Domain::Chat,
            "appended",
            obj(&[
                ("world_id", v_str(&message.world_id)),
                ("id", serde_json::json!(message.id)),
                ("external_id", v_str(&message.external_id)),
            ]),
        );
        message
    }

    /// Validate and append one message.
    pub fn append(
        &self,
        world_id: &str,
        channel: &str,
        username: &str,
        text: &str,
    ) -> RelayResult<Message> {
        let draft = self.prepare(world_id, channel, username, text)?;
        Ok(self.commit(draft))
    }

    /// Messages with `id > since`, ascending, at most `limit`.
    /// Returns the cursor to pass as the next `since`.
    pub fn query(
        &self,
        world: Option<&str>,
        channel: Option<&str>,
        since: u64,
        limit: usize,
    ) -> (u64, Vec<Message>) {
        let limit = clamp_limit(limit);
        let state = self.read();
        // ids ascend with position, so skip everything at or before `since`
        let start = state.messages.partition_point(|m| m.id <= since);
        let page: Vec<Message> = state
            .messages
            .range(start..)
            .filter(|m| self.matches(m, world, channel))
            .take(limit)
            .cloned()
            .collect();
        let cursor = page.last().map(|m| m.id).unwrap_or(since);
        (cursor, page)
    }

    /// The newest `limit` matching messages, oldest first.
    pub fn snapshot(
        &self,
        world: Option<&str>,
        channel: Option<&str>,
        limit: usize,
    ) -> Vec<Message> {
        let limit = clamp_limit(limit);
        let state = self.read();
        let mut tail: Vec<Message> = state
            .messages
            .iter()
            .rev()
            .filter(|m| self.matches(m, world, channel))
            .take(limit)
            .cloned()
            .collect();
        tail.reverse();
        tail
    }

    pub fn len(&self) -> usize {
        self.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_id(&self) -> u64 {
        self.read().last_id
    }
}
