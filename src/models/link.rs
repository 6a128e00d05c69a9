//! # Entity Link Model
//!
//! Per (entity, connection) synchronization state: the external identifier,
//! the last pulled snapshot, the fields invalidated by local writes and the
//! last error. Exactly one link exists per pair; repositories create it
//! lazily through `find_or_create`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::{ConnectionId, EntityId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    #[default]
    Pending,
    Synced,
    Error,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LinkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid link status: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLink {
    pub entity_id: EntityId,
    pub connection_id: ConnectionId,
    pub external_id: Option<String>,
    pub status: LinkStatus,
    pub external_snapshot: Map<String, Value>,
    pub pending_fields: Vec<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_push_at: Option<DateTime<Utc>>,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityLink {
    pub fn new(entity_id: EntityId, connection_id: ConnectionId, now: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            connection_id,
            external_id: None,
            status: LinkStatus::Pending,
            external_snapshot: Map::new(),
            pending_fields: Vec::new(),
            last_sync_at: None,
            last_push_at: None,
            last_pull_at: None,
            last_error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn needs_sync(&self) -> bool {
        matches!(self.status, LinkStatus::Pending | LinkStatus::Error)
    }

    /// Record a successful push of `pushed`, taken from the entity's `current` fields.
    ///
    /// Fields that were sent leave the pending list. Any other field whose
    /// current value differs from the cached snapshot becomes pending. The
    /// link is `synced`, and `last_sync_at` advances, only when nothing is
    /// left pending.
    pub fn mark_pushed(
        &mut self,
        external_id: Option<String>,
        pushed: &Map<String, Value>,
        current: &Map<String, Value>,
        now: DateTime<Utc>,
    ) {
        if external_id.is_some() {
            self.external_id = external_id;
        }
        for (name, value) in pushed {
            self.external_snapshot.insert(name.clone(), value.clone());
        }
        self.pending_fields
            .retain(|field| !pushed.contains_key(field) && current.contains_key(field));

        let unsent: Vec<String> = current
            .iter()
            .filter(|(name, value)| {
                !pushed.contains_key(*name) && self.external_snapshot.get(*name) != Some(*value)
            })
            .map(|(name, _)| name.clone())
            .collect();
        self.last_push_at = Some(now);
        self.last_error = None;
        self.retry_count = 0;

        if unsent.is_empty() && self.pending_fields.is_empty() {
            self.status = LinkStatus::Synced;
            self.mark_clean(now);
        } else {
            self.status = LinkStatus::Pending;
            self.mark_pending(&unsent, now);
        }
    }

    /// Record a successful pull and replace the cached snapshot
    pub fn mark_pulled(
        &mut self,
        external_id: Option<String>,
        data: Map<String, Value>,
        now: DateTime<Utc>,
    ) {
        if external_id.is_some() {
            self.external_id = external_id;
        }
        self.external_snapshot = data;
        self.status = LinkStatus::Synced;
        self.last_pull_at = Some(now);
        self.mark_clean(now);
    }

    pub fn mark_error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = LinkStatus::Error;
        self.last_error = Some(message.into());
        self.retry_count += 1;
        self.updated_at = now;
    }

    /// A local write invalidated `fields`; they are merged without duplicates
    pub fn mark_pending(&mut self, fields: &[String], now: DateTime<Utc>) {
        for field in fields {
            if !self.pending_fields.contains(field) {
                self.pending_fields.push(field.clone());
            }
        }
        if self.status == LinkStatus::Synced {
            self.status = LinkStatus::Pending;
        }
        self.updated_at = now;
    }

    fn mark_clean(&mut self, now: DateTime<Utc>) {
        self.last_error = None;
        self.retry_count = 0;
        self.last_sync_at = Some(now);
        self.updated_at = now;
    }
}
