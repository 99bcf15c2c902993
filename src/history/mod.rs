//! Bounded log of the most recent connection events of each user.
//!
//! Every user keeps at most [`MAX_ENTRIES`] entries, one per IP address.
//! Seeing an IP again only refreshes its recency; a new IP beyond the cap
//! evicts the least recent entries. [`HistoryService`] is the only writer.
mod error;
mod postgres;
mod service;
mod store;

pub use error::*;
pub use postgres::PgHistoryStore;
pub use service::HistoryService;
pub use store::{HistoryStore, HistoryTransaction};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Maximum number of entries retained per user.
///
/// Also enforced by the `history_cap` constraint trigger.
pub const MAX_ENTRIES: usize = 10;
/// Number of entries listed when no usable limit is given.
pub const DEFAULT_LIMIT: i64 = 10;

/// Connection event as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: i64,
    pub user_id: Uuid,
    pub ip: String,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    /// Coordinates, as reported by the geolocation provider.
    pub loc: Option<String>,
    pub hostname: Option<String>,
    pub org: Option<String>,
    pub postal: Option<String>,
    pub timezone: Option<String>,
    /// Recency timestamp. Refreshed each time the IP is seen again.
    pub created_at: DateTime<Utc>,
}

/// Incoming connection event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct NewEntry {
    #[validate(length(
        min = 1,
        max = 45,
        message = "IP address must contain between 1 and 45 characters."
    ))]
    pub ip: String,
    #[validate(length(max = 255))]
    pub city: Option<String>,
    #[validate(length(max = 255))]
    pub region: Option<String>,
    #[validate(length(max = 255))]
    pub country: Option<String>,
    #[validate(length(max = 100))]
    pub loc: Option<String>,
    #[validate(length(max = 255))]
    pub hostname: Option<String>,
    #[validate(length(max = 255))]
    pub org: Option<String>,
    #[validate(length(max = 20))]
    pub postal: Option<String>,
    #[validate(length(max = 50))]
    pub timezone: Option<String>,
}

impl NewEntry {
    /// Create a [`NewEntry`] without geolocation attributes.
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Default::default()
        }
    }

    /// Update `city` field on [`NewEntry`].
    #[cfg(test)]
    pub fn city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    /// Update `country` field on [`NewEntry`].
    #[cfg(test)]
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Build the stored form of this event.
    pub(crate) fn into_entry(
        self,
        id: i64,
        user_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Entry {
        Entry {
            id,
            user_id,
            ip: self.ip,
            city: self.city,
            region: self.region,
            country: self.country,
            loc: self.loc,
            hostname: self.hostname,
            org: self.org,
            postal: self.postal,
            timezone: self.timezone,
            created_at,
        }
    }
}

/// Sort entries most recent first; ties go to the latest inserted.
pub(crate) fn sort_by_recency(entries: &mut [Entry]) {
    entries.sort_by(|a, b| {
        b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id))
    });
}
