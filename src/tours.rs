//! Tour catalog: the user's tours across private and shared zones.
//!
//! Tours the user owns live in their private zone; tours shared with them
//! live in zones owned by someone else, reached through the shared
//! database. The bulk fetch walks both, detects the caller's role on each
//! shared tour from the zone's share record, and mirrors the merged list
//! into the fallback cache. Concurrent fetches are coalesced into one pass.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{FallbackCache, DEFAULT_TTL};
use crate::error::StoreError;
use crate::records::{Database, Record, ZoneRef};
use crate::storage::{keys, KeyValueStore};
use crate::sync::RecordSyncClient;

const TOUR_TYPE: &str = "Tour";
const TOURS_CACHE_KEY: &str = "tours";

pub const ROLE_OWNER: &str = "Owner";
pub const ROLE_ADMIN: &str = "Admin";
pub const ROLE_CREW: &str = "Crew";

/// One tour as the picker shows it. `role` is `Owner` for private tours;
/// for shared tours it comes from the zone's share record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tour {
    pub record_name: String,
    pub name: String,
    pub color_hex: String,
    pub zone: ZoneRef,
    pub shared: bool,
    pub role: String,
}

impl Tour {
    /// Which database holds this tour's records.
    pub fn database(&self) -> Database {
        if self.shared {
            Database::Shared
        } else {
            Database::Private
        }
    }

    fn from_record(record: &Record, shared: bool) -> Self {
        Self {
            record_name: record.record_name.clone(),
            name: record
                .text_field("name")
                .unwrap_or("Untitled Tour")
                .to_string(),
            color_hex: record
                .text_field("colorHex")
                .unwrap_or("#007AFF")
                .to_string(),
            zone: record.zone.clone(),
            shared,
            role: if shared { ROLE_CREW } else { ROLE_OWNER }.to_string(),
        }
    }
}

struct CatalogInner {
    sync: Arc<RecordSyncClient>,
    cache: Arc<FallbackCache>,
    store: Arc<dyn KeyValueStore>,
    zone_name: String,
    tours: RwLock<Vec<Tour>>,
    active: RwLock<Option<Tour>>,
    /// While `Some`, a bulk fetch is in flight and later callers wait on
    /// its result instead of issuing another.
    fetch_in_flight: tokio::sync::RwLock<Option<broadcast::Sender<Vec<Tour>>>>,
}

/// Cheap cloneable handle to the catalog.
#[derive(Clone)]
pub struct TourCatalog {
    inner: Arc<CatalogInner>,
}

impl TourCatalog {
    pub fn new(
        sync: Arc<RecordSyncClient>,
        cache: Arc<FallbackCache>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let zone_name = sync.transport().config().zone_name.clone();
        Self {
            inner: Arc::new(CatalogInner {
                sync,
                cache,
                store,
                zone_name,
                tours: RwLock::new(Vec::new()),
                active: RwLock::new(None),
                fetch_in_flight: tokio::sync::RwLock::new(None),
            }),
        }
    }

    pub fn tours(&self) -> Vec<Tour> {
        self.inner
            .tours
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn active_tour(&self) -> Option<Tour> {
        self.inner
            .active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Pick the active tour and persist the choice across restarts.
    pub fn set_active_tour(&self, tour: &Tour) {
        self.inner.store.set(keys::ACTIVE_TOUR, &tour.record_name);
        let mut active = self.inner.active.write().unwrap_or_else(|e| e.into_inner());
        *active = Some(tour.clone());
    }

    /// Fetch all tours the caller can see. Partial failures are tolerated:
    /// a zone that cannot be read is skipped, not fatal for the pass.
    /// Concurrent callers share one in-flight pass.
    pub async fn fetch_tours(&self) -> Vec<Tour> {
        enum Role {
            Leader(broadcast::Sender<Vec<Tour>>),
            Follower(broadcast::Receiver<Vec<Tour>>),
        }

        let role = {
            let mut slot = self.inner.fetch_in_flight.write().await;
            match slot.as_ref() {
                Some(tx) => Role::Follower(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    *slot = Some(tx.clone());
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => rx.recv().await.unwrap_or_default(),
            Role::Leader(tx) => {
                let tours = self.fetch_all().await;
                self.adopt(&tours, true);
                let mut slot = self.inner.fetch_in_flight.write().await;
                *slot = None;
                drop(slot);
                let _ = tx.send(tours.clone());
                tours
            }
        }
    }

    /// Populate the catalog from the fallback cache without touching the
    /// network. Expired entries are accepted.
    pub fn load_cached_tours(&self) -> Vec<Tour> {
        let Some(cached) = self.inner.cache.get(TOURS_CACHE_KEY, true) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<Tour>>(&cached) {
            Ok(tours) => {
                self.adopt(&tours, false);
                tours
            }
            Err(e) => {
                warn!("discarding unreadable cached tour list: {}", e);
                Vec::new()
            }
        }
    }

    fn adopt(&self, tours: &[Tour], mirror: bool) {
        if mirror {
            if let Ok(serialized) = serde_json::to_string(tours) {
                self.inner.cache.put(TOURS_CACHE_KEY, serialized, DEFAULT_TTL);
            }
        }
        {
            let mut slot = self.inner.tours.write().unwrap_or_else(|e| e.into_inner());
            *slot = tours.to_vec();
        }
        // Restore the persisted active-tour choice if it is still visible
        if let Some(saved) = self.inner.store.get(keys::ACTIVE_TOUR) {
            if let Some(found) = tours.iter().find(|t| t.record_name == saved) {
                let mut active = self.inner.active.write().unwrap_or_else(|e| e.into_inner());
                *active = Some(found.clone());
            }
        }
    }

    async fn fetch_all(&self) -> Vec<Tour> {
        let mut tours = Vec::new();

        match self.fetch_private_tours().await {
            Ok(mut private) => tours.append(&mut private),
            Err(e) => warn!("failed to fetch private tours: {}", e),
        }
        match self.fetch_shared_tours().await {
            Ok(mut shared) => tours.append(&mut shared),
            Err(e) => warn!("failed to fetch shared tours: {}", e),
        }

        tours.sort_by(|a, b| a.name.cmp(&b.name));
        tours
    }

    async fn fetch_private_tours(&self) -> Result<Vec<Tour>, StoreError> {
        let zone = ZoneRef::private(&self.inner.zone_name);
        let records = self
            .inner
            .sync
            .query(Database::Private, &zone, TOUR_TYPE, &[], &[])
            .await?;
        Ok(records
            .iter()
            .map(|r| Tour::from_record(r, false))
            .collect())
    }

    async fn fetch_shared_tours(&self) -> Result<Vec<Tour>, StoreError> {
        let zones = self.list_shared_zones().await?;
        let mut tours = Vec::new();

        for zone in zones {
            let records = match self
                .inner
                .sync
                .query(Database::Shared, &zone, TOUR_TYPE, &[], &[])
                .await
            {
                Ok(records) => records,
                Err(e) => {
                    warn!(zone = %zone, "skipping unreadable shared zone: {}", e);
                    continue;
                }
            };
            if records.is_empty() {
                continue;
            }

            let role = self.detect_role(&zone).await;
            for record in &records {
                let mut tour = Tour::from_record(record, true);
                tour.zone = zone.clone();
                tour.role = role.clone();
                tours.push(tour);
            }
        }

        Ok(tours)
    }

    /// All zones other users have shared with the caller.
    pub(crate) async fn list_shared_zones(&self) -> Result<Vec<ZoneRef>, StoreError> {
        let data = self
            .inner
            .sync
            .transport()
            .send(Database::Shared, "zones/list", json!({}))
            .await?;
        Ok(data
            .get("zones")
            .and_then(Value::as_array)
            .map(|zones| {
                zones
                    .iter()
                    .filter_map(|z| z.get("zoneID").and_then(ZoneRef::from_wire))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// The caller's role on a shared zone, read from the zone's share
    /// record. Unreadable share records degrade to the lowest role.
    async fn detect_role(&self, zone: &ZoneRef) -> String {
        let body = json!({
            "zoneID": zone.to_wire(),
            "records": [{ "recordName": format!("cloudkit.share.{}", zone.zone_name) }]
        });
        match self
            .inner
            .sync
            .transport()
            .send(Database::Shared, "records/lookup", body)
            .await
        {
            Ok(data) => data
                .get("records")
                .and_then(Value::as_array)
                .and_then(|r| r.first())
                .map(role_from_share)
                .unwrap_or_else(|| ROLE_CREW.to_string()),
            Err(e) => {
                debug!(zone = %zone, "could not read share record: {}", e);
                ROLE_CREW.to_string()
            }
        }
    }
}

/// Role encoded in a share record: an explicit `tourRole` field wins, then
/// write permission maps to `Admin`, everything else is `Crew`.
fn role_from_share(share: &Value) -> String {
    if share.get("serverErrorCode").is_some() {
        return ROLE_CREW.to_string();
    }
    if let Some(role) = share
        .pointer("/fields/tourRole/value")
        .and_then(Value::as_str)
    {
        return role.to_string();
    }
    let writable = share.get("publicPermission").and_then(Value::as_str) == Some("READ_WRITE")
        || share
            .pointer("/currentUserParticipant/permission")
            .and_then(Value::as_str)
            == Some("READ_WRITE");
    if writable { ROLE_ADMIN } else { ROLE_CREW }.to_string()
}
