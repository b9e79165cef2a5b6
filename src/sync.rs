//! Typed CRUD over records with optimistic concurrency.
//!
//! ## Conflict protocol
//!
//! A save that loses the change-tag race is re-issued exactly once as a
//! forced overwrite carrying the server's current tag from the conflict
//! response; any further failure surfaces to the caller. No field-level
//! merge happens: last writer wins on the forced retry. Deletes are a
//! single attempt; a delete conflict surfaces immediately.
//!
//! ## Cache mirroring
//!
//! Every successful query and save is mirrored into the fallback cache.
//! The cache is read only when the network call itself fails, and then
//! expired entries are accepted too.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::{FallbackCache, DEFAULT_TTL};
use crate::error::StoreError;
use crate::records::{Database, Filter, Record, Sort, ZoneRef};
use crate::transport::TransportClient;

/// Typed record operations on top of the transport.
pub struct RecordSyncClient {
    transport: Arc<TransportClient>,
    cache: Arc<FallbackCache>,
    cache_ttl: Duration,
}

impl RecordSyncClient {
    pub fn new(transport: Arc<TransportClient>, cache: Arc<FallbackCache>) -> Self {
        Self { transport, cache, cache_ttl: DEFAULT_TTL }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn transport(&self) -> &Arc<TransportClient> {
        &self.transport
    }

    /// Query records of one type in one zone. Returns a single page: the
    /// store's continuation support is deliberately unused here.
    pub async fn query(
        &self,
        database: Database,
        zone: &ZoneRef,
        record_type: &str,
        filters: &[Filter],
        sort: &[Sort],
    ) -> Result<Vec<Record>, StoreError> {
        let mut query = json!({ "recordType": record_type });
        if !filters.is_empty() {
            query["filterBy"] = Value::Array(filters.iter().map(Filter::to_wire).collect());
        }
        if !sort.is_empty() {
            query["sortBy"] = Value::Array(sort.iter().map(Sort::to_wire).collect());
        }

        let mut body = json!({ "query": query });
        if database != Database::Public {
            body["zoneID"] = zone.to_wire();
        }

        let key = query_cache_key(database, zone, record_type, filters, sort);
        match self.transport.send(database, "records/query", body).await {
            Ok(data) => {
                let records = parse_record_entries(&data, zone);
                if let Ok(serialized) = serde_json::to_string(&records) {
                    self.cache.put(&key, serialized, self.cache_ttl);
                }
                Ok(records)
            }
            Err(StoreError::SessionExpired) => Err(StoreError::SessionExpired),
            Err(e) => self.serve_from_cache(&key, e),
        }
    }

    /// Fetch one record by name. Absence is `Ok(None)`, never an error.
    pub async fn lookup(
        &self,
        database: Database,
        zone: &ZoneRef,
        record_name: &str,
    ) -> Result<Option<Record>, StoreError> {
        let mut body = json!({ "records": [{ "recordName": record_name }] });
        if database != Database::Public {
            body["zoneID"] = zone.to_wire();
        }

        let data = self.transport.send(database, "records/lookup", body).await?;
        let Some(entry) = data.get("records").and_then(Value::as_array).and_then(|r| r.first())
        else {
            return Ok(None);
        };

        match Record::from_wire(entry, zone) {
            Ok(record) => Ok(Some(record)),
            // Lookup misses come back as per-record rejections
            Err(StoreError::Rejected { code }) => {
                debug!(record_name, code, "lookup miss");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Create or update a record, resolving a change-tag conflict with one
    /// forced overwrite.
    pub async fn save(&self, database: Database, record: &Record) -> Result<Record, StoreError> {
        let operation = if record.change_tag.is_some() { "update" } else { "create" };

        match self
            .modify(database, record, operation, record.change_tag.clone())
            .await
        {
            Ok(saved) => {
                self.mirror_record(database, &saved);
                Ok(saved)
            }
            Err(StoreError::Conflict { server_tag }) => {
                warn!(
                    record = %record.record_name,
                    "change-tag conflict on save, retrying once with forced overwrite"
                );
                let tag = server_tag.or_else(|| record.change_tag.clone());
                let saved = self.modify(database, record, "forceUpdate", tag).await?;
                self.mirror_record(database, &saved);
                Ok(saved)
            }
            Err(e) => Err(e),
        }
    }

    /// Write a record unconditionally, ignoring the change-tag race. Single
    /// attempt. Used by the claim protocol, which owns the one code path
    /// allowed to overwrite an unowned record.
    pub async fn force_save(
        &self,
        database: Database,
        record: &Record,
    ) -> Result<Record, StoreError> {
        let saved = self
            .modify(database, record, "forceUpdate", record.change_tag.clone())
            .await?;
        self.mirror_record(database, &saved);
        Ok(saved)
    }

    /// Delete by name. Single attempt: a conflict here surfaces to the
    /// caller untouched.
    pub async fn delete(
        &self,
        database: Database,
        zone: &ZoneRef,
        record_name: &str,
        change_tag: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut record = json!({ "recordName": record_name });
        if let Some(tag) = change_tag {
            record["recordChangeTag"] = json!(tag);
        }
        let body = json!({
            "zoneID": zone.to_wire(),
            "operations": [{ "operationType": "delete", "record": record }]
        });

        let data = self.transport.send(database, "records/modify", body).await?;
        if let Some(entry) = data.get("records").and_then(Value::as_array).and_then(|r| r.first())
        {
            if entry.get("serverErrorCode").is_some() {
                // Reuse the entry parser for its conflict/rejection mapping
                Record::from_wire(entry, zone)?;
            }
        }
        Ok(())
    }

    async fn modify(
        &self,
        database: Database,
        record: &Record,
        operation: &str,
        change_tag: Option<String>,
    ) -> Result<Record, StoreError> {
        let mut wire_record = json!({
            "recordType": record.record_type,
            "recordName": record.record_name,
            "fields": record.fields_to_wire(),
        });
        if let Some(tag) = change_tag {
            wire_record["recordChangeTag"] = json!(tag);
        }

        let body = json!({
            "zoneID": record.zone.to_wire(),
            "operations": [{ "operationType": operation, "record": wire_record }]
        });

        let data = self.transport.send(database, "records/modify", body).await?;
        let entry = data
            .get("records")
            .and_then(Value::as_array)
            .and_then(|r| r.first())
            .ok_or_else(|| StoreError::Decode("modify response without records".to_string()))?;

        Record::from_wire(entry, &record.zone)
    }

    fn mirror_record(&self, database: Database, record: &Record) {
        if let Ok(serialized) = serde_json::to_string(record) {
            let key = record_cache_key(database, &record.zone, &record.record_name);
            self.cache.put(&key, serialized, self.cache_ttl);
        }
    }

    fn serve_from_cache(&self, key: &str, err: StoreError) -> Result<Vec<Record>, StoreError> {
        match self.cache.get(key, true) {
            Some(cached) => match serde_json::from_str(&cached) {
                Ok(records) => {
                    warn!("query failed, serving cached results: {}", err);
                    Ok(records)
                }
                Err(_) => Err(err),
            },
            None => Err(err),
        }
    }
}

fn query_cache_key(
    database: Database,
    zone: &ZoneRef,
    record_type: &str,
    filters: &[Filter],
    sort: &[Sort],
) -> String {
    // Filters and sort both shape the result set, so both go into the key
    let mut hasher = Sha256::new();
    for filter in filters {
        hasher.update(filter.to_wire().to_string());
    }
    for descriptor in sort {
        hasher.update(descriptor.to_wire().to_string());
    }
    let digest = hex::encode(&hasher.finalize()[..8]);
    format!("query:{}:{}:{}:{}", database, zone, record_type, digest)
}

fn record_cache_key(database: Database, zone: &ZoneRef, record_name: &str) -> String {
    format!("record:{}:{}:{}", database, zone, record_name)
}

/// Collect parseable record entries, skipping per-record rejections the
/// way query responses interleave them.
pub(crate) fn parse_record_entries(data: &Value, zone: &ZoneRef) -> Vec<Record> {
    data.get("records")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| Record::from_wire(entry, zone).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::http::testing::ScriptedExec;
    use crate::records::FieldValue;
    use crate::session::{Identity, IdentityConfirmer, SessionStore, Token};
    use crate::storage::MemoryStore;

    async fn stack(exec: Arc<ScriptedExec>) -> RecordSyncClient {
        let session = SessionStore::new(Arc::new(MemoryStore::new()));
        session.initialize(Some(Token("tok-1".to_string())));
        let transport = TransportClient::with_exec(StoreConfig::default(), session.clone(), exec);
        // Pre-resolve so sends never schedule background confirmations
        mark_signed_in(&session).await;
        RecordSyncClient::new(transport, Arc::new(FallbackCache::new()))
    }

    async fn mark_signed_in(session: &SessionStore) {
        struct Fixed;
        #[async_trait::async_trait]
        impl crate::session::IdentityConfirmer for Fixed {
            async fn confirm_identity(
                &self,
                _credential: &Token,
            ) -> Result<Option<Identity>, StoreError> {
                Ok(Some(Identity("user-1".to_string())))
            }
        }
        let fixed = Arc::new(Fixed);
        session.attach_confirmer(Arc::downgrade(&(fixed.clone() as Arc<dyn IdentityConfirmer>)));
        session.resolve_identity_now().await;
        assert!(session.is_signed_in());
    }

    fn crew_record(tag: Option<&str>) -> Record {
        let mut record = Record::new("CrewMember", "crew-1", ZoneRef::private("TourCalZone"));
        record.change_tag = tag.map(str::to_string);
        record.set_field("name", FieldValue::Text("Sam".to_string()));
        record
    }

    fn saved_entry(tag: &str) -> Value {
        json!({
            "records": [{
                "recordName": "crew-1",
                "recordType": "CrewMember",
                "recordChangeTag": tag,
                "fields": { "name": { "value": "Sam" } }
            }]
        })
    }

    fn conflict_entry(server_tag: &str) -> Value {
        json!({
            "records": [{
                "recordName": "crew-1",
                "serverErrorCode": "CONFLICT",
                "serverRecord": { "recordChangeTag": server_tag }
            }]
        })
    }

    #[tokio::test]
    async fn stale_tag_save_retries_exactly_once_with_server_tag() {
        let exec = Arc::new(ScriptedExec::new());
        exec.push_json(200, conflict_entry("tag-server"));
        exec.push_json(200, saved_entry("tag-new"));
        let sync = stack(exec.clone()).await;

        let saved = sync
            .save(Database::Private, &crew_record(Some("tag-stale")))
            .await
            .unwrap();

        assert_eq!(saved.change_tag.as_deref(), Some("tag-new"));
        let requests = exec.requests();
        assert_eq!(requests.len(), 2);

        let first_op = &requests[0].1["operations"][0];
        assert_eq!(first_op["operationType"], "update");
        assert_eq!(first_op["record"]["recordChangeTag"], "tag-stale");

        let second_op = &requests[1].1["operations"][0];
        assert_eq!(second_op["operationType"], "forceUpdate");
        assert_eq!(second_op["record"]["recordChangeTag"], "tag-server");
    }

    #[tokio::test]
    async fn conflict_on_forced_retry_is_fatal() {
        let exec = Arc::new(ScriptedExec::new());
        exec.push_json(200, conflict_entry("tag-a"));
        exec.push_json(200, conflict_entry("tag-b"));
        let sync = stack(exec.clone()).await;

        let err = sync
            .save(Database::Private, &crew_record(Some("tag-stale")))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Conflict { .. }));
        // Never a third attempt
        assert_eq!(exec.request_count(), 2);
    }

    #[tokio::test]
    async fn save_without_tag_is_a_create() {
        let exec = Arc::new(ScriptedExec::new());
        exec.push_json(200, saved_entry("tag-1"));
        let sync = stack(exec.clone()).await;

        sync.save(Database::Private, &crew_record(None)).await.unwrap();

        let op = &exec.requests()[0].1["operations"][0];
        assert_eq!(op["operationType"], "create");
        assert!(op["record"].get("recordChangeTag").is_none());
    }

    #[tokio::test]
    async fn lookup_miss_is_none() {
        let exec = Arc::new(ScriptedExec::new());
        exec.push_json(
            200,
            json!({ "records": [{ "recordName": "ghost", "serverErrorCode": "NOT_FOUND" }] }),
        );
        let sync = stack(exec).await;

        let found = sync
            .lookup(Database::Private, &ZoneRef::private("TourCalZone"), "ghost")
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn delete_conflict_surfaces_without_retry() {
        let exec = Arc::new(ScriptedExec::new());
        exec.push_json(200, conflict_entry("tag-x"));
        let sync = stack(exec.clone()).await;

        let err = sync
            .delete(
                Database::Private,
                &ZoneRef::private("TourCalZone"),
                "crew-1",
                Some("tag-stale"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(exec.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_query_falls_back_to_cached_results() {
        let exec = Arc::new(ScriptedExec::new());
        let zone = ZoneRef::private("TourCalZone");
        exec.push_json(
            200,
            json!({ "records": [{
                "recordName": "crew-1",
                "recordType": "CrewMember",
                "recordChangeTag": "tag-1",
                "fields": { "name": { "value": "Sam" } }
            }] }),
        );
        // Second query keeps hitting the misroute until exhaustion
        for _ in 0..5 {
            exec.push(421, "");
        }
        let sync = stack(exec.clone()).await;

        let fresh = sync
            .query(Database::Private, &zone, "CrewMember", &[], &[])
            .await
            .unwrap();
        assert_eq!(fresh.len(), 1);

        let fallback = sync
            .query(Database::Private, &zone, "CrewMember", &[], &[])
            .await
            .unwrap();
        assert_eq!(fallback, fresh);
    }

    #[tokio::test]
    async fn cache_fallback_is_sort_specific() {
        let exec = Arc::new(ScriptedExec::new());
        let zone = ZoneRef::private("TourCalZone");
        exec.push_json(
            200,
            json!({ "records": [{
                "recordName": "crew-1",
                "recordType": "CrewMember",
                "recordChangeTag": "tag-1",
                "fields": { "name": { "value": "Sam" } }
            }] }),
        );
        exec.push(500, "boom");
        let sync = stack(exec).await;

        sync.query(
            Database::Private,
            &zone,
            "CrewMember",
            &[],
            &[Sort::asc("name")],
        )
        .await
        .unwrap();

        // Same type/zone/filters but a different ordering must not be
        // served from the ascending query's cache entry
        let err = sync
            .query(
                Database::Private,
                &zone,
                "CrewMember",
                &[],
                &[Sort::desc("name")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Http { status: 500, .. }));
    }

    #[tokio::test]
    async fn failed_query_without_cache_propagates() {
        let exec = Arc::new(ScriptedExec::new());
        exec.push(500, "boom");
        let sync = stack(exec).await;

        let err = sync
            .query(
                Database::Private,
                &ZoneRef::private("TourCalZone"),
                "CrewMember",
                &[],
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Http { status: 500, .. }));
    }
}
