//! Hickory DNS authority answering a configured zone from the record store.

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{LowerName, Name, Record, RecordSet, RecordType};
use hickory_server::authority::{
    Authority, LookupControlFlow, LookupError, LookupOptions, LookupRecords, MessageRequest,
    UpdateResult, ZoneType,
};
use hickory_server::server::RequestInfo;
use std::io;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::error::DnsError;
use crate::metrics::{
    self, Branch, Metric, MetricsEmitter, QueryResult, Timer, NB_RECORD_UNSUPPORTED,
};
use crate::record::{try_convert, ConvertError, RecordPayload};
use crate::store::Store;

/// Records found for a query name, before type filtering.
#[derive(Debug)]
enum Resolution {
    /// No key, exact or wildcard, covers the name.
    NxDomain,
    /// A key covers the name.
    Found {
        records: Vec<Record>,
        /// Stored records that could not be converted.
        skipped: usize,
    },
}

/// Store keys that may hold the records of `name`, most specific first.
///
/// After the exact name, each ancestor inside `zone` is tried as a wildcard
/// (`*.<ancestor>`). Both arguments are lowercase and fully qualified.
fn candidate_keys(name: &str, zone: &str) -> Vec<String> {
    let mut keys = vec![name.to_string()];
    if name == zone {
        return keys;
    }

    let mut rest = name;
    while let Some((_, parent)) = rest.split_once('.') {
        if parent.len() < zone.len() || parent.is_empty() {
            break;
        }
        keys.push(format!("*.{parent}"));
        rest = parent;
    }
    keys
}

/// Group records into record sets by owner name and type, keeping first-seen order.
pub(crate) fn record_sets(records: Vec<Record>) -> Vec<Arc<RecordSet>> {
    let mut sets: Vec<RecordSet> = Vec::new();
    for record in records {
        let position = sets
            .iter()
            .position(|s| s.name() == record.name() && s.record_type() == record.record_type());
        let set = match position {
            Some(i) => &mut sets[i],
            None => {
                sets.push(RecordSet::new(
                    record.name().clone(),
                    record.record_type(),
                    0,
                ));
                let last = sets.len() - 1;
                &mut sets[last]
            }
        };
        set.insert(record, 0);
    }
    sets.into_iter().map(Arc::new).collect()
}

/// Keep the records answering `rtype`, falling back to a CNAME at the name.
fn select(records: Vec<Record>, rtype: RecordType) -> Vec<Record> {
    if rtype == RecordType::ANY {
        return records;
    }

    let (matching, rest): (Vec<Record>, Vec<Record>) =
        records.into_iter().partition(|r| r.record_type() == rtype);
    if !matching.is_empty() || rtype == RecordType::CNAME {
        return matching;
    }

    rest.into_iter()
        .filter(|r| r.record_type() == RecordType::CNAME)
        .collect()
}

/// Authority for one zone, backed by the ingested record store.
pub struct StoreAuthority {
    origin: LowerName,
    store: Store,
    metrics: MetricsEmitter,
}

impl StoreAuthority {
    /// Create an authority for `zone`.
    pub fn new(zone: &Name, store: Store, metrics: MetricsEmitter) -> Self {
        Self {
            origin: LowerName::from(zone),
            store,
            metrics,
        }
    }

    /// Resolve `name` on the blocking pool, like every other store access.
    async fn resolve_blocking(&self, name: &LowerName) -> Result<Resolution, DnsError> {
        let store = self.store.clone();
        let origin = self.origin.clone();
        let name = name.clone();
        tokio::task::spawn_blocking(move || resolve(&store, &origin, &name)).await?
    }
}

/// Read a key, accepting it with or without the trailing dot.
fn read(store: &Store, key: &str) -> Result<Option<Vec<u8>>, DnsError> {
    if let Some(value) = store.get(key.as_bytes())? {
        return Ok(Some(value));
    }
    match key.strip_suffix('.') {
        Some(relative) if !relative.is_empty() => store.get(relative.as_bytes()),
        _ => Ok(None),
    }
}

/// Find and convert the stored records covering `name` inside `origin`.
fn resolve(store: &Store, origin: &LowerName, name: &LowerName) -> Result<Resolution, DnsError> {
    let name_str = name.to_string();
    let zone_str = origin.to_string();

    for key in candidate_keys(&name_str, &zone_str) {
        let Some(value) = read(store, &key)? else {
            continue;
        };

        let wildcard = key != name_str;
        trace!(name = %name_str, key = %key, wildcard, "store hit");

        let stored = match RecordPayload::decode(&value) {
            Ok(payload) => payload.into_records(),
            Err(e) => {
                warn!(key = %key, "undecodable record payload: {}", e);
                return Ok(Resolution::Found {
                    records: Vec::new(),
                    skipped: 1,
                });
            }
        };

        let mut records = Vec::with_capacity(stored.len());
        let mut skipped = 0;
        for record in &stored {
            match try_convert(record) {
                Ok(mut rr) => {
                    if wildcard {
                        rr.set_name(Name::from(name.clone()));
                    }
                    records.push(rr);
                }
                Err(ConvertError::Unsupported(tag)) => {
                    debug!(key = %key, record_type = %tag, "skipping unsupported record");
                    skipped += 1;
                }
                Err(e) => {
                    warn!(key = %key, "{}", e);
                    skipped += 1;
                }
            }
        }

        return Ok(Resolution::Found { records, skipped });
    }

    Ok(Resolution::NxDomain)
}

#[async_trait]
impl Authority for StoreAuthority {
    type Lookup = LookupRecords;

    fn zone_type(&self) -> ZoneType {
        ZoneType::Primary
    }

    fn is_axfr_allowed(&self) -> bool {
        false
    }

    fn origin(&self) -> &LowerName {
        &self.origin
    }

    async fn lookup(
        &self,
        name: &LowerName,
        rtype: RecordType,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        let timer = Timer::start();
        let rtype_str = rtype.to_string();

        trace!(name = %name, rtype = ?rtype, "DNS lookup");

        let (result, outcome, skipped) = match self.resolve_blocking(name).await {
            Ok(Resolution::NxDomain) => {
                debug!(name = %name, "no records found");
                (
                    Err(LookupError::ResponseCode(ResponseCode::NXDomain)),
                    QueryResult::NxDomain,
                    0,
                )
            }
            Ok(Resolution::Found { records, skipped }) => {
                let answers = select(records, rtype);
                if answers.is_empty() {
                    debug!(name = %name, rtype = ?rtype, "no records of requested type");
                    (
                        Err(LookupError::ResponseCode(ResponseCode::NoError)),
                        QueryResult::NoData,
                        skipped,
                    )
                } else {
                    debug!(name = %name, count = answers.len(), "returning records");
                    (
                        Ok(LookupRecords::many(lookup_options, record_sets(answers))),
                        QueryResult::Success,
                        skipped,
                    )
                }
            }
            Err(e) => {
                warn!(name = %name, "store read failed: {}", e);
                (
                    Err(LookupError::from(io::Error::other(e.to_string()))),
                    QueryResult::Error,
                    0,
                )
            }
        };

        if skipped > 0 {
            self.metrics
                .try_emit(Metric::counter(NB_RECORD_UNSUPPORTED, skipped as f64));
        }
        metrics::record_query(&self.metrics, Branch::Local, &rtype_str, outcome, timer.elapsed());

        LookupControlFlow::Break(result)
    }

    async fn search(
        &self,
        request_info: RequestInfo<'_>,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        self.lookup(
            request_info.query.name(),
            request_info.query.query_type(),
            lookup_options,
        )
        .await
    }

    async fn get_nsec_records(
        &self,
        _name: &LowerName,
        _lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        // DNSSEC not supported
        LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)))
    }

    async fn update(&self, _update: &MessageRequest) -> UpdateResult<bool> {
        // Records only change through the stream
        Err(ResponseCode::NotImp)
    }
}
