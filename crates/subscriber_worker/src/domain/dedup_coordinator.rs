use async_trait::async_trait;
use common::domain::{
    Clock, DedupKey, DomainError, DomainResult, MessageHandler, MessageOutcome, Packet,
    PacketAttributes, ReceivedMessage, RowStore, StoredRow, TableCatalog, TableRef,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupSettings {
    pub ack_deadline: Duration,
    /// Upper bound on each store call made while handling one message.
    pub store_timeout: Duration,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            ack_deadline: Duration::from_secs(5),
            store_timeout: Duration::from_secs(30),
        }
    }
}

/// Consumer-side handler persisting each packet at most once per
/// `(unix_ms, region)`.
///
/// Messages are acknowledged before anything else happens, so a failure
/// further down loses the packet instead of redelivering it. The duplicate
/// check and the insert are two separate store calls; two deliveries of the
/// same key racing each other can both pass the check.
pub struct DedupCoordinator {
    store: Arc<dyn RowStore>,
    catalog: TableCatalog,
    table: TableRef,
    clock: Arc<dyn Clock>,
    settings: DedupSettings,
}

impl DedupCoordinator {
    pub fn new(
        store: Arc<dyn RowStore>,
        table: TableRef,
        clock: Arc<dyn Clock>,
        settings: DedupSettings,
    ) -> Self {
        Self {
            catalog: TableCatalog::new(store.clone()),
            store,
            table,
            clock,
            settings,
        }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> DomainResult<T>
    where
        F: Future<Output = DomainResult<T>>,
    {
        match tokio::time::timeout(self.settings.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::Timeout(format!(
                "{} on {} exceeded {:?}",
                operation, self.table, self.settings.store_timeout
            ))),
        }
    }

    /// Seconds between packet creation and now; zero when the local clock is
    /// behind the packet.
    fn trip_seconds(&self, packet: &Packet) -> f64 {
        let now_ms = self.clock.now().timestamp_millis();
        let trip = (now_ms - packet.unix_ms) as f64 / 1000.0;
        if trip < 0.0 {
            warn!(
                msg_trip_s = trip,
                unix_ms = packet.unix_ms,
                "local clock is behind the packet, clamping trip time to zero"
            );
            return 0.0;
        }
        trip
    }

    async fn table_available(&self, key: &DedupKey) -> bool {
        match self
            .bounded("table check", self.catalog.table_ref_exists(&self.table))
            .await
        {
            Ok(exists) => exists,
            Err(e) => {
                error!(error = %e, key = %key, "table check failed");
                false
            }
        }
    }

    async fn persist(&self, packet: Packet, started: Instant) -> MessageOutcome {
        let key = packet.dedup_key();

        if !self.table_available(&key).await {
            warn!(
                key = %key,
                channels = ?packet.channels,
                "table unavailable, packet not stored"
            );
            return MessageOutcome::TableUnavailable(key);
        }

        let msg_trip_s = self.trip_seconds(&packet);
        let msg_proc_s = started.elapsed().as_secs_f64();

        let matches = match self
            .bounded("duplicate check", self.store.count_matching_rows(&self.table, &key))
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                error!(error = %e, key = %key, "duplicate check failed, packet dropped");
                return MessageOutcome::InsertFailed {
                    key,
                    reason: e.to_string(),
                };
            }
        };

        if matches > 0 {
            if matches > 1 {
                warn!(key = %key, duplicates = matches, "table already holds duplicate rows");
            }
            info!(key = %key, "duplicate packet discarded");
            return MessageOutcome::Duplicate { key, matches };
        }

        let row = StoredRow::from_packet(&packet, msg_trip_s, msg_proc_s);
        let result = self
            .bounded("insert", self.store.insert_rows(&self.table, &[row]))
            .await;

        let reason = match result {
            Ok(row_errors) if row_errors.is_empty() => {
                info!(key = %key, msg_trip_s, msg_proc_s, "packet stored");
                return MessageOutcome::Inserted(key);
            }
            Ok(row_errors) => row_errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
            Err(DomainError::InsertError(reason)) => reason,
            Err(e) => e.to_string(),
        };

        let err = DomainError::InsertError(reason);
        error!(error = %err, key = %key, "insert failed, packet lost");
        MessageOutcome::InsertFailed {
            key,
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl MessageHandler for DedupCoordinator {
    async fn on_message_received(&self, message: ReceivedMessage) -> MessageOutcome {
        let started = Instant::now();
        let message_id = message.message().message_id.clone();
        let span = info_span!("on_message_received", message_id = %message_id);

        async move {
            if let Err(e) = message.ack_with_response(self.settings.ack_deadline).await {
                warn!(error = %e, "acknowledgement failed, continuing");
            } else {
                debug!("message acknowledged");
            }

            let decoded = PacketAttributes::from_attributes(&message.message().attributes)
                .and_then(|attrs| {
                    Packet::from_wire_bytes(&message.message().data).map(|p| (attrs, p))
                });
            let (attrs, packet) = match decoded {
                Ok(decoded) => decoded,
                Err(e) => {
                    error!(error = %e, "message could not be decoded");
                    return MessageOutcome::DecodeFailed(e.to_string());
                }
            };
            debug!(business = %attrs.business, key = %packet.dedup_key(), "message decoded");

            self.persist(packet, started).await
        }
        .instrument(span)
        .await
    }
}
