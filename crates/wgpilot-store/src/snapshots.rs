//! Peer counter snapshots: insert-only, periodically compacted and
//! retention-trimmed by the Monitor.

use sqlx::{Executor, Sqlite};

use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::types::PeerSnapshot;

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    peer_id: i64,
    timestamp: i64,
    rx_bytes: i64,
    tx_bytes: i64,
    online: bool,
}

fn row_to_snapshot(row: SnapshotRow) -> Result<PeerSnapshot> {
    Ok(PeerSnapshot {
        peer_id: row.peer_id,
        timestamp: row.timestamp,
        rx_bytes: u64::try_from(row.rx_bytes).map_err(|_| StoreError::InvalidStoredValue {
            field: "peer_snapshots.rx_bytes",
            value: row.rx_bytes.to_string(),
        })?,
        tx_bytes: u64::try_from(row.tx_bytes).map_err(|_| StoreError::InvalidStoredValue {
            field: "peer_snapshots.tx_bytes",
            value: row.tx_bytes.to_string(),
        })?,
        online: row.online,
    })
}

/// Insert one snapshot. Overwrites any existing row for the same
/// `(peer_id, timestamp)`, since the Monitor's own polling tick never
/// samples the same peer twice within one second.
pub(crate) async fn insert<'e, E>(executor: E, snapshot: &PeerSnapshot) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO peer_snapshots (peer_id, timestamp, rx_bytes, tx_bytes, online)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (peer_id, timestamp) DO UPDATE SET
            rx_bytes = excluded.rx_bytes,
            tx_bytes = excluded.tx_bytes,
            online = excluded.online",
    )
    .bind(snapshot.peer_id)
    .bind(snapshot.timestamp)
    .bind(i64::try_from(snapshot.rx_bytes).unwrap_or(i64::MAX))
    .bind(i64::try_from(snapshot.tx_bytes).unwrap_or(i64::MAX))
    .bind(snapshot.online)
    .execute(executor)
    .await
    .map_err(StoreError::from)?;
    Ok(())
}

pub(crate) async fn list_for_peer<'e, E>(
    executor: E,
    peer_id: i64,
    since: i64,
) -> Result<Vec<PeerSnapshot>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, SnapshotRow>(
        "SELECT * FROM peer_snapshots WHERE peer_id = ? AND timestamp >= ? ORDER BY timestamp",
    )
    .bind(peer_id)
    .bind(since)
    .fetch_all(executor)
    .await
    .map_err(StoreError::from)?;
    rows.into_iter().map(row_to_snapshot).collect()
}

pub(crate) async fn latest_for_peer<'e, E>(executor: E, peer_id: i64) -> Result<Option<PeerSnapshot>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, SnapshotRow>(
        "SELECT * FROM peer_snapshots WHERE peer_id = ? ORDER BY timestamp DESC LIMIT 1",
    )
    .bind(peer_id)
    .fetch_optional(executor)
    .await
    .map_err(StoreError::from)?;
    row.map(row_to_snapshot).transpose()
}

/// Delete snapshots older than `cutoff` (exclusive of the retention
/// window), returning the number of rows removed. The Monitor calls
/// this on its compaction tick.
pub(crate) async fn delete_older_than<'e, E>(executor: E, cutoff: i64) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM peer_snapshots WHERE timestamp < ?")
        .bind(cutoff)
        .execute(executor)
        .await
        .map_err(StoreError::from)?;
    Ok(result.rows_affected())
}

impl Store {
    /// Persist one counter sample for a peer.
    pub async fn record_peer_snapshot(&self, snapshot: &PeerSnapshot, correlation_id: &str) -> Result<()> {
        self.timed("record_peer_snapshot", correlation_id, insert(&self.pool, snapshot))
            .await
    }

    /// List snapshots for a peer at or after `since` (Unix seconds),
    /// ascending by timestamp.
    pub async fn list_peer_snapshots(&self, peer_id: i64, since: i64, correlation_id: &str) -> Result<Vec<PeerSnapshot>> {
        self.timed(
            "list_peer_snapshots",
            correlation_id,
            list_for_peer(&self.pool, peer_id, since),
        )
        .await
    }

    /// Most recent snapshot for a peer, if any.
    pub async fn latest_peer_snapshot(&self, peer_id: i64, correlation_id: &str) -> Result<Option<PeerSnapshot>> {
        self.timed(
            "latest_peer_snapshot",
            correlation_id,
            latest_for_peer(&self.pool, peer_id),
        )
        .await
    }

    /// Trim snapshots older than `cutoff`, returning how many were
    /// removed.
    pub async fn compact_peer_snapshots(&self, cutoff: i64, correlation_id: &str) -> Result<u64> {
        self.timed(
            "compact_peer_snapshots",
            correlation_id,
            delete_older_than(&self.pool, cutoff),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;
    use crate::types::{NetworkMode, NewNetwork, NewPeer, PeerRole};
    use wgpilot_wireguard::KeyPair;

    async fn seed_peer(store: &Store) -> i64 {
        let net_keys = KeyPair::generate();
        let network = store
            .create_network(
                &NewNetwork {
                    name: "net".to_string(),
                    interface: "wg0".to_string(),
                    mode: NetworkMode::Gateway,
                    subnet: "10.0.0.0/24".parse().expect("subnet"),
                    listen_port: 51820,
                    private_key: net_keys.private,
                    public_key: net_keys.public,
                    dns_servers: String::new(),
                    nat_enabled: true,
                    inter_peer_routing: false,
                },
                1000,
                "test",
            )
            .await
            .expect("create network");

        let peer_keys = KeyPair::generate();
        store
            .create_peer(
                &NewPeer {
                    network_id: network.id,
                    name: "phone".to_string(),
                    email: None,
                    private_key: peer_keys.private,
                    public_key: peer_keys.public,
                    preshared_key: None,
                    allowed_ips: "10.0.0.2/32".to_string(),
                    endpoint: None,
                    persistent_keepalive: None,
                    role: PeerRole::Client,
                    site_networks: String::new(),
                },
                1000,
                "test",
            )
            .await
            .expect("create peer")
            .id
    }

    #[tokio::test]
    async fn record_then_list_returns_samples_since_cutoff() {
        let (store, _file) = temp_store().await;
        let peer_id = seed_peer(&store).await;

        for (ts, rx) in [(100, 10), (200, 20), (300, 30)] {
            store
                .record_peer_snapshot(
                    &PeerSnapshot {
                        peer_id,
                        timestamp: ts,
                        rx_bytes: rx,
                        tx_bytes: rx * 2,
                        online: true,
                    },
                    "test",
                )
                .await
                .expect("record");
        }

        let since_200 = store.list_peer_snapshots(peer_id, 200, "test").await.expect("list");
        assert_eq!(since_200.len(), 2);
        assert_eq!(since_200[0].timestamp, 200);
    }

    #[tokio::test]
    async fn latest_returns_most_recent_sample() {
        let (store, _file) = temp_store().await;
        let peer_id = seed_peer(&store).await;
        store
            .record_peer_snapshot(
                &PeerSnapshot { peer_id, timestamp: 100, rx_bytes: 1, tx_bytes: 1, online: true },
                "test",
            )
            .await
            .expect("record");
        store
            .record_peer_snapshot(
                &PeerSnapshot { peer_id, timestamp: 200, rx_bytes: 2, tx_bytes: 2, online: false },
                "test",
            )
            .await
            .expect("record");

        let latest = store.latest_peer_snapshot(peer_id, "test").await.expect("latest").expect("present");
        assert_eq!(latest.timestamp, 200);
        assert!(!latest.online);
    }

    #[tokio::test]
    async fn compaction_removes_only_older_rows() {
        let (store, _file) = temp_store().await;
        let peer_id = seed_peer(&store).await;
        for ts in [100, 200, 300] {
            store
                .record_peer_snapshot(
                    &PeerSnapshot { peer_id, timestamp: ts, rx_bytes: 1, tx_bytes: 1, online: true },
                    "test",
                )
                .await
                .expect("record");
        }

        let removed = store.compact_peer_snapshots(250, "test").await.expect("compact");
        assert_eq!(removed, 2);
        let remaining = store.list_peer_snapshots(peer_id, 0, "test").await.expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, 300);
    }

    #[tokio::test]
    async fn deleting_peer_cascades_its_snapshots() {
        let (store, _file) = temp_store().await;
        let peer_id = seed_peer(&store).await;
        store
            .record_peer_snapshot(
                &PeerSnapshot { peer_id, timestamp: 100, rx_bytes: 1, tx_bytes: 1, online: true },
                "test",
            )
            .await
            .expect("record");

        store.delete_peer(peer_id, "test").await.expect("delete peer");
        let remaining = store.list_peer_snapshots(peer_id, 0, "test").await.expect("list");
        assert!(remaining.is_empty());
    }
}
