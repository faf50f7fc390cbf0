//! Peer CRUD, generic over `sqlx::Executor` like [`crate::networks`].

use sqlx::{Executor, Sqlite};
use wgpilot_wireguard::{PresharedKey, PrivateKey, PublicKey};

use crate::crypto::{decode_from_storage, encode_for_storage, AeadCipher};
use crate::error::{Result, StoreError};
use crate::store::{Store, StoreTx};
use crate::types::{NewPeer, Peer, PeerRole, PeerUpdate};

#[derive(sqlx::FromRow)]
struct PeerRow {
    id: i64,
    network_id: i64,
    name: String,
    email: Option<String>,
    private_key: String,
    public_key: String,
    preshared_key: Option<String>,
    allowed_ips: String,
    endpoint: Option<String>,
    persistent_keepalive: Option<i64>,
    role: String,
    site_networks: String,
    enabled: bool,
    created_at: i64,
    updated_at: i64,
}

fn row_to_peer(row: PeerRow, cipher: Option<&AeadCipher>) -> Result<Peer> {
    let private_key_b64 = decode_from_storage(cipher, &row.private_key)?;
    let preshared_key = row
        .preshared_key
        .map(|stored| -> Result<PresharedKey> {
            let plain = decode_from_storage(cipher, &stored)?;
            PresharedKey::from_base64(&plain).map_err(|e| StoreError::Decryption(e.to_string()))
        })
        .transpose()?;

    Ok(Peer {
        id: row.id,
        network_id: row.network_id,
        name: row.name,
        email: row.email,
        private_key: PrivateKey::from_base64(&private_key_b64)
            .map_err(|e| StoreError::Decryption(e.to_string()))?,
        public_key: PublicKey::from_base64(&row.public_key).map_err(|_| StoreError::InvalidStoredValue {
            field: "peers.public_key",
            value: row.public_key.clone(),
        })?,
        preshared_key,
        allowed_ips: row.allowed_ips,
        endpoint: row.endpoint,
        persistent_keepalive: row
            .persistent_keepalive
            .map(|v| u16::try_from(v))
            .transpose()
            .map_err(|_| StoreError::InvalidStoredValue {
                field: "peers.persistent_keepalive",
                value: row.persistent_keepalive.map_or_else(String::new, |v| v.to_string()),
            })?,
        role: row.role.parse::<PeerRole>()?,
        site_networks: row.site_networks,
        enabled: row.enabled,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

pub(crate) async fn insert<'e, E>(executor: E, new: &NewPeer, cipher: Option<&AeadCipher>, now: i64) -> Result<Peer>
where
    E: Executor<'e, Database = Sqlite>,
{
    let private_key_stored = encode_for_storage(cipher, &new.private_key.to_base64())?;
    let preshared_key_stored = new
        .preshared_key
        .as_ref()
        .map(|psk| encode_for_storage(cipher, &psk.to_base64()))
        .transpose()?;

    let row = sqlx::query_as::<_, PeerRow>(
        "INSERT INTO peers
            (network_id, name, email, private_key, public_key, preshared_key, allowed_ips,
             endpoint, persistent_keepalive, role, site_networks, enabled, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
         RETURNING *",
    )
    .bind(new.network_id)
    .bind(&new.name)
    .bind(&new.email)
    .bind(private_key_stored)
    .bind(new.public_key.to_base64())
    .bind(preshared_key_stored)
    .bind(&new.allowed_ips)
    .bind(&new.endpoint)
    .bind(new.persistent_keepalive.map(i64::from))
    .bind(new.role.to_string())
    .bind(&new.site_networks)
    .bind(now)
    .bind(now)
    .fetch_one(executor)
    .await
    .map_err(StoreError::from_write)?;

    row_to_peer(row, cipher)
}

pub(crate) async fn get_by_id<'e, E>(executor: E, id: i64, cipher: Option<&AeadCipher>) -> Result<Option<Peer>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, PeerRow>("SELECT * FROM peers WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(StoreError::from)?;
    row.map(|r| row_to_peer(r, cipher)).transpose()
}

pub(crate) async fn list_by_network<'e, E>(
    executor: E,
    network_id: i64,
    cipher: Option<&AeadCipher>,
) -> Result<Vec<Peer>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, PeerRow>("SELECT * FROM peers WHERE network_id = ? ORDER BY id")
        .bind(network_id)
        .fetch_all(executor)
        .await
        .map_err(StoreError::from)?;
    rows.into_iter().map(|r| row_to_peer(r, cipher)).collect()
}

pub(crate) async fn allowed_ips_in_use<'e, E>(executor: E, network_id: i64) -> Result<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String,)> = sqlx::query_as("SELECT allowed_ips FROM peers WHERE network_id = ?")
        .bind(network_id)
        .fetch_all(executor)
        .await
        .map_err(StoreError::from)?;
    Ok(rows.into_iter().map(|(ips,)| ips).collect())
}

pub(crate) async fn update<'e, E>(
    executor: E,
    id: i64,
    patch: &PeerUpdate,
    now: i64,
    cipher: Option<&AeadCipher>,
) -> Result<Option<Peer>>
where
    E: Executor<'e, Database = Sqlite>,
{
    // `PeerUpdate`'s nullable fields use `Option<Option<T>>` so a caller
    // can distinguish "leave unchanged" from "set to null"; SQLite has
    // no ternary bind, so each such field needs its own "did the caller
    // touch this" flag alongside the value.
    let email_touched = patch.email.is_some();
    let email_value = patch.email.clone().flatten();
    let endpoint_touched = patch.endpoint.is_some();
    let endpoint_value = patch.endpoint.clone().flatten();
    let keepalive_touched = patch.persistent_keepalive.is_some();
    let keepalive_value = patch.persistent_keepalive.flatten().map(i64::from);

    let row = sqlx::query_as::<_, PeerRow>(
        "UPDATE peers SET
            name = COALESCE(?, name),
            email = CASE WHEN ? THEN ? ELSE email END,
            endpoint = CASE WHEN ? THEN ? ELSE endpoint END,
            persistent_keepalive = CASE WHEN ? THEN ? ELSE persistent_keepalive END,
            allowed_ips = COALESCE(?, allowed_ips),
            site_networks = COALESCE(?, site_networks),
            enabled = COALESCE(?, enabled),
            updated_at = ?
         WHERE id = ?
         RETURNING *",
    )
    .bind(&patch.name)
    .bind(email_touched)
    .bind(email_value)
    .bind(endpoint_touched)
    .bind(endpoint_value)
    .bind(keepalive_touched)
    .bind(keepalive_value)
    .bind(&patch.allowed_ips)
    .bind(&patch.site_networks)
    .bind(patch.enabled)
    .bind(now)
    .bind(id)
    .fetch_optional(executor)
    .await
    .map_err(StoreError::from_write)?;
    row.map(|r| row_to_peer(r, cipher)).transpose()
}

pub(crate) async fn delete<'e, E>(executor: E, id: i64) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM peers WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await
        .map_err(StoreError::from)?;
    Ok(result.rows_affected() > 0)
}

impl Store {
    /// Create a peer attached to an existing network. A `network_id`
    /// with no matching row surfaces as `StoreError::ForeignKey`.
    pub async fn create_peer(&self, new: &NewPeer, now: i64, correlation_id: &str) -> Result<Peer> {
        self.timed(
            "create_peer",
            correlation_id,
            insert(&self.pool, new, self.cipher.as_ref(), now),
        )
        .await
    }

    /// Look up a peer by id. `Ok(None)` means no such row.
    pub async fn get_peer(&self, id: i64, correlation_id: &str) -> Result<Option<Peer>> {
        self.timed("get_peer", correlation_id, get_by_id(&self.pool, id, self.cipher.as_ref()))
            .await
    }

    /// List every peer attached to a network, ordered by id.
    pub async fn list_peers_by_network(&self, network_id: i64, correlation_id: &str) -> Result<Vec<Peer>> {
        self.timed(
            "list_peers_by_network",
            correlation_id,
            list_by_network(&self.pool, network_id, self.cipher.as_ref()),
        )
        .await
    }

    /// The raw `allowed_ips` CSV of every peer on a network, for the IP
    /// allocator to derive the in-use host set from.
    pub async fn peer_allowed_ips_in_use(&self, network_id: i64, correlation_id: &str) -> Result<Vec<String>> {
        self.timed(
            "peer_allowed_ips_in_use",
            correlation_id,
            allowed_ips_in_use(&self.pool, network_id),
        )
        .await
    }

    /// Apply a partial update to an existing peer. `Ok(None)` if the id
    /// does not exist.
    pub async fn update_peer(
        &self,
        id: i64,
        patch: &PeerUpdate,
        now: i64,
        correlation_id: &str,
    ) -> Result<Option<Peer>> {
        self.timed(
            "update_peer",
            correlation_id,
            update(&self.pool, id, patch, now, self.cipher.as_ref()),
        )
        .await
    }

    /// Delete a peer and cascade to its snapshots. Returns whether a row
    /// was actually removed.
    pub async fn delete_peer(&self, id: i64, correlation_id: &str) -> Result<bool> {
        self.timed("delete_peer", correlation_id, delete(&self.pool, id)).await
    }
}

impl<'c> StoreTx<'c> {
    /// Transactional variant of [`Store::create_peer`].
    pub async fn create_peer(&mut self, new: &NewPeer, now: i64) -> Result<Peer> {
        insert(&mut *self.tx, new, self.cipher, now).await
    }

    /// Transactional variant of [`Store::peer_allowed_ips_in_use`], used
    /// by the Orchestrator to allocate the next host address and insert
    /// the new peer under the same lock/transaction.
    pub async fn peer_allowed_ips_in_use(&mut self, network_id: i64) -> Result<Vec<String>> {
        allowed_ips_in_use(&mut *self.tx, network_id).await
    }

    /// Transactional variant of [`Store::delete_peer`].
    pub async fn delete_peer(&mut self, id: i64) -> Result<bool> {
        delete(&mut *self.tx, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;
    use crate::types::{NetworkMode, NewNetwork};
    use wgpilot_wireguard::KeyPair;

    async fn seed_network(store: &Store) -> i64 {
        let keys = KeyPair::generate();
        let new = NewNetwork {
            name: "Home VPN".to_string(),
            interface: "wg0".to_string(),
            mode: NetworkMode::Gateway,
            subnet: "10.0.0.0/24".parse().expect("subnet"),
            listen_port: 51820,
            private_key: keys.private,
            public_key: keys.public,
            dns_servers: String::new(),
            nat_enabled: true,
            inter_peer_routing: false,
        };
        store.create_network(&new, 1000, "test").await.expect("create network").id
    }

    fn sample_peer(network_id: i64) -> NewPeer {
        let keys = KeyPair::generate();
        NewPeer {
            network_id,
            name: "phone".to_string(),
            email: None,
            private_key: keys.private,
            public_key: keys.public,
            preshared_key: None,
            allowed_ips: "10.0.0.2/32".to_string(),
            endpoint: None,
            persistent_keepalive: Some(25),
            role: PeerRole::Client,
            site_networks: String::new(),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (store, _file) = temp_store().await;
        let network_id = seed_network(&store).await;
        let created = store.create_peer(&sample_peer(network_id), 1000, "test").await.expect("create");
        let fetched = store.get_peer(created.id, "test").await.expect("get").expect("present");
        assert_eq!(fetched.allowed_ips, "10.0.0.2/32");
        assert_eq!(fetched.persistent_keepalive, Some(25));
    }

    #[tokio::test]
    async fn create_with_unknown_network_is_foreign_key_error() {
        let (store, _file) = temp_store().await;
        let err = store.create_peer(&sample_peer(999), 1000, "test").await.unwrap_err();
        assert!(matches!(err, StoreError::ForeignKey(_)));
    }

    #[tokio::test]
    async fn deleting_network_cascades_to_peers() {
        let (store, _file) = temp_store().await;
        let network_id = seed_network(&store).await;
        let peer = store.create_peer(&sample_peer(network_id), 1000, "test").await.expect("create");

        store.delete_network(network_id, "test").await.expect("delete network");
        let fetched = store.get_peer(peer.id, "test").await.expect("get");
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn update_can_clear_optional_endpoint_to_null() {
        let (store, _file) = temp_store().await;
        let network_id = seed_network(&store).await;
        let mut new = sample_peer(network_id);
        new.endpoint = Some("203.0.113.5:51820".to_string());
        let created = store.create_peer(&new, 1000, "test").await.expect("create");
        assert_eq!(created.endpoint.as_deref(), Some("203.0.113.5:51820"));

        let patch = PeerUpdate {
            endpoint: Some(None),
            ..Default::default()
        };
        let updated = store
            .update_peer(created.id, &patch, 2000, "test")
            .await
            .expect("update")
            .expect("present");
        assert_eq!(updated.endpoint, None);
    }

    #[tokio::test]
    async fn update_leaves_untouched_optional_fields_alone() {
        let (store, _file) = temp_store().await;
        let network_id = seed_network(&store).await;
        let mut new = sample_peer(network_id);
        new.endpoint = Some("203.0.113.5:51820".to_string());
        let created = store.create_peer(&new, 1000, "test").await.expect("create");

        let patch = PeerUpdate {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        let updated = store
            .update_peer(created.id, &patch, 2000, "test")
            .await
            .expect("update")
            .expect("present");
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.endpoint.as_deref(), Some("203.0.113.5:51820"));
    }

    #[tokio::test]
    async fn allowed_ips_in_use_reflects_existing_peers() {
        let (store, _file) = temp_store().await;
        let network_id = seed_network(&store).await;
        store.create_peer(&sample_peer(network_id), 1000, "test").await.expect("create");
        let mut second = sample_peer(network_id);
        second.allowed_ips = "10.0.0.3/32".to_string();
        store.create_peer(&second, 1000, "test").await.expect("create");

        let in_use = store.peer_allowed_ips_in_use(network_id, "test").await.expect("list");
        assert_eq!(in_use.len(), 2);
        assert!(in_use.contains(&"10.0.0.2/32".to_string()));
        assert!(in_use.contains(&"10.0.0.3/32".to_string()));
    }

    #[tokio::test]
    async fn preshared_key_round_trips_under_encryption() {
        use crate::store::test_support::temp_store_encrypted;
        use wgpilot_wireguard::PresharedKey;

        let (store, _file) = temp_store_encrypted([3u8; 32]).await;
        let network_id = seed_network(&store).await;
        let mut new = sample_peer(network_id);
        new.preshared_key = Some(PresharedKey::generate());
        let created = store.create_peer(&new, 1000, "test").await.expect("create");

        let fetched = store.get_peer(created.id, "test").await.expect("get").expect("present");
        assert_eq!(fetched.preshared_key, created.preshared_key);
    }
}
