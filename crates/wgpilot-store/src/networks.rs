//! Network CRUD. Every query is generic over `sqlx::Executor` so the
//! same SQL runs against the pool (`Store`'s own methods) or an open
//! transaction (`StoreTx`), per spec.md §4.1's `beginTx → exec*` model.

use std::str::FromStr;

use ipnet::Ipv4Net;
use sqlx::{Executor, Sqlite};
use wgpilot_wireguard::{PrivateKey, PublicKey};

use crate::crypto::{decode_from_storage, encode_for_storage, AeadCipher};
use crate::error::{Result, StoreError};
use crate::store::{Store, StoreTx};
use crate::types::{NetworkMode, Network, NetworkUpdate, NewNetwork};

#[derive(sqlx::FromRow)]
struct NetworkRow {
    id: i64,
    name: String,
    interface: String,
    mode: String,
    subnet: String,
    listen_port: i64,
    private_key: String,
    public_key: String,
    dns_servers: String,
    nat_enabled: bool,
    inter_peer_routing: bool,
    enabled: bool,
    created_at: i64,
    updated_at: i64,
}

fn row_to_network(row: NetworkRow, cipher: Option<&AeadCipher>) -> Result<Network> {
    let private_key_b64 = decode_from_storage(cipher, &row.private_key)?;
    Ok(Network {
        id: row.id,
        name: row.name,
        interface: row.interface,
        mode: row.mode.parse::<NetworkMode>()?,
        subnet: Ipv4Net::from_str(&row.subnet).map_err(|_| StoreError::InvalidStoredValue {
            field: "networks.subnet",
            value: row.subnet.clone(),
        })?,
        listen_port: u16::try_from(row.listen_port).map_err(|_| StoreError::InvalidStoredValue {
            field: "networks.listen_port",
            value: row.listen_port.to_string(),
        })?,
        private_key: PrivateKey::from_base64(&private_key_b64)
            .map_err(|e| StoreError::Decryption(e.to_string()))?,
        public_key: PublicKey::from_base64(&row.public_key).map_err(|_| StoreError::InvalidStoredValue {
            field: "networks.public_key",
            value: row.public_key.clone(),
        })?,
        dns_servers: row.dns_servers,
        nat_enabled: row.nat_enabled,
        inter_peer_routing: row.inter_peer_routing,
        enabled: row.enabled,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

pub(crate) async fn insert<'e, E>(
    executor: E,
    new: &NewNetwork,
    cipher: Option<&AeadCipher>,
    now: i64,
) -> Result<Network>
where
    E: Executor<'e, Database = Sqlite>,
{
    let private_key_stored = encode_for_storage(cipher, &new.private_key.to_base64())?;
    let row = sqlx::query_as::<_, NetworkRow>(
        "INSERT INTO networks
            (name, interface, mode, subnet, listen_port, private_key, public_key,
             dns_servers, nat_enabled, inter_peer_routing, enabled, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
         RETURNING id, name, interface, mode, subnet, listen_port, private_key, public_key,
                   dns_servers, nat_enabled, inter_peer_routing, enabled, created_at, updated_at",
    )
    .bind(&new.name)
    .bind(&new.interface)
    .bind(new.mode.to_string())
    .bind(new.subnet.to_string())
    .bind(i64::from(new.listen_port))
    .bind(private_key_stored)
    .bind(new.public_key.to_base64())
    .bind(&new.dns_servers)
    .bind(new.nat_enabled)
    .bind(new.inter_peer_routing)
    .bind(now)
    .bind(now)
    .fetch_one(executor)
    .await
    .map_err(StoreError::from_write)?;

    row_to_network(row, cipher)
}

pub(crate) async fn get_by_id<'e, E>(executor: E, id: i64, cipher: Option<&AeadCipher>) -> Result<Option<Network>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, NetworkRow>("SELECT * FROM networks WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(StoreError::from)?;
    row.map(|r| row_to_network(r, cipher)).transpose()
}

pub(crate) async fn get_by_interface<'e, E>(
    executor: E,
    interface: &str,
    cipher: Option<&AeadCipher>,
) -> Result<Option<Network>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, NetworkRow>("SELECT * FROM networks WHERE interface = ?")
        .bind(interface)
        .fetch_optional(executor)
        .await
        .map_err(StoreError::from)?;
    row.map(|r| row_to_network(r, cipher)).transpose()
}

pub(crate) async fn list<'e, E>(executor: E, cipher: Option<&AeadCipher>) -> Result<Vec<Network>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, NetworkRow>("SELECT * FROM networks ORDER BY id")
        .fetch_all(executor)
        .await
        .map_err(StoreError::from)?;
    rows.into_iter().map(|r| row_to_network(r, cipher)).collect()
}

pub(crate) async fn update<'e, E>(
    executor: E,
    id: i64,
    patch: &NetworkUpdate,
    now: i64,
    cipher: Option<&AeadCipher>,
) -> Result<Option<Network>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, NetworkRow>(
        "UPDATE networks SET
            name = COALESCE(?, name),
            dns_servers = COALESCE(?, dns_servers),
            nat_enabled = COALESCE(?, nat_enabled),
            inter_peer_routing = COALESCE(?, inter_peer_routing),
            enabled = COALESCE(?, enabled),
            updated_at = ?
         WHERE id = ?
         RETURNING *",
    )
    .bind(&patch.name)
    .bind(&patch.dns_servers)
    .bind(patch.nat_enabled)
    .bind(patch.inter_peer_routing)
    .bind(patch.enabled)
    .bind(now)
    .bind(id)
    .fetch_optional(executor)
    .await
    .map_err(StoreError::from_write)?;
    row.map(|r| row_to_network(r, cipher)).transpose()
}

pub(crate) async fn delete<'e, E>(executor: E, id: i64) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM networks WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await
        .map_err(StoreError::from)?;
    Ok(result.rows_affected() > 0)
}

impl Store {
    /// Create a network. `not-found` never applies here; a duplicate
    /// interface or listen port surfaces as `StoreError::Conflict`.
    pub async fn create_network(&self, new: &NewNetwork, now: i64, correlation_id: &str) -> Result<Network> {
        self.timed(
            "create_network",
            correlation_id,
            insert(&self.pool, new, self.cipher.as_ref(), now),
        )
        .await
    }

    /// Look up a network by id. `Ok(None)` means no such row.
    pub async fn get_network(&self, id: i64, correlation_id: &str) -> Result<Option<Network>> {
        self.timed("get_network", correlation_id, get_by_id(&self.pool, id, self.cipher.as_ref()))
            .await
    }

    /// Look up a network by its kernel interface name.
    pub async fn get_network_by_interface(&self, interface: &str, correlation_id: &str) -> Result<Option<Network>> {
        self.timed(
            "get_network_by_interface",
            correlation_id,
            get_by_interface(&self.pool, interface, self.cipher.as_ref()),
        )
        .await
    }

    /// List every network, ordered by id.
    pub async fn list_networks(&self, correlation_id: &str) -> Result<Vec<Network>> {
        self.timed("list_networks", correlation_id, list(&self.pool, self.cipher.as_ref()))
            .await
    }

    /// Apply a partial update to an existing network. `Ok(None)` if the
    /// id does not exist.
    pub async fn update_network(
        &self,
        id: i64,
        patch: &NetworkUpdate,
        now: i64,
        correlation_id: &str,
    ) -> Result<Option<Network>> {
        self.timed(
            "update_network",
            correlation_id,
            update(&self.pool, id, patch, now, self.cipher.as_ref()),
        )
        .await
    }

    /// Delete a network and cascade to its peers, bridges, and
    /// snapshots. Returns whether a row was actually removed.
    pub async fn delete_network(&self, id: i64, correlation_id: &str) -> Result<bool> {
        self.timed("delete_network", correlation_id, delete(&self.pool, id)).await
    }
}

impl<'c> StoreTx<'c> {
    /// Transactional variant of [`Store::create_network`].
    pub async fn create_network(&mut self, new: &NewNetwork, now: i64) -> Result<Network> {
        insert(&mut *self.tx, new, self.cipher, now).await
    }

    /// Transactional variant of [`Store::get_network`].
    pub async fn get_network(&mut self, id: i64) -> Result<Option<Network>> {
        get_by_id(&mut *self.tx, id, self.cipher).await
    }
}
