//! The Setup State Machine: a linear guard gating every mutating
//! operation until the first admin, server identity, first network, and
//! first peer all exist.
//!
//! States are persisted as a single string in `settings["setup.step"]`
//! (absent means S0). Each step handler re-reads the current step,
//! refuses to run out of order, and advances the marker on success in
//! the same unit of work as its side effect where that's practical
//! (step 1's admin creation is transactional with the step advance;
//! steps 2-4 call into the Store/Orchestrator and then advance the
//! marker as a second write, since the Orchestrator doesn't expose a
//! transaction boundary that spans kernel driver calls).

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand_core::{OsRng, RngCore};
use tokio_util::sync::CancellationToken;
use tracing::info;

use wgpilot_firewall::Applier;
use wgpilot_store::{NewUser, Store, User};
use wgpilot_wireguard::WireGuardDriver;

use crate::error::{Result, WgpilotError};
use crate::orchestrator::{now, NewNetworkRequest, NewPeerRequest, Orchestrator};
use crate::types::{Network, Peer};

const SETTING_STEP: &str = "setup.step";
const SETTING_OTP_HASH: &str = "setup.otp_hash";
const SETTING_FIRST_NETWORK_ID: &str = "setup.first_network_id";
const SETTING_PUBLIC_IP: &str = "setup.public_ip";
const SETTING_HOSTNAME: &str = "setup.hostname";
const SETTING_DNS: &str = "setup.dns_servers";

/// One of the five strictly-ordered setup states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SetupStep {
    /// Nothing done yet; a bootstrap OTP hash exists in Settings.
    S0,
    /// The first admin user has been created; the OTP is consumed.
    S1,
    /// Server identity (public IP, hostname, DNS) has been saved.
    S2,
    /// The first network has been created.
    S3,
    /// The first peer has been created; setup is complete.
    S4,
}

impl SetupStep {
    fn as_str(self) -> &'static str {
        match self {
            Self::S0 => "s0",
            Self::S1 => "s1",
            Self::S2 => "s2",
            Self::S3 => "s3",
            Self::S4 => "s4",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "s1" => Self::S1,
            "s2" => Self::S2,
            "s3" => Self::S3,
            "s4" => Self::S4,
            _ => Self::S0,
        }
    }

    /// True once setup has reached its terminal state.
    #[must_use]
    pub fn is_complete(self) -> bool {
        self == Self::S4
    }
}

/// Seam for the one-time bootstrap password: hashing and verification
/// are whatever the deployment's credential layer already uses
/// (bcrypt, argon2, ...); this machine only ever compares against a
/// hash it did not produce itself.
pub trait OtpHasher: Send + Sync {
    /// Hash a freshly generated plaintext OTP for storage.
    fn hash(&self, otp: &str) -> String;
    /// Compare a plaintext OTP against a previously stored hash.
    fn verify(&self, otp: &str, hash: &str) -> bool;
}

/// Server identity saved at step 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    /// Publicly reachable IP or hostname peers will connect to.
    pub public_ip: String,
    /// Display hostname for the server.
    pub hostname: String,
    /// Comma-separated DNS servers pushed to new peers by default.
    pub dns_servers: String,
}

/// Gates every mutating operation behind the five-state setup sequence
/// and drives the Orchestrator for the two steps (first network, first
/// peer) that create real entities.
pub struct SetupMachine<W, A>
where
    W: WireGuardDriver,
    A: Applier,
{
    store: Store,
    orchestrator: Arc<Orchestrator<W, A>>,
}

impl<W, A> SetupMachine<W, A>
where
    W: WireGuardDriver,
    A: Applier,
{
    /// Construct a setup machine over the shared Store and Orchestrator.
    pub fn new(store: Store, orchestrator: Arc<Orchestrator<W, A>>) -> Self {
        Self { store, orchestrator }
    }

    /// Read the current step. Absent marker means S0.
    pub async fn current_step(&self, correlation_id: &str) -> Result<SetupStep> {
        let raw = self.store.get_setting(SETTING_STEP, correlation_id).await?;
        Ok(raw.map_or(SetupStep::S0, |s| SetupStep::parse(&s)))
    }

    /// The guard every non-setup mutating entrypoint calls first.
    pub async fn ensure_complete(&self, correlation_id: &str) -> Result<()> {
        if self.current_step(correlation_id).await?.is_complete() {
            Ok(())
        } else {
            Err(WgpilotError::SetupRequired)
        }
    }

    /// Generate and store a bootstrap OTP hash if S0 has not yet set
    /// one. Returns the plaintext OTP the operator must relay to
    /// whoever completes step 1, or `None` if a hash already exists
    /// (e.g. a restart before step 1 ran) or setup has moved past S0.
    pub async fn ensure_bootstrap_otp(&self, hasher: &dyn OtpHasher, correlation_id: &str) -> Result<Option<String>> {
        if self.current_step(correlation_id).await? != SetupStep::S0 {
            return Ok(None);
        }
        if self.store.get_setting(SETTING_OTP_HASH, correlation_id).await?.is_some() {
            return Ok(None);
        }
        let otp = generate_otp();
        let hash = hasher.hash(&otp);
        self.store.set_setting(SETTING_OTP_HASH, &hash, correlation_id).await?;
        Ok(Some(otp))
    }

    /// Step 1: consume the bootstrap OTP and create the first admin
    /// user, atomically with advancing the step marker. Non-idempotent
    /// — the OTP hash is deleted on success, so a repeat call always
    /// fails.
    pub async fn step1_create_admin(
        &self,
        otp: &str,
        username: &str,
        password_hash: &str,
        hasher: &dyn OtpHasher,
        correlation_id: &str,
    ) -> Result<User> {
        let step = self.current_step(correlation_id).await?;
        if step == SetupStep::S4 {
            return Err(WgpilotError::SetupAlreadyComplete);
        }
        if step != SetupStep::S0 {
            return Err(WgpilotError::StepOrderViolation);
        }

        let stored_hash = self
            .store
            .get_setting(SETTING_OTP_HASH, correlation_id)
            .await?
            .ok_or(WgpilotError::InvalidOtp)?;
        if !hasher.verify(otp, &stored_hash) {
            return Err(WgpilotError::InvalidOtp);
        }

        let mut tx = self.store.begin().await?;
        let tx_step = SetupStep::parse(&tx.get_setting(SETTING_STEP).await?.unwrap_or_default());
        if tx_step != SetupStep::S0 {
            tx.rollback().await?;
            return Err(WgpilotError::StepOrderViolation);
        }
        let user = tx
            .create_user(
                &NewUser {
                    username: username.to_string(),
                    password_hash: password_hash.to_string(),
                    role: "admin".to_string(),
                },
                now(),
            )
            .await?;
        tx.set_setting(SETTING_STEP, SetupStep::S1.as_str()).await?;
        tx.commit().await?;

        let _ = self.store.delete_setting(SETTING_OTP_HASH, correlation_id).await;

        info!(user_id = user.id, "setup step 1 complete: admin created");
        Ok(user)
    }

    /// Step 2: save server identity. Idempotent while still at S2 — a
    /// repeat call re-saves the same fields without advancing further.
    pub async fn step2_save_identity(&self, identity: &ServerIdentity, correlation_id: &str) -> Result<()> {
        let step = self.current_step(correlation_id).await?;
        if step == SetupStep::S4 {
            return Err(WgpilotError::SetupAlreadyComplete);
        }
        if step != SetupStep::S1 && step != SetupStep::S2 {
            return Err(WgpilotError::StepOrderViolation);
        }

        self.store.set_setting(SETTING_PUBLIC_IP, &identity.public_ip, correlation_id).await?;
        self.store.set_setting(SETTING_HOSTNAME, &identity.hostname, correlation_id).await?;
        self.store.set_setting(SETTING_DNS, &identity.dns_servers, correlation_id).await?;

        if step == SetupStep::S1 {
            self.store.set_setting(SETTING_STEP, SetupStep::S2.as_str(), correlation_id).await?;
            info!("setup step 2 complete: server identity saved");
        }
        Ok(())
    }

    /// Read back the server identity saved at step 2, if any.
    pub async fn server_identity(&self, correlation_id: &str) -> Result<Option<ServerIdentity>> {
        let public_ip = self.store.get_setting(SETTING_PUBLIC_IP, correlation_id).await?;
        let hostname = self.store.get_setting(SETTING_HOSTNAME, correlation_id).await?;
        let dns_servers = self.store.get_setting(SETTING_DNS, correlation_id).await?;
        Ok(match (public_ip, hostname, dns_servers) {
            (Some(public_ip), Some(hostname), Some(dns_servers)) => {
                Some(ServerIdentity { public_ip, hostname, dns_servers })
            }
            _ => None,
        })
    }

    /// Step 3: create the first network. Idempotent while still at S3
    /// — a repeat call returns the already-created network instead of
    /// creating a second one.
    pub async fn step3_create_first_network(
        &self,
        req: NewNetworkRequest,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Network> {
        let step = self.current_step(correlation_id).await?;
        if step == SetupStep::S4 {
            return Err(WgpilotError::SetupAlreadyComplete);
        }
        if step == SetupStep::S3 {
            return self.first_network(correlation_id).await?.ok_or(WgpilotError::NetworkNotFound);
        }
        if step != SetupStep::S2 {
            return Err(WgpilotError::StepOrderViolation);
        }

        let network = self.orchestrator.create_network(req, correlation_id, cancel).await?;
        self.store
            .set_setting(SETTING_FIRST_NETWORK_ID, &network.id.to_string(), correlation_id)
            .await?;
        self.store.set_setting(SETTING_STEP, SetupStep::S3.as_str(), correlation_id).await?;
        info!(network_id = network.id, "setup step 3 complete: first network created");
        Ok(network)
    }

    /// Step 4: create the first peer on the first network and mark
    /// setup complete. Not idempotent; S4 is terminal.
    pub async fn step4_create_first_peer(
        &self,
        req: NewPeerRequest,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Peer> {
        let step = self.current_step(correlation_id).await?;
        if step == SetupStep::S4 {
            return Err(WgpilotError::SetupAlreadyComplete);
        }
        if step != SetupStep::S3 {
            return Err(WgpilotError::StepOrderViolation);
        }

        let network = self
            .first_network(correlation_id)
            .await?
            .ok_or_else(|| WgpilotError::InternalError("setup reached S3 with no recorded first network".to_string()))?;

        let peer = self.orchestrator.create_peer(network.id, req, correlation_id, cancel).await?;
        self.store.set_setting(SETTING_STEP, SetupStep::S4.as_str(), correlation_id).await?;
        info!(peer_id = peer.id, "setup step 4 complete: first peer created, setup finished");
        Ok(peer)
    }

    async fn first_network(&self, correlation_id: &str) -> Result<Option<Network>> {
        let Some(raw) = self.store.get_setting(SETTING_FIRST_NETWORK_ID, correlation_id).await? else {
            return Ok(None);
        };
        let id: i64 = raw
            .parse()
            .map_err(|_| WgpilotError::InternalError(format!("corrupt first-network marker: {raw}")))?;
        self.orchestrator.store().get_network(id, correlation_id).await.map_err(WgpilotError::from)
    }
}

fn generate_otp() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpilot_firewall::{FakeApplier, FirewallDriver};
    use wgpilot_store::test_support::temp_store;
    use wgpilot_store::types::{NetworkMode, PeerRole};
    use wgpilot_wireguard::FakeWireGuardDriver;

    /// A trivial stand-in for a real credential-hashing crate: the
    /// "hash" is just the plaintext itself, which is fine for exercising
    /// the state machine's transition logic without pulling in bcrypt.
    struct IdentityHasher;
    impl OtpHasher for IdentityHasher {
        fn hash(&self, otp: &str) -> String {
            otp.to_string()
        }
        fn verify(&self, otp: &str, hash: &str) -> bool {
            otp == hash
        }
    }

    async fn fresh_machine() -> (SetupMachine<FakeWireGuardDriver, FakeApplier>, tempfile::NamedTempFile) {
        let (store, file) = temp_store().await;
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(FakeWireGuardDriver::new()),
            Arc::new(FirewallDriver::new(FakeApplier::new())),
        ));
        (SetupMachine::new(store, orchestrator), file)
    }

    fn network_req() -> NewNetworkRequest {
        NewNetworkRequest {
            name: "Home VPN".to_string(),
            mode: NetworkMode::Gateway,
            subnet: "10.0.0.0/24".parse().expect("valid cidr"),
            listen_port: 51820,
            dns_servers: String::new(),
            nat_enabled: true,
            inter_peer_routing: false,
        }
    }

    fn peer_req() -> NewPeerRequest {
        NewPeerRequest {
            name: "Phone".to_string(),
            email: None,
            role: PeerRole::Client,
            site_networks: String::new(),
            endpoint: None,
            persistent_keepalive: None,
        }
    }

    #[tokio::test]
    async fn fresh_server_starts_at_s0_and_gates_mutations() {
        let (machine, _file) = fresh_machine().await;
        assert_eq!(machine.current_step("t").await.expect("step"), SetupStep::S0);
        let err = machine.ensure_complete("t").await.expect_err("not complete yet");
        assert_eq!(err.code(), "setup-required");
    }

    #[tokio::test]
    async fn full_linear_walk_reaches_s4_and_unblocks_mutations() {
        let (machine, _file) = fresh_machine().await;
        let hasher = IdentityHasher;
        let cancel = CancellationToken::new();

        let otp = machine
            .ensure_bootstrap_otp(&hasher, "t")
            .await
            .expect("bootstrap")
            .expect("otp generated on fresh server");

        machine
            .step1_create_admin(&otp, "admin", "$argon2id$fake", &hasher, "t")
            .await
            .expect("step 1");
        assert_eq!(machine.current_step("t").await.expect("step"), SetupStep::S1);

        machine
            .step2_save_identity(
                &ServerIdentity {
                    public_ip: "203.0.113.5".to_string(),
                    hostname: "vpn.example.com".to_string(),
                    dns_servers: "1.1.1.1".to_string(),
                },
                "t",
            )
            .await
            .expect("step 2");
        assert_eq!(machine.current_step("t").await.expect("step"), SetupStep::S2);

        let network = machine.step3_create_first_network(network_req(), "t", &cancel).await.expect("step 3");
        assert_eq!(network.interface, "wg0");
        assert_eq!(machine.current_step("t").await.expect("step"), SetupStep::S3);

        let peer = machine.step4_create_first_peer(peer_req(), "t", &cancel).await.expect("step 4");
        assert_eq!(peer.allowed_ips, "10.0.0.2/32");
        assert_eq!(machine.current_step("t").await.expect("step"), SetupStep::S4);

        machine.ensure_complete("t").await.expect("now unblocked");
    }

    #[tokio::test]
    async fn step1_rejects_wrong_otp() {
        let (machine, _file) = fresh_machine().await;
        let hasher = IdentityHasher;
        machine.ensure_bootstrap_otp(&hasher, "t").await.expect("bootstrap").expect("otp");

        let err = machine
            .step1_create_admin("not-the-otp", "admin", "hash", &hasher, "t")
            .await
            .expect_err("wrong otp must be rejected");
        assert_eq!(err.code(), "invalid-otp");
    }

    #[tokio::test]
    async fn step1_is_not_idempotent_once_consumed() {
        let (machine, _file) = fresh_machine().await;
        let hasher = IdentityHasher;
        let otp = machine.ensure_bootstrap_otp(&hasher, "t").await.expect("bootstrap").expect("otp");
        machine.step1_create_admin(&otp, "admin", "hash", &hasher, "t").await.expect("first call");

        let err = machine
            .step1_create_admin(&otp, "admin2", "hash2", &hasher, "t")
            .await
            .expect_err("second call after consumption must fail");
        assert_eq!(err.code(), "step-order-violation");
    }

    #[tokio::test]
    async fn out_of_order_steps_are_rejected() {
        let (machine, _file) = fresh_machine().await;
        let cancel = CancellationToken::new();

        let err = machine
            .step3_create_first_network(network_req(), "t", &cancel)
            .await
            .expect_err("cannot create network before admin/identity");
        assert_eq!(err.code(), "step-order-violation");

        let err = machine
            .step2_save_identity(
                &ServerIdentity { public_ip: String::new(), hostname: String::new(), dns_servers: String::new() },
                "t",
            )
            .await
            .expect_err("cannot save identity before admin");
        assert_eq!(err.code(), "step-order-violation");
    }

    #[tokio::test]
    async fn step2_is_idempotent_while_still_at_s2() {
        let (machine, _file) = fresh_machine().await;
        let hasher = IdentityHasher;
        let otp = machine.ensure_bootstrap_otp(&hasher, "t").await.expect("bootstrap").expect("otp");
        machine.step1_create_admin(&otp, "admin", "hash", &hasher, "t").await.expect("step 1");

        let identity = ServerIdentity {
            public_ip: "203.0.113.5".to_string(),
            hostname: "vpn.example.com".to_string(),
            dns_servers: "1.1.1.1".to_string(),
        };
        machine.step2_save_identity(&identity, "t").await.expect("first call");
        machine.step2_save_identity(&identity, "t").await.expect("repeat call while still at s2");
        assert_eq!(machine.current_step("t").await.expect("step"), SetupStep::S2);
        assert_eq!(machine.server_identity("t").await.expect("read back").expect("present"), identity);
    }

    #[tokio::test]
    async fn steps_after_s4_return_setup_already_complete() {
        let (machine, _file) = fresh_machine().await;
        let hasher = IdentityHasher;
        let cancel = CancellationToken::new();
        let otp = machine.ensure_bootstrap_otp(&hasher, "t").await.expect("bootstrap").expect("otp");
        machine.step1_create_admin(&otp, "admin", "hash", &hasher, "t").await.expect("step 1");
        machine
            .step2_save_identity(
                &ServerIdentity { public_ip: "1.2.3.4".to_string(), hostname: "h".to_string(), dns_servers: String::new() },
                "t",
            )
            .await
            .expect("step 2");
        machine.step3_create_first_network(network_req(), "t", &cancel).await.expect("step 3");
        machine.step4_create_first_peer(peer_req(), "t", &cancel).await.expect("step 4");

        let err = machine
            .step1_create_admin("anything", "admin2", "hash2", &hasher, "t")
            .await
            .expect_err("setup already complete");
        assert_eq!(err.code(), "setup-already-complete");

        let err = machine
            .step4_create_first_peer(peer_req(), "t", &cancel)
            .await
            .expect_err("setup already complete");
        assert_eq!(err.code(), "setup-already-complete");
    }

    #[tokio::test]
    async fn bootstrap_otp_is_issued_once() {
        let (machine, _file) = fresh_machine().await;
        let hasher = IdentityHasher;
        let first = machine.ensure_bootstrap_otp(&hasher, "t").await.expect("bootstrap").expect("otp");
        let second = machine.ensure_bootstrap_otp(&hasher, "t").await.expect("bootstrap");
        assert!(second.is_none(), "a hash already exists, no new otp should be issued");
        let _ = first;
    }
}
