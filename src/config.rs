//! # Configuration
//!
//! Typed configuration for a node: bootstrap peers, the cluster keyring and
//! timer intervals. Parsing a YAML file into [`ConfigFile`] is the job of an
//! external loader; this module owns the shape of that file, the Base58
//! decoding at the boundary, and the runtime types the rest of the crate
//! consumes.
//!
//! A cluster entry always carries the symmetric secret. The Schnorr keypair
//! is optional in both halves: without the public key the node accepts
//! writes unverified, without the private key it cannot author cluster
//! signatures.

use std::collections::HashMap;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::Rng;
use serde::Deserialize;

use crate::envelope::ClusterId;
use crate::identity::NodeId;

/// Timer intervals and deadlines. Maintenance timers get up to 100% uniform
/// jitter on top via [`jittered`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timers {
    /// Liveness review sweep.
    #[serde(with = "secs")]
    pub review_interval: Duration,
    /// Self-neighbourhood refresh lookups.
    #[serde(with = "secs")]
    pub neighbourhood_interval: Duration,
    /// Per-bucket refresh sweep.
    #[serde(with = "secs")]
    pub bucket_interval: Duration,
    /// A bucket older than this is refreshed.
    #[serde(with = "secs")]
    pub bucket_max_idle: Duration,
    /// A peer silent longer than this is downgraded, then evicted.
    #[serde(with = "secs")]
    pub liveness_threshold: Duration,
    /// Per-query response deadline.
    #[serde(with = "secs")]
    pub query_timeout: Duration,
    /// Global deadline of one search.
    #[serde(with = "secs")]
    pub search_deadline: Duration,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            review_interval: Duration::from_secs(5 * 60),
            neighbourhood_interval: Duration::from_secs(5 * 60),
            bucket_interval: Duration::from_secs(3 * 60),
            bucket_max_idle: Duration::from_secs(15 * 60),
            liveness_threshold: Duration::from_secs(15 * 60),
            query_timeout: Duration::from_secs(5),
            search_deadline: Duration::from_secs(30),
        }
    }
}

mod secs {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Add up to 100% uniform jitter so restarted clusters do not tick in
/// lockstep.
pub fn jittered(base: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
    base + Duration::from_millis(extra)
}

/// A bootstrap peer as it appears in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapEntry {
    pub host: String,
    pub port: u16,
    /// Base58 raw node id.
    pub node_id: String,
}

impl BootstrapEntry {
    pub fn node_id(&self) -> Result<NodeId, ConfigError> {
        NodeId::from_base58(&self.node_id).map_err(|_| ConfigError::BadId(self.node_id.clone()))
    }
}

/// One cluster's key material as it appears in the config file, Base58.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterKeysFile {
    pub secret: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
}

/// The whole config file: `clusters` maps Base58 cluster ids to keys.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub bootstrap_nodes: Vec<BootstrapEntry>,
    pub clusters: HashMap<String, ClusterKeysFile>,
    #[serde(default)]
    pub timers: Timers,
}

/// Decoded key material for one cluster.
#[derive(Clone)]
pub struct ClusterKeys {
    pub id: ClusterId,
    pub secret: [u8; 32],
    /// Serialized Schnorr public key gating writes, when the cluster is
    /// write-gated.
    pub public_key: Option<Vec<u8>>,
    /// Private half, when this node may author cluster signatures.
    pub private_key: Option<SigningKey>,
}

impl std::fmt::Debug for ClusterKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterKeys")
            .field("id", &self.id)
            .field("public_key", &self.public_key.is_some())
            .field("private_key", &self.private_key.is_some())
            .finish()
    }
}

impl ClusterKeys {
    /// Decode a config-file cluster entry.
    pub fn from_file(id_b58: &str, file: &ClusterKeysFile) -> Result<Self, ConfigError> {
        let id = ClusterId::from_base58(id_b58).map_err(|_| ConfigError::BadId(id_b58.into()))?;
        let secret_bytes = decode_b58(&file.secret)?;
        let secret: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| ConfigError::BadSecret)?;

        let public_key = file.public_key.as_deref().map(decode_b58).transpose()?;
        let private_key = file
            .private_key
            .as_deref()
            .map(|s| {
                let bytes = decode_b58(s)?;
                let arr: [u8; 32] = bytes.try_into().map_err(|_| ConfigError::BadSecret)?;
                Ok::<_, ConfigError>(SigningKey::from_bytes(&arr))
            })
            .transpose()?;

        Ok(Self {
            id,
            secret,
            public_key,
            private_key,
        })
    }

    /// Fresh keys for a standalone cluster: random id and secret, a local
    /// Schnorr keypair for write gating.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill(&mut secret);
        let private = SigningKey::generate(&mut rand::rngs::OsRng);
        Self {
            id: crate::identity::gen_node_id(),
            secret,
            public_key: Some(private.verifying_key().to_bytes().to_vec()),
            private_key: Some(private),
        }
    }
}

fn decode_b58(s: &str) -> Result<Vec<u8>, ConfigError> {
    bs58::decode(s)
        .into_vec()
        .map_err(|_| ConfigError::BadBase58(s.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    BadBase58(String),
    BadId(String),
    /// A secret or private key did not decode to 32 bytes.
    BadSecret,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::BadBase58(s) => write!(f, "not Base58: {s:?}"),
            ConfigError::BadId(s) => write!(f, "not a 32-byte Base58 id: {s:?}"),
            ConfigError::BadSecret => write!(f, "secrets and private keys must be 32 bytes"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::gen_node_id;

    #[test]
    fn timer_defaults() {
        let timers = Timers::default();
        assert_eq!(timers.review_interval, Duration::from_secs(300));
        assert_eq!(timers.bucket_interval, Duration::from_secs(180));
        assert_eq!(timers.liveness_threshold, Duration::from_secs(900));
        assert_eq!(timers.query_timeout, Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_double() {
        let base = Duration::from_secs(60);
        for _ in 0..100 {
            let j = jittered(base);
            assert!(j >= base && j <= base * 2);
        }
    }

    #[test]
    fn cluster_keys_decode_from_file_entry() {
        let id = gen_node_id();
        let private = SigningKey::generate(&mut rand::rngs::OsRng);
        let file = ClusterKeysFile {
            secret: bs58::encode([7u8; 32]).into_string(),
            public_key: Some(bs58::encode(private.verifying_key().to_bytes()).into_string()),
            private_key: Some(bs58::encode(private.to_bytes()).into_string()),
        };

        let keys = ClusterKeys::from_file(&id.to_base58(), &file).unwrap();
        assert_eq!(keys.id, id);
        assert_eq!(keys.secret, [7u8; 32]);
        assert!(keys.public_key.is_some());
        assert!(keys.private_key.is_some());
    }

    #[test]
    fn bad_entries_are_rejected() {
        let file = ClusterKeysFile {
            secret: "!!!".into(),
            public_key: None,
            private_key: None,
        };
        assert!(ClusterKeys::from_file("zzz", &file).is_err());

        let short = ClusterKeysFile {
            secret: bs58::encode([1u8; 4]).into_string(),
            public_key: None,
            private_key: None,
        };
        let id = gen_node_id().to_base58();
        assert_eq!(
            ClusterKeys::from_file(&id, &short).unwrap_err(),
            ConfigError::BadSecret
        );
    }

    #[test]
    fn bootstrap_entry_decodes_node_id() {
        let id = gen_node_id();
        let entry = BootstrapEntry {
            host: "127.0.0.1".into(),
            port: 4471,
            node_id: id.to_base58(),
        };
        assert_eq!(entry.node_id().unwrap(), id);
    }
}
