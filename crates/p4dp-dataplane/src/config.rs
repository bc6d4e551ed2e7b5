//! Dataplane Configuration
//!
//! Static startup configuration: the (port, queue, lcore) assignment table,
//! table and socket counts, crypto mode selection and pool sizes. An invalid
//! configuration is rejected before any worker starts.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use p4dp_common::{
    AsyncMode, CryptoBackendKind, DataplaneError, DataplaneResult, LcoreId, LcoreParams, PortId,
    QueueId, RxQueue, SocketId, ASYNC_OP_POOL_SIZE, CRYPTO_CONTEXT_POOL_SIZE, CRYPTO_RING_SIZE,
    FAKE_CRYPTO_SLEEP_MULTIPLIER, MAX_ETH_PORTS, MAX_LCORES, MAX_LCORE_PARAMS,
    MAX_RX_QUEUE_PER_LCORE, MAX_RX_QUEUE_PER_PORT, NB_MBUF, NB_SOCKETS,
};
use serde::{Deserialize, Serialize};

/// Startup configuration of the dataplane
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneConfig {
    /// RX queue to lcore assignment
    pub lcore_params: Vec<LcoreParams>,
    /// Number of enabled ports
    pub nb_ports: usize,
    /// Number of lookup tables
    pub nb_tables: usize,
    /// Number of NUMA sockets holding table replicas
    pub nb_sockets: usize,
    /// Socket of each lcore (unlisted lcores run on socket 0)
    pub lcore_sockets: BTreeMap<LcoreId, SocketId>,
    /// Crypto scheduling strategy
    pub async_mode: AsyncMode,
    /// Engine used for crypto work
    pub crypto_backend: CryptoBackendKind,
    /// Offload only every Nth crypto packet (1 = all)
    pub crypto_every_n: u32,
    /// Depth of each lcore's device rings
    pub crypto_ring_size: usize,
    /// Suspended flows per lcore
    pub crypto_context_pool_size: usize,
    /// Ops awaiting completion per lcore
    pub async_op_pool_size: usize,
    /// Packet buffers per lcore
    pub mbuf_pool_size: usize,
    /// Time spent per op by the fake engine
    pub fake_crypto_delay_ns: u64,
    /// AEAD key
    #[serde(skip_serializing)]
    pub crypto_key: [u8; 32],
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            lcore_params: vec![LcoreParams::new(0, 0, 0)],
            nb_ports: 1,
            nb_tables: 1,
            nb_sockets: 1,
            lcore_sockets: BTreeMap::new(),
            async_mode: AsyncMode::default(),
            crypto_backend: CryptoBackendKind::default(),
            crypto_every_n: 1,
            crypto_ring_size: CRYPTO_RING_SIZE,
            crypto_context_pool_size: CRYPTO_CONTEXT_POOL_SIZE,
            async_op_pool_size: ASYNC_OP_POOL_SIZE,
            mbuf_pool_size: NB_MBUF,
            fake_crypto_delay_ns: FAKE_CRYPTO_SLEEP_MULTIPLIER,
            crypto_key: [0; 32],
        }
    }
}

fn invalid(msg: impl Into<String>) -> DataplaneError {
    DataplaneError::Config(msg.into())
}

impl DataplaneConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> DataplaneResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| invalid(format!("parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the queue/lcore mapping and resource sizes
    pub fn validate(&self) -> DataplaneResult<()> {
        if self.lcore_params.is_empty() {
            return Err(invalid("no lcore params"));
        }
        if self.lcore_params.len() > MAX_LCORE_PARAMS {
            return Err(invalid(format!(
                "{} lcore params exceed the maximum of {}",
                self.lcore_params.len(),
                MAX_LCORE_PARAMS
            )));
        }
        if self.nb_ports == 0 || self.nb_ports > MAX_ETH_PORTS {
            return Err(invalid(format!("nb_ports must be in 1..={}", MAX_ETH_PORTS)));
        }
        if self.nb_tables == 0 {
            return Err(invalid("nb_tables must be non-zero"));
        }
        if self.nb_sockets == 0 || self.nb_sockets > NB_SOCKETS {
            return Err(invalid(format!("nb_sockets must be in 1..={}", NB_SOCKETS)));
        }

        let mut seen = HashSet::new();
        let mut per_lcore: BTreeMap<LcoreId, usize> = BTreeMap::new();
        for p in &self.lcore_params {
            if p.port_id as usize >= self.nb_ports {
                return Err(invalid(format!("port {} is not enabled", p.port_id)));
            }
            if p.queue_id as usize >= MAX_RX_QUEUE_PER_PORT {
                return Err(invalid(format!(
                    "queue {} on port {} exceeds {} RX queues per port",
                    p.queue_id, p.port_id, MAX_RX_QUEUE_PER_PORT
                )));
            }
            if p.lcore_id as usize >= MAX_LCORES {
                return Err(invalid(format!("lcore {} out of range", p.lcore_id)));
            }
            if !seen.insert((p.port_id, p.queue_id)) {
                return Err(invalid(format!(
                    "queue {} on port {} assigned twice",
                    p.queue_id, p.port_id
                )));
            }
            let n = per_lcore.entry(p.lcore_id).or_default();
            *n += 1;
            if *n > MAX_RX_QUEUE_PER_LCORE {
                return Err(invalid(format!(
                    "lcore {} has more than {} RX queues",
                    p.lcore_id, MAX_RX_QUEUE_PER_LCORE
                )));
            }
        }

        for (&lcore, &socket) in &self.lcore_sockets {
            if !per_lcore.contains_key(&lcore) {
                return Err(invalid(format!("socket given for unused lcore {}", lcore)));
            }
            if socket >= self.nb_sockets {
                return Err(invalid(format!("lcore {} placed on unknown socket {}", lcore, socket)));
            }
        }

        if self.crypto_every_n == 0 {
            return Err(invalid("crypto_every_n must be non-zero"));
        }
        if self.mbuf_pool_size == 0 {
            return Err(invalid("mbuf_pool_size must be non-zero"));
        }
        if self.crypto_backend == CryptoBackendKind::Real && self.crypto_key == [0; 32] {
            return Err(invalid("real crypto backend needs a non-zero crypto_key"));
        }
        match self.async_mode {
            AsyncMode::Context if self.crypto_context_pool_size == 0 => {
                return Err(invalid("crypto_context_pool_size must be non-zero"));
            }
            AsyncMode::PollDevice if self.crypto_ring_size == 0 || self.async_op_pool_size == 0 => {
                return Err(invalid("crypto ring and async op pool must be non-zero"));
            }
            _ => {}
        }
        Ok(())
    }

    /// Lcores with at least one RX queue, ascending
    pub fn lcores(&self) -> Vec<LcoreId> {
        self.lcore_params
            .iter()
            .map(|p| p.lcore_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// RX queues polled by `lcore`, in table order
    pub fn rx_queues_for(&self, lcore: LcoreId) -> Vec<RxQueue> {
        self.lcore_params
            .iter()
            .filter(|p| p.lcore_id == lcore)
            .map(|p| RxQueue {
                port_id: p.port_id,
                queue_id: p.queue_id,
            })
            .collect()
    }

    /// RX queues to configure on `port` (highest assigned queue id + 1)
    pub fn nb_rx_queues_for_port(&self, port: PortId) -> usize {
        self.lcore_params
            .iter()
            .filter(|p| p.port_id == port)
            .map(|p| p.queue_id as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// TX queue `lcore` uses on every port: its rank among the lcores
    pub fn tx_queue_for(&self, lcore: LcoreId) -> Option<QueueId> {
        self.lcores()
            .iter()
            .position(|&l| l == lcore)
            .map(|rank| rank as QueueId)
    }

    /// NUMA socket of `lcore`
    pub fn socket_of(&self, lcore: LcoreId) -> SocketId {
        self.lcore_sockets.get(&lcore).copied().unwrap_or(0)
    }

    /// Completions drained per poll
    pub fn crypto_burst_size(&self) -> usize {
        self.async_mode.crypto_burst_size()
    }

    /// Per-op delay of the fake engine
    pub fn fake_crypto_delay(&self) -> Duration {
        Duration::from_nanos(self.fake_crypto_delay_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_lcores() -> DataplaneConfig {
        DataplaneConfig {
            lcore_params: vec![
                LcoreParams::new(0, 0, 2),
                LcoreParams::new(0, 1, 2),
                LcoreParams::new(1, 0, 3),
                LcoreParams::new(1, 2, 3),
            ],
            nb_ports: 2,
            nb_sockets: 2,
            lcore_sockets: BTreeMap::from([(3, 1)]),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_is_valid() {
        let config = DataplaneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.crypto_ring_size, 32);
        assert_eq!(config.crypto_context_pool_size, 1);
        assert_eq!(config.crypto_burst_size(), 1);
    }

    #[test]
    fn test_derived_queries() {
        let config = two_lcores();
        config.validate().unwrap();

        assert_eq!(config.lcores(), vec![2, 3]);
        assert_eq!(
            config.rx_queues_for(3),
            vec![
                RxQueue { port_id: 1, queue_id: 0 },
                RxQueue { port_id: 1, queue_id: 2 },
            ]
        );
        assert_eq!(config.nb_rx_queues_for_port(0), 2);
        assert_eq!(config.nb_rx_queues_for_port(1), 3);
        assert_eq!(config.tx_queue_for(3), Some(1));
        assert_eq!(config.tx_queue_for(9), None);
        assert_eq!(config.socket_of(2), 0);
        assert_eq!(config.socket_of(3), 1);
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "lcore_params": [
                {"port_id": 0, "queue_id": 0, "lcore_id": 1},
                {"port_id": 1, "queue_id": 0, "lcore_id": 1}
            ],
            "nb_ports": 2,
            "nb_tables": 4,
            "async_mode": "poll_device",
            "crypto_backend": "fake"
        }"#;
        let config = DataplaneConfig::from_json_str(json).unwrap();
        assert_eq!(config.nb_tables, 4);
        assert_eq!(config.async_mode, AsyncMode::PollDevice);
        assert_eq!(config.crypto_backend, CryptoBackendKind::Fake);
        assert_eq!(config.crypto_burst_size(), 64);
        assert_eq!(config.fake_crypto_delay(), Duration::from_nanos(5000));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            DataplaneConfig::from_json_str("{\"nb_ports\": \"x\"}"),
            Err(DataplaneError::Config(_))
        ));
    }

    #[test]
    fn test_real_backend_needs_a_key() {
        let mut config = DataplaneConfig {
            crypto_backend: CryptoBackendKind::Real,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DataplaneError::Config(_))));

        config.crypto_key = [0x5A; 32];
        assert!(config.validate().is_ok());
        assert_eq!(DataplaneConfig::default().crypto_backend, CryptoBackendKind::Fake);
    }

    #[test]
    fn test_key_not_serialized() {
        let config = DataplaneConfig {
            crypto_key: [0xAB; 32],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("crypto_key"));
    }

    #[test]
    fn test_rejects_invalid_mappings() {
        let cases: Vec<DataplaneConfig> = vec![
            DataplaneConfig {
                lcore_params: vec![],
                ..Default::default()
            },
            DataplaneConfig {
                lcore_params: vec![LcoreParams::new(1, 0, 0)],
                ..Default::default()
            },
            DataplaneConfig {
                lcore_params: vec![LcoreParams::new(0, MAX_RX_QUEUE_PER_PORT as u16, 0)],
                ..Default::default()
            },
            DataplaneConfig {
                lcore_params: vec![LcoreParams::new(0, 0, 0), LcoreParams::new(0, 0, 1)],
                ..Default::default()
            },
            DataplaneConfig {
                lcore_params: (0..17).map(|q| LcoreParams::new(0, q, 0)).collect(),
                ..Default::default()
            },
            DataplaneConfig {
                nb_tables: 0,
                ..Default::default()
            },
            DataplaneConfig {
                lcore_sockets: BTreeMap::from([(0, 1)]),
                ..Default::default()
            },
            DataplaneConfig {
                lcore_sockets: BTreeMap::from([(5, 0)]),
                ..Default::default()
            },
            DataplaneConfig {
                async_mode: AsyncMode::PollDevice,
                crypto_ring_size: 0,
                ..Default::default()
            },
            DataplaneConfig {
                async_mode: AsyncMode::Context,
                crypto_context_pool_size: 0,
                ..Default::default()
            },
        ];

        for (i, config) in cases.iter().enumerate() {
            assert!(
                matches!(config.validate(), Err(DataplaneError::Config(_))),
                "case {} should be rejected",
                i
            );
        }
    }
}
