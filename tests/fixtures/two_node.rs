//! Two-node test fixture for integration testing
//!
//! Provides a reusable pair of nodes on loopback with discovery disabled:
//! tests dial directly, so scenarios stay deterministic and CI-friendly.
//!
//! # Example
//!
//! ```no_run
//! use shario_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_basic_chat() {
//!     let fixture = TwoNodeFixture::connected().await;
//!     fixture.alice.send_text("global", "hi").await.unwrap();
//! }
//! ```

use shario_core::{Node, NodeConfig};
use shario_discovery::DiscoveryConfig;
use shario_transport::{PeerAddr, TransportConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// A pair of connected nodes, "Alice" and "Bob".
pub struct TwoNodeFixture {
    /// The dialing node
    pub alice: Node,
    /// The listening node
    pub bob: Node,
    alice_dir: TempDir,
    bob_dir: TempDir,
}

fn quiet_config(dir: &TempDir, tag: &str) -> NodeConfig {
    NodeConfig {
        config_dir: Some(dir.path().join("config")),
        downloads_dir: Some(dir.path().join("downloads")),
        process_tag: Some(tag.to_string()),
        transport: TransportConfig {
            enable_ipv6: false,
            ..TransportConfig::default()
        },
        discovery: DiscoveryConfig {
            enable_multicast: false,
            enable_dht: false,
            ..DiscoveryConfig::default()
        },
        ..NodeConfig::default()
    }
}

/// Listeners bind the unspecified address; dial them via loopback.
fn loopback(addr: &PeerAddr) -> PeerAddr {
    PeerAddr::new(
        SocketAddr::from(([127, 0, 0, 1], addr.addr.port())),
        addr.node_id,
    )
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

impl TwoNodeFixture {
    /// Create both nodes with nicknames "Alice" and "Bob", unconnected.
    pub async fn new() -> Self {
        let alice_dir = TempDir::new().expect("tempdir");
        let bob_dir = TempDir::new().expect("tempdir");

        let alice = Node::new(quiet_config(&alice_dir, "alice"))
            .await
            .expect("alice node");
        let bob = Node::new(quiet_config(&bob_dir, "bob"))
            .await
            .expect("bob node");

        alice.set_nickname("Alice").await.expect("nickname");
        bob.set_nickname("Bob").await.expect("nickname");

        Self {
            alice,
            bob,
            alice_dir,
            bob_dir,
        }
    }

    /// Create both nodes, start them, connect them and wait until each has
    /// learned the other's nickname.
    pub async fn connected() -> Self {
        let fixture = Self::new().await;
        fixture.connect().await;
        fixture
    }

    /// Start both nodes and dial Bob from Alice, waiting for the nickname
    /// sync both ways.
    pub async fn connect(&self) {
        self.alice.start().await.expect("alice start");
        let bob_addrs = self.bob.start().await.expect("bob start");

        self.alice
            .dial(&loopback(&bob_addrs[0]))
            .await
            .expect("dial");

        let alice = self.alice.clone();
        let bob_id = self.bob.node_id();
        wait_until("alice sees Bob's nickname", Duration::from_secs(15), || {
            let alice = alice.clone();
            async move {
                alice
                    .peers()
                    .await
                    .iter()
                    .any(|p| p.node_id == bob_id && p.nickname == "Bob")
            }
        })
        .await;

        let bob = self.bob.clone();
        let alice_id = self.alice.node_id();
        wait_until("bob sees Alice's nickname", Duration::from_secs(15), || {
            let bob = bob.clone();
            async move {
                bob.peers()
                    .await
                    .iter()
                    .any(|p| p.node_id == alice_id && p.nickname == "Alice")
            }
        })
        .await;
    }

    /// Path of Bob's downloads directory.
    pub fn bob_downloads(&self) -> PathBuf {
        self.bob_dir.path().join("downloads")
    }

    /// Create a file in Alice's scratch space with the given contents.
    pub fn alice_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.alice_dir.path().join(name);
        std::fs::write(&path, contents).expect("write test file");
        path
    }

    /// Stop both nodes.
    pub async fn shutdown(&self) {
        self.alice.stop().await;
        self.bob.stop().await;
    }
}
