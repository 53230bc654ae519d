//! Shared infrastructure for Shario integration tests.

pub mod fixtures {
    pub mod two_node;

    pub use two_node::TwoNodeFixture;
}
