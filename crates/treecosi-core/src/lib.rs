//! # treecosi-core
//!
//! Scalable collective signing over a two-level tree of signers.
//!
//! A designated leader and a roster of N signers produce one aggregate
//! Schnorr-style signature over a proposal, together with a bit mask
//! naming which signers took part. The roster is partitioned into K
//! shards rooted at the leader, so fan-out, aggregation and fan-in are
//! split into K roughly balanced subtrees, and the leader rotates a
//! shard's subleader out when it stops responding.
//!
//! ## Building blocks
//!
//! - [`tree`]: shard construction and subleader rotation
//! - [`cosi`]: commit / challenge / response primitives and masks
//! - [`subprotocol`]: the per-node four-phase engine
//! - [`protocol`]: the leader's supervisory loop
//! - [`overlay`]: the channel runtime the instances run on
//!
//! ## Example
//!
//! ```rust,ignore
//! use treecosi_core::{collective_sign, LocalRunner, ProtocolConfig};
//!
//! let runner = Arc::new(LocalRunner::new(5)?);
//! let signature = collective_sign(
//!     runner.clone(),
//!     runner.roster().clone(),
//!     5,
//!     runner.keypair(0)?,
//!     b"proposal",
//!     ProtocolConfig::default(),
//! ).await?;
//! ```

pub mod cosi;
pub mod error;
pub mod messages;
pub mod overlay;
pub mod protocol;
pub mod subprotocol;
pub mod tree;

pub use error::{Error, Result};
pub use overlay::{EngineConfig, Launcher, LocalRunner, ShardHandle};
pub use protocol::{
    collective_sign, ProtocolConfig, RootHandle, RootProtocol, DEFAULT_LEAVES_TIMEOUT,
    DEFAULT_PROTOCOL_TIMEOUT, DEFAULT_SUBLEADER_TIMEOUT,
};
pub use tree::{build_shards, build_subtree, Roster, Signer, Tree};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
