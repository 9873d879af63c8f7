//! Undertow Simulation - Deterministic swarm engine for streaming tests.
//!
//! Stands in for a real torrent engine behind the `undertow-core` traits.
//! Pieces arrive at a configurable rate in the order the engine's priorities
//! and deadlines ask for, so buffering and reader scheduling can be exercised
//! end to end without a network.
//!
//! Every random decision draws from a seeded ChaCha8 generator: the same
//! seed and the same sequence of ticks always produce the same download.

pub mod driver;
pub mod engine;
pub mod session;
pub mod storage;
pub mod swarm;

pub use driver::spawn_driver;
pub use engine::{SimulatedEngine, TickReport};
pub use session::SimEngineSession;
pub use storage::{FixedMemoryProbe, SimMemoryStorage};
pub use swarm::{SimTorrent, SwarmConfig};
