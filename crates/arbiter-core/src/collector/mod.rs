//! Usage collection for Linux cgroups (v1) and processes.
//!
//! Cumulative counters are read through the `FileSystem` trait so the whole
//! pipeline runs against an in-memory mock in tests:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Collector                         │
//! │  ┌──────────────────┐      ┌─────────────────────────┐  │
//! │  │  CgroupAdapter   │      │      ProcSampler        │  │
//! │  │  - user slices   │      │  - /proc/[pid]/stat     │  │
//! │  │  - user.slice    │      │  - /proc/[pid]/status   │  │
//! │  │  - quota files   │      │  - /proc/[pid]/smaps    │  │
//! │  └────────┬─────────┘      └───────────┬─────────────┘  │
//! │           └──────────────┬─────────────┘                │
//! │                   ┌──────▼──────┐                       │
//! │                   │  FileSystem │ (trait)               │
//! │                   └──────┬──────┘                       │
//! └──────────────────────────┼──────────────────────────────┘
//!                ┌───────────┴───────────┐
//!         ┌──────▼──────┐         ┌──────▼──────┐
//!         │   RealFs    │         │   MockFs    │
//!         │  (Linux)    │         │  (testing)  │
//!         └─────────────┘         └─────────────┘
//! ```

pub mod cgroup;
mod collect;
pub mod mock;
pub mod procfs;
pub mod sampler;
pub mod traits;

pub use cgroup::{CgroupAdapter, SampleError};
pub use collect::Collector;
pub use mock::MockFs;
pub use procfs::ProcSampler;
pub use traits::{FileSystem, RealFs};
