//! Device runtime: the host/device primitives everything else is built on
//! (`spec.md` §2, "rt" component).

pub mod allocator;
pub mod arena;
pub mod backend;
pub mod buffer;
pub mod dispatch;
pub mod event;
pub mod graph;
pub mod memory;
pub mod stream;
pub mod telemetry;

pub use allocator::HostAllocator;
pub use arena::{ArenaAllocation, DeviceArena};
pub use backend::{Backend, DeviceCapabilities, SafetyState};
pub use buffer::Buffer;
pub use dispatch::{Dispatcher, DispatcherStats};
pub use event::Event;
pub use graph::{Graph, GraphNode, InstantiatedGraph};
pub use memory::{checked_range, DType, MemoryUsage, QuantDescriptor};
pub use stream::Stream;
pub use telemetry::{now_ns, Counter, ScopedTimer};
