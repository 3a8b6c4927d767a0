//! Shared memory primitives for parallel retrieve endpoints.
//!
//! # Primitives
//!
//! - [`Region`] / [`HeapRegion`]: raw views of mapped (or heap) memory
//! - [`ByteRing`]: single-producer single-consumer byte stream with explicit
//!   attach/finish/detach states for both ends
//! - [`ShmMapping`]: file-backed or anonymous `MAP_SHARED` memory (`std`)
//! - [`Latch`]: cross-process sticky wakeup flag (`std`)
//! - [`ShmRwLock`]: cross-process reader/writer lock (`std`)
//! - [`futex`]: the wait/wake calls the above are built on (`std`)
//!
//! Everything that lives in shared memory is `repr(C)` and valid when
//! all-zero, so a freshly created mapping needs no further initialization
//! beyond what the owning structure writes explicitly.
//!
//! # Loom Testing
//!
//! ```text
//! RUSTFLAGS="--cfg loom" cargo test -p retrieve-shm --release loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod byte_ring;
pub mod region;
pub mod sync;

#[cfg(feature = "std")]
pub mod futex;
#[cfg(feature = "std")]
pub mod latch;
#[cfg(feature = "std")]
pub mod mapping;
#[cfg(feature = "std")]
pub mod process;
#[cfg(feature = "std")]
pub mod rwlock;

pub use byte_ring::{
    ByteConsumer, ByteProducer, ByteRing, ByteRingHeader, ReceiverState, RingError, RingStatus,
    SenderState,
};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;

#[cfg(feature = "std")]
pub use latch::Latch;
#[cfg(feature = "std")]
pub use mapping::ShmMapping;
#[cfg(feature = "std")]
pub use process::{current_pid, process_alive};
#[cfg(feature = "std")]
pub use rwlock::{ShmReadGuard, ShmRwLock, ShmWriteGuard};
