//! Client side of the AOT compilation cache.
//!
//! [`AotDeserializer`] caches the serialization records a server sends,
//! verifies each against the live runtime through [`ClassRuntime`], and
//! rewrites compiled artifacts so they can be installed in this process.
//! How a fix-up cell is encoded is up to the [`OffsetResolver`]: durable
//! store offsets, or a process-local `(id, kind)` encoding.

pub mod config;
pub mod deserializer;
pub mod resolver;
pub mod runtime;
pub mod sim;
pub mod stats;

pub use config::{DeserializerConfig, ResolverStrategy};
pub use deserializer::{
    AotDeserializer, CacheOutcome, InstalledArtifact, KnownIdsUpdate, RecordState,
};
pub use resolver::{
    DurableStore, DurableStoreResolver, InMemoryResolver, OffsetResolver, SelectedResolver,
};
pub use runtime::{ClassHandle, ClassRuntime, LoaderHandle, LocalHandle, MethodHandle, ThunkHandle};
pub use sim::{InMemoryDurableStore, SimulatedRuntime};
pub use stats::{DeserializerStatistics, DeserializerStatisticsSnapshot};
