mod category;
mod coordinator;
mod entry;
mod key;
mod maintenance;
pub mod policy;
mod store;
mod writer;

pub use category::{Admission, CacheCategory, CategoryState, StorageRoots};
pub use coordinator::{
    CacheCoordinator, CacheStats, CategoryStats, CleanupResult, CoordinatorOptions, ImageCache,
    SweepTicket, SweepTrigger,
};
pub use entry::{CacheBudget, CacheEntry, ItemCleanupResult, Usage};
pub use key::{CacheKey, CategoryKind};
pub use store::FileStore;
