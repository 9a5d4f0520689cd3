pub use addressable_pool::{AddressablePool, PoolError};
pub use object_pool::ObjectPool;

mod addressable_pool;
mod object_pool;
