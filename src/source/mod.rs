// Data source abstraction: the network side of the cache.

pub mod http_source;
pub mod traits;
