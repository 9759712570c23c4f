// Local HTTP front end for the cache.

pub mod handler;
