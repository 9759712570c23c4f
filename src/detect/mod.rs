// Content-type detection and the response admission filter.

pub mod mime;
