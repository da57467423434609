// Database access: connection pool, status entitlements, spec label writes.

pub mod pool;
pub mod spec;
pub mod status;
