// hubsync-daemon: syncs git-stored cluster assignments into the hub-of-hubs database.

pub mod authz;
pub mod cluster_set;
pub mod config;
pub mod db;
pub mod git;
pub mod runtime;
pub mod subscription;
pub mod syncer;
pub mod walker;
