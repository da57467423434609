// hubsync-common: domain types and pure algorithms shared by the hubsync crates

pub mod assignment;
pub mod document;
pub mod interval;
pub mod labels;
