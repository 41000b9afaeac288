//! Otto daemon library: worker pool, trigger loops and the HTTP facade.

pub mod http;
pub mod triggers;
pub mod worker;
