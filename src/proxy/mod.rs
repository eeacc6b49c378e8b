//! HTTP reverse proxy in front of the balanced backend pool

mod handler;
pub mod rewrite;
pub mod server;

pub use handler::ProxyHandler;
pub use rewrite::{merge_query, single_joining_slash, target_url, PathRewriter};
pub use server::{build_router, run_server, ProxyState};
