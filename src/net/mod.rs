//! Request/response values and network access.

mod snapshot;
mod upstream;

pub use snapshot::{is_hop_by_hop, Request, ResponseSnapshot};
pub use upstream::{HttpUpstream, Network};
