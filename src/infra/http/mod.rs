mod admin;
mod middleware;
mod origin;
mod public;

pub use admin::{AdminState, build_admin_router};
pub use middleware::RequestContext;
pub use origin::OriginState;
pub use public::build_public_router;
