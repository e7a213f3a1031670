pub mod registry;
pub mod router;

pub use registry::{ConnectionRegistry, GroupId};
pub use router::RoomRouter;
