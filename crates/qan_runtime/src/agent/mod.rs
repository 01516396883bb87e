pub mod comm;
pub mod directory;
pub mod router;
pub mod server;

pub use comm::AgentConn;
pub use directory::Directory;
pub use router::CommandRouter;
pub use server::AgentServer;
