mod project;
mod session;

pub use project::Project;
pub use session::Session;
