//! lxforge: provision LXC containers and per-user Python virtual
//! environments, and run commands inside either.

pub mod container;
pub mod orchestrate;
pub mod settings;
