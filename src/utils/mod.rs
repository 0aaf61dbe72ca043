pub mod command;
pub mod corpus;
pub mod file;
pub mod materialize;
pub mod partition;
pub mod plan_store;
pub mod scheduler;
pub mod system;
