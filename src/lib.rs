pub mod archive;
pub mod audit;
pub mod backup;
pub mod broker;
pub mod drill;
pub mod export;
pub mod integrity;
pub mod logging;
pub mod restore;
pub mod snapshot;
pub mod state;
pub mod store;
