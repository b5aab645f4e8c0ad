pub mod backup;
pub mod config;
pub mod detector;
pub mod entitlement;
pub mod handle;
pub mod installer;
pub mod ledger;
pub mod logs;
pub mod notifier;
pub mod os;
pub mod process;
pub mod sampler;
