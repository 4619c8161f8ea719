pub mod addons;
pub mod api;
pub mod cluster;
pub mod context;
pub mod credentials;
pub mod error;
pub mod helpers;
pub mod metadata;
pub mod postgres;
pub mod providers;
pub mod resources;
pub mod site;
pub mod snapshots;
pub mod tenant;
