pub mod offset_store;
pub mod registry;
