pub mod enrich;
pub mod status;
