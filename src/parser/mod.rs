pub mod json;
pub mod links;
