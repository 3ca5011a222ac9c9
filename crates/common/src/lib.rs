// cowrite-common: shared protocol and document types for the Cowrite workspace

pub mod doc;
pub mod protocol;
pub mod sheet;
pub mod types;
