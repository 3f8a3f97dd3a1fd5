mod its;
mod json_file;
mod outputs;
mod registry;
mod streams;

pub use self::{
    its::{ItsClient, ItsCctvRow},
    outputs::{JsonOutputCatalog, OutputCatalog},
    registry::{JsonTaskRegistry, TaskRegistry},
    streams::{JsonStreamCatalog, StreamCatalog},
};
