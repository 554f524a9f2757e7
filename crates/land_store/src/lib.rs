mod local;
mod memory;
mod util;

pub use local::LocalDocumentStore;
pub use memory::InMemoryDocumentStore;
